use solana_sdk::pubkey::Pubkey;
use std::{num::NonZeroU32, time::Duration};

use crate::vesting::VestingSchedule;

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Transfer,
    Vesting(VestingSchedule),
}

/// Immutable, batch-wide settings shared by every job.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub mint: Pubkey,
    pub decimals: u8,
    pub mode: Mode,
    pub program_id: Pubkey,
    /// Micro-lamports per compute unit; no price instruction when `None`.
    pub priority_fee: Option<u64>,
    pub devnet: bool,
}

impl BatchConfig {
    pub fn is_vesting(&self) -> bool {
        matches!(self.mode, Mode::Vesting(_))
    }
}

/// Tuning knobs for the worker pool, send gate and retry loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    pub send_concurrency: usize,
    pub send_rate: NonZeroU32,
    /// Blocks past `last_valid_block_height` we keep polling before declaring expiry.
    pub grace_blocks: u64,
    pub poll_interval: Duration,
    pub expiry_backoff: Duration,
    /// Oversized first-pass budget so the simulation itself does not run out.
    pub simulation_compute_units: u32,
    /// Used when the simulation does not report consumption.
    pub default_compute_units: u32,
    /// Headroom added on top of simulated consumption, in percent.
    pub compute_unit_margin_pct: u64,
    /// `None` keeps rebuilding expired transactions forever.
    pub max_expiry_cycles: Option<u32>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            send_concurrency: 2,
            send_rate: NonZeroU32::MIN.saturating_add(1),
            grace_blocks: 15,
            poll_interval: Duration::from_millis(500),
            expiry_backoff: Duration::from_secs(5),
            simulation_compute_units: 500_000,
            default_compute_units: 220_000,
            compute_unit_margin_pct: 10,
            max_expiry_cycles: None,
        }
    }
}
