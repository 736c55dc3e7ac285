//! Vesting grants: schedule math, grant-creation instructions and the
//! existing-grant lookup that keeps re-runs from duplicating contracts.

use async_trait::async_trait;
use clap::ValueEnum;
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey,
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
    system_program, sysvar,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use std::sync::Arc;

use crate::instructions::{InstructionBuilder, PreparedInstructions};
use crate::ledger::{AccountFilter, LedgerClient, LedgerResult};
use crate::recipients::RecipientRecord;

pub const MAINNET_PROGRAM_ID: Pubkey = pubkey!("strmRqUCoQUgGUan5YhzUZa6KqdzwX5L6FpUxfmKg5m");
pub const DEVNET_PROGRAM_ID: Pubkey = pubkey!("HqDGZjaVRXJ9MGRQEw7qDc2rAr6iH1n1kAQdCZaCMfMZ");
pub const TREASURY: Pubkey = pubkey!("5SEpbdjFK5FxwTvfsGMXVQTD2v4M2c5tyRTxhdsPkgDw");
pub const WITHDRAWOR: Pubkey = pubkey!("wdrwhnCv4pzW8beKsbPa4S2UDZrhenjg16KJdKSpb5u");
pub const FEE_ORACLE: Pubkey = pubkey!("B743wFVk2pCYhV91cn287e1xY7f1vt4gdY48hhNiuQmT");

/// Byte offsets of the recipient and mint fields inside a grant's metadata account.
pub const RECIPIENT_OFFSET: usize = 113;
pub const MINT_OFFSET: usize = 177;

const ESCROW_SEED: &[u8] = b"strm";
const NAME_LEN: usize = 64;
/// Zeroed tail the program reserves after the create arguments.
const CREATE_PADDING: [u8; 10] = [0; 10];
const BASIS_POINTS: u128 = 10_000;

pub fn default_program_id(devnet: bool) -> Pubkey {
    if devnet {
        DEVNET_PROGRAM_ID
    } else {
        MAINNET_PROGRAM_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DurationUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl DurationUnit {
    pub fn seconds(self) -> u64 {
        match self {
            DurationUnit::Second => 1,
            DurationUnit::Minute => 60,
            DurationUnit::Hour => 60 * 60,
            DurationUnit::Day => 60 * 60 * 24,
            DurationUnit::Week => 60 * 60 * 24 * 7,
            DurationUnit::Month => 60 * 60 * 24 * 30,
            DurationUnit::Year => 60 * 60 * 24 * 365,
        }
    }
}

/// Shared schedule every grant in the batch is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct VestingSchedule {
    /// Unix seconds; 0 starts the grant immediately.
    pub start: u64,
    pub duration: u64,
    pub unlock_count: u64,
    pub cliff_percentage: f64,
    pub cancelable_by_sender: bool,
    pub cancelable_by_recipient: bool,
    pub transferable_by_sender: bool,
    pub transferable_by_recipient: bool,
    pub automatic_withdrawal: bool,
    pub can_topup: bool,
}

/// Per-recipient amounts derived from a schedule and a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantAmounts {
    pub deposited: u64,
    pub period: u64,
    pub amount_per_period: u64,
    pub cliff_amount: u64,
    pub automatic_withdrawal: bool,
    pub withdraw_frequency: u64,
}

impl VestingSchedule {
    pub fn period(&self) -> u64 {
        (self.duration / self.unlock_count.max(1)).max(1)
    }

    fn cliff_basis_points(&self) -> u128 {
        (self.cliff_percentage.clamp(0.0, 100.0) * 100.0).round() as u128
    }

    pub fn amounts(&self, deposited: u64) -> GrantAmounts {
        let amount = deposited as u128;
        let cliff_bp = self.cliff_basis_points();
        let cliff_amount = amount * cliff_bp / BASIS_POINTS;
        let without_cliff = amount * (BASIS_POINTS - cliff_bp) / BASIS_POINTS;
        let amount_per_period = without_cliff / self.unlock_count.max(1) as u128;
        let period = self.period();
        // Without automatic withdrawal the contract still expects the flag, with
        // a zero frequency meaning "never".
        let (automatic_withdrawal, withdraw_frequency) = if self.automatic_withdrawal {
            (true, period)
        } else {
            (true, 0)
        };
        GrantAmounts {
            deposited,
            period,
            amount_per_period: amount_per_period as u64,
            cliff_amount: cliff_amount as u64,
            automatic_withdrawal,
            withdraw_frequency,
        }
    }
}

fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let mut len = 0;
    for c in name.chars() {
        let width = c.len_utf8();
        if len + width > NAME_LEN {
            break;
        }
        c.encode_utf8(&mut out[len..len + width]);
        len += width;
    }
    out
}

/// Instruction selector: the first 8 bytes of SHA-256("create").
fn create_discriminator() -> [u8; 8] {
    let digest = solana_sdk::hash::hash(b"create").to_bytes();
    let mut selector = [0u8; 8];
    selector.copy_from_slice(&digest[..8]);
    selector
}

fn create_grant_data(schedule: &VestingSchedule, amounts: &GrantAmounts, name: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + 8 * 6 + 6 + NAME_LEN + 8 + 2 + CREATE_PADDING.len());
    data.extend_from_slice(&create_discriminator());
    data.extend_from_slice(&schedule.start.to_le_bytes());
    data.extend_from_slice(&amounts.deposited.to_le_bytes());
    data.extend_from_slice(&amounts.period.to_le_bytes());
    data.extend_from_slice(&amounts.amount_per_period.to_le_bytes());
    data.extend_from_slice(&schedule.start.to_le_bytes()); // cliff
    data.extend_from_slice(&amounts.cliff_amount.to_le_bytes());
    data.push(schedule.cancelable_by_sender as u8);
    data.push(schedule.cancelable_by_recipient as u8);
    data.push(amounts.automatic_withdrawal as u8);
    data.push(schedule.transferable_by_sender as u8);
    data.push(schedule.transferable_by_recipient as u8);
    data.push(schedule.can_topup as u8);
    data.extend_from_slice(&encode_name(name));
    data.extend_from_slice(&amounts.withdraw_frequency.to_le_bytes());
    data.push(0); // pausable
    data.push(0); // can_update_rate
    data.extend_from_slice(&CREATE_PADDING);
    data
}

/// Builds the grant-creation instruction list for one recipient.
pub struct VestingInstructions {
    pub program_id: Pubkey,
    pub sender: Pubkey,
    pub mint: Pubkey,
    pub schedule: VestingSchedule,
}

impl VestingInstructions {
    pub fn escrow_address(&self, metadata: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(&[ESCROW_SEED, metadata.as_ref()], &self.program_id).0
    }

    pub fn grant_instruction(&self, record: &RecipientRecord, metadata: &Pubkey) -> Instruction {
        let deposited = record.base_units();
        let amounts = self.schedule.amounts(deposited);
        let sender_tokens = get_associated_token_address(&self.sender, &self.mint);
        let recipient_tokens = get_associated_token_address(&record.address, &self.mint);
        let treasury_tokens = get_associated_token_address(&TREASURY, &self.mint);

        let accounts = vec![
            AccountMeta::new(self.sender, true),
            AccountMeta::new(sender_tokens, false),
            AccountMeta::new(record.address, false),
            AccountMeta::new(*metadata, true),
            AccountMeta::new(self.escrow_address(metadata), false),
            AccountMeta::new(recipient_tokens, false),
            AccountMeta::new(TREASURY, false),
            AccountMeta::new(treasury_tokens, false),
            // The sender acts as its own partner.
            AccountMeta::new(self.sender, false),
            AccountMeta::new(sender_tokens, false),
            AccountMeta::new_readonly(self.mint, false),
            AccountMeta::new_readonly(FEE_ORACLE, false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(self.program_id, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(spl_associated_token_account::id(), false),
            AccountMeta::new(WITHDRAWOR, false),
            AccountMeta::new_readonly(system_program::id(), false),
        ];

        Instruction {
            program_id: self.program_id,
            accounts,
            data: create_grant_data(&self.schedule, &amounts, &record.display_name),
        }
    }
}

#[async_trait]
impl InstructionBuilder for VestingInstructions {
    async fn prepare(&self, record: &RecipientRecord) -> LedgerResult<PreparedInstructions> {
        let metadata = Keypair::new();
        let metadata_key = metadata.pubkey();
        let instructions = vec![
            create_associated_token_account_idempotent(&self.sender, &record.address, &self.mint, &spl_token::id()),
            create_associated_token_account_idempotent(&self.sender, &TREASURY, &self.mint, &spl_token::id()),
            self.grant_instruction(record, &metadata_key),
        ];
        Ok(PreparedInstructions {
            instructions,
            extra_signers: vec![metadata],
            contract_id: Some(metadata_key),
        })
    }
}

/// Looks up grants that already exist for a (mint, recipient) pair.
pub struct GrantGuard {
    ledger: Arc<dyn LedgerClient>,
    program_id: Pubkey,
}

impl GrantGuard {
    pub fn new(ledger: Arc<dyn LedgerClient>, program_id: Pubkey) -> Self {
        Self { ledger, program_id }
    }

    /// Returns the first existing contract id, if any. Read-only: never builds
    /// or sends a transaction.
    pub async fn exists(&self, mint: &Pubkey, recipient: &Pubkey) -> LedgerResult<Option<Pubkey>> {
        let filters = [
            AccountFilter::pubkey_at(MINT_OFFSET, mint),
            AccountFilter::pubkey_at(RECIPIENT_OFFSET, recipient),
        ];
        let found = self.ledger.query_accounts(&self.program_id, &filters).await?;
        Ok(found.into_iter().next())
    }
}
