//! In-memory ledger used by unit tests.

use async_trait::async_trait;
use solana_sdk::{hash::Hash, pubkey::Pubkey, signature::Signature, transaction::VersionedTransaction};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use crate::ledger::{
    AccountFilter, BlockHandle, Confirmation, LedgerClient, LedgerError, LedgerResult, Simulation,
};
use crate::vesting::{MINT_OFFSET, RECIPIENT_OFFSET};

/// How `confirm` answers for a sent signature.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmPlan {
    Immediately,
    Never,
    /// Pending for this many polls of the same signature, then confirmed.
    AfterPolls(usize),
    /// Only transactions bound to the n-th handle handed out (0-based) or later confirm.
    FromHandle(usize),
    Fail(String),
}

struct State {
    height: u64,
    height_step: u64,
    validity_window: u64,
    handles: Vec<Hash>,
    handle_failures: VecDeque<LedgerError>,
    units_consumed: Option<u64>,
    simulation_failures: VecDeque<LedgerError>,
    simulations: usize,
    send_failures: VecDeque<LedgerError>,
    reject_duplicates: bool,
    sends: usize,
    sent: Vec<(Signature, Hash)>,
    confirm_plan: ConfirmPlan,
    confirm_failures: VecDeque<LedgerError>,
    height_failures: VecDeque<LedgerError>,
    polls: HashMap<Signature, usize>,
    grants: Vec<(Pubkey, Pubkey, Pubkey)>,
    existing: HashSet<Pubkey>,
    queries: usize,
}

pub struct MockLedger {
    state: Mutex<State>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                height: 1_000,
                height_step: 1,
                validity_window: 150,
                handles: Vec::new(),
                handle_failures: VecDeque::new(),
                units_consumed: Some(10_000),
                simulation_failures: VecDeque::new(),
                simulations: 0,
                send_failures: VecDeque::new(),
                reject_duplicates: false,
                sends: 0,
                sent: Vec::new(),
                confirm_plan: ConfirmPlan::Immediately,
                confirm_failures: VecDeque::new(),
                height_failures: VecDeque::new(),
                polls: HashMap::new(),
                grants: Vec::new(),
                existing: HashSet::new(),
                queries: 0,
            }),
        }
    }
}

impl MockLedger {
    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Block-height window each handle stays valid for, and how far the
    /// height advances on every `block_height` call.
    pub fn set_chain(&self, validity_window: u64, height_step: u64) {
        self.with(|s| {
            s.validity_window = validity_window;
            s.height_step = height_step;
        });
    }

    pub fn set_units_consumed(&self, units: Option<u64>) {
        self.with(|s| s.units_consumed = units);
    }

    pub fn set_confirm_plan(&self, plan: ConfirmPlan) {
        self.with(|s| s.confirm_plan = plan);
    }

    pub fn fail_next_handle(&self, err: LedgerError) {
        self.with(|s| s.handle_failures.push_back(err));
    }

    pub fn fail_next_simulation(&self, err: LedgerError) {
        self.with(|s| s.simulation_failures.push_back(err));
    }

    pub fn fail_next_send(&self, err: LedgerError) {
        self.with(|s| s.send_failures.push_back(err));
    }

    pub fn fail_next_confirm(&self, err: LedgerError) {
        self.with(|s| s.confirm_failures.push_back(err));
    }

    pub fn fail_next_height(&self, err: LedgerError) {
        self.with(|s| s.height_failures.push_back(err));
    }

    /// Refuses any submission of a signature that was already accepted.
    pub fn reject_duplicates(&self) {
        self.with(|s| s.reject_duplicates = true);
    }

    pub fn add_grant(&self, mint: Pubkey, recipient: Pubkey, contract: Pubkey) {
        self.with(|s| s.grants.push((mint, recipient, contract)));
    }

    pub fn mark_existing(&self, address: Pubkey) {
        self.with(|s| {
            s.existing.insert(address);
        });
    }

    pub fn handles(&self) -> Vec<Hash> {
        self.with(|s| s.handles.clone())
    }

    pub fn simulations(&self) -> usize {
        self.with(|s| s.simulations)
    }

    /// Accepted submissions; failed ones are not counted.
    pub fn sends(&self) -> usize {
        self.with(|s| s.sends)
    }

    pub fn sent(&self) -> Vec<(Signature, Hash)> {
        self.with(|s| s.sent.clone())
    }

    pub fn queries(&self) -> usize {
        self.with(|s| s.queries)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn latest_block_handle(&self) -> LedgerResult<BlockHandle> {
        self.with(|s| {
            if let Some(err) = s.handle_failures.pop_front() {
                return Err(err);
            }
            let blockhash = Hash::new_unique();
            s.handles.push(blockhash);
            Ok(BlockHandle {
                blockhash,
                last_valid_block_height: s.height + s.validity_window,
                min_context_slot: s.height,
            })
        })
    }

    async fn simulate(&self, _tx: &VersionedTransaction) -> LedgerResult<Simulation> {
        self.with(|s| {
            s.simulations += 1;
            match s.simulation_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(Simulation { units_consumed: s.units_consumed }),
            }
        })
    }

    async fn send_raw(&self, tx: &VersionedTransaction, _min_context_slot: u64) -> LedgerResult<Signature> {
        self.with(|s| {
            if let Some(err) = s.send_failures.pop_front() {
                return Err(err);
            }
            let signature = tx.signatures[0];
            if s.reject_duplicates && s.sent.iter().any(|(sig, _)| *sig == signature) {
                return Err(LedgerError::Rejected("already processed".into()));
            }
            s.sends += 1;
            s.sent.push((signature, *tx.message.recent_blockhash()));
            Ok(signature)
        })
    }

    async fn confirm(&self, signature: &Signature) -> LedgerResult<Confirmation> {
        self.with(|s| {
            if let Some(err) = s.confirm_failures.pop_front() {
                return Err(err);
            }
            let polls = s.polls.entry(*signature).or_insert(0);
            *polls += 1;
            let polls = *polls;
            Ok(match &s.confirm_plan {
                ConfirmPlan::Immediately => Confirmation::Confirmed,
                ConfirmPlan::Never => Confirmation::Pending,
                ConfirmPlan::AfterPolls(n) if polls > *n => Confirmation::Confirmed,
                ConfirmPlan::AfterPolls(_) => Confirmation::Pending,
                ConfirmPlan::FromHandle(n) => {
                    let bound = s.sent.iter().find(|(sig, _)| sig == signature).map(|(_, hash)| *hash);
                    let index = bound.and_then(|hash| s.handles.iter().position(|h| *h == hash));
                    match index {
                        Some(i) if i >= *n => Confirmation::Confirmed,
                        _ => Confirmation::Pending,
                    }
                }
                ConfirmPlan::Fail(reason) => Confirmation::Failed(reason.clone()),
            })
        })
    }

    async fn block_height(&self) -> LedgerResult<u64> {
        self.with(|s| {
            if let Some(err) = s.height_failures.pop_front() {
                return Err(err);
            }
            let height = s.height;
            s.height += s.height_step;
            Ok(height)
        })
    }

    async fn query_accounts(&self, _program_id: &Pubkey, filters: &[AccountFilter]) -> LedgerResult<Vec<Pubkey>> {
        self.with(|s| {
            s.queries += 1;
            let matches = |offset: usize, key: &Pubkey| {
                filters
                    .iter()
                    .filter(|f| f.offset == offset)
                    .all(|f| f.bytes == key.to_bytes())
            };
            Ok(s.grants
                .iter()
                .filter(|(mint, recipient, _)| matches(MINT_OFFSET, mint) && matches(RECIPIENT_OFFSET, recipient))
                .map(|(_, _, contract)| *contract)
                .collect())
        })
    }

    async fn account_exists(&self, address: &Pubkey) -> LedgerResult<bool> {
        self.with(|s| Ok(s.existing.contains(address)))
    }
}
