use solana_sdk::{
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::Instruction,
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    signature::{Keypair, SignerError},
    transaction::VersionedTransaction,
};

use crate::config::DispatchConfig;
use crate::ledger::{BlockHandle, LedgerClient, LedgerResult};

const MAX_COMPUTE_UNITS: u32 = 1_400_000; // Solana protocol maximum

/// Unsigned instruction list bound to one block handle.
#[derive(Debug, Clone)]
pub struct DraftTransaction {
    pub instructions: Vec<Instruction>,
    pub compute_unit_limit: u32,
    pub blockhash: Hash,
}

impl DraftTransaction {
    /// Prepends the compute budget (and optional price) to the job's instructions.
    pub fn new(
        instructions: &[Instruction],
        compute_unit_limit: u32,
        priority_fee: Option<u64>,
        blockhash: Hash,
    ) -> Self {
        let mut all_instructions = vec![ComputeBudgetInstruction::set_compute_unit_limit(compute_unit_limit)];
        if let Some(price) = priority_fee.filter(|p| *p > 0) {
            all_instructions.push(ComputeBudgetInstruction::set_compute_unit_price(price));
        }
        all_instructions.extend_from_slice(instructions);
        Self { instructions: all_instructions, compute_unit_limit, blockhash }
    }

    pub fn message(&self, payer: &Pubkey) -> VersionedMessage {
        VersionedMessage::Legacy(Message::new_with_blockhash(&self.instructions, Some(payer), &self.blockhash))
    }

    pub fn sign(&self, payer: &Keypair, extra_signers: &[Keypair]) -> Result<VersionedTransaction, SignerError> {
        use solana_sdk::signer::Signer;

        let mut signers: Vec<&Keypair> = vec![payer];
        signers.extend(extra_signers.iter());
        VersionedTransaction::try_new(self.message(&payer.pubkey()), &signers)
    }
}

/// Final budget from an observed consumption, rounded up after adding the
/// margin; falls back to the default when nothing was reported.
pub fn refined_compute_units(observed: Option<u64>, config: &DispatchConfig) -> u32 {
    match observed {
        Some(units) if units > 0 => {
            let scaled = units.saturating_mul(100 + config.compute_unit_margin_pct);
            let padded = scaled.div_ceil(100);
            padded.min(MAX_COMPUTE_UNITS as u64) as u32
        }
        _ => config.default_compute_units,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Ledger(#[from] crate::ledger::LedgerError),
    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),
}

/// Builds, simulates, rebuilds with a tightened budget and signs.
///
/// The simulated draft and the final transaction share `handle`; a simulation
/// that reports the handle as expired comes back as a retryable ledger error.
pub async fn build_signed(
    ledger: &dyn LedgerClient,
    handle: &BlockHandle,
    instructions: &[Instruction],
    payer: &Keypair,
    extra_signers: &[Keypair],
    priority_fee: Option<u64>,
    config: &DispatchConfig,
) -> Result<VersionedTransaction, BuildError> {
    let draft = DraftTransaction::new(instructions, config.simulation_compute_units, priority_fee, handle.blockhash);
    let simulated = draft.sign(payer, extra_signers)?;
    let units = estimate(ledger, &simulated).await?;

    let refined = DraftTransaction::new(
        instructions,
        refined_compute_units(units, config),
        priority_fee,
        handle.blockhash,
    );
    tracing::debug!(
        simulated_units = ?units,
        compute_unit_limit = refined.compute_unit_limit,
        "compute budget refined"
    );
    Ok(refined.sign(payer, extra_signers)?)
}

async fn estimate(ledger: &dyn LedgerClient, tx: &VersionedTransaction) -> LedgerResult<Option<u64>> {
    Ok(ledger.simulate(tx).await?.units_consumed)
}
