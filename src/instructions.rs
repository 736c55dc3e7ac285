use async_trait::async_trait;
use solana_sdk::{instruction::Instruction, pubkey::Pubkey, signature::Keypair};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use spl_token::instruction::transfer_checked;
use std::sync::Arc;

use crate::ledger::{LedgerClient, LedgerError, LedgerResult};
use crate::recipients::RecipientRecord;

/// Instructions for one recipient, plus any signer that must co-sign every
/// build of the transaction carrying them.
pub struct PreparedInstructions {
    pub instructions: Vec<Instruction>,
    pub extra_signers: Vec<Keypair>,
    /// Set when the instructions create an on-chain contract.
    pub contract_id: Option<Pubkey>,
}

/// Produces the ordered, mode-specific instruction list for a recipient.
///
/// Called once per job; the result is reused across every rebuild of that
/// job's transaction.
#[async_trait]
pub trait InstructionBuilder: Send + Sync {
    async fn prepare(&self, record: &RecipientRecord) -> LedgerResult<PreparedInstructions>;
}

pub struct TransferInstructions {
    pub ledger: Arc<dyn LedgerClient>,
    pub sender: Pubkey,
    pub mint: Pubkey,
    pub decimals: u8,
}

#[async_trait]
impl InstructionBuilder for TransferInstructions {
    async fn prepare(&self, record: &RecipientRecord) -> LedgerResult<PreparedInstructions> {
        let source = get_associated_token_address(&self.sender, &self.mint);
        let destination = get_associated_token_address(&record.address, &self.mint);

        let mut instructions = Vec::with_capacity(2);
        if !self.ledger.account_exists(&destination).await? {
            instructions.push(create_associated_token_account_idempotent(
                &self.sender,
                &record.address,
                &self.mint,
                &spl_token::id(),
            ));
        }
        let transfer = transfer_checked(
            &spl_token::id(),
            &source,
            &self.mint,
            &destination,
            &self.sender,
            &[],
            record.base_units(),
            self.decimals,
        )
        .map_err(|e| LedgerError::Rejected(format!("transfer instruction: {e}")))?;
        instructions.push(transfer);

        Ok(PreparedInstructions { instructions, extra_signers: Vec::new(), contract_id: None })
    }
}
