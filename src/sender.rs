//! Send/confirm state machine for a single job.
//!
//! A signed transaction is bound to one block handle. It is resubmitted until
//! confirmed or until the chain is `grace_blocks` past the handle's last valid
//! height, at which point the job is rebuilt from scratch against a fresh
//! handle. Retryable ledger errors are absorbed here; only fatal ones leave.

use solana_sdk::{
    signature::{Keypair, Signature},
    transaction::VersionedTransaction,
};
use std::sync::Arc;
use tokio::time::sleep;

use crate::config::DispatchConfig;
use crate::gate::SendGate;
use crate::instructions::PreparedInstructions;
use crate::ledger::{BlockHandle, Confirmation, LedgerClient, LedgerError};
use crate::progress::Progress;
use crate::transaction::{build_signed, BuildError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Fatal(LedgerError),
    #[error("failed to build transaction: {0}")]
    Build(String),
    #[error("gave up after {cycles} expiry cycles")]
    Exhausted { cycles: u32 },
}

pub struct Sender {
    ledger: Arc<dyn LedgerClient>,
    gate: Arc<SendGate>,
    payer: Arc<Keypair>,
    priority_fee: Option<u64>,
    config: Arc<DispatchConfig>,
    progress: Arc<Progress>,
}

impl Sender {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        gate: Arc<SendGate>,
        payer: Arc<Keypair>,
        priority_fee: Option<u64>,
        config: Arc<DispatchConfig>,
        progress: Arc<Progress>,
    ) -> Self {
        Self { ledger, gate, payer, priority_fee, config, progress }
    }

    /// Drives the prepared instructions to a confirmed transaction.
    pub async fn send_and_confirm(&self, prepared: &PreparedInstructions) -> Result<Signature, DispatchError> {
        let mut cycles: u32 = 0;
        loop {
            let handle = self.fresh_handle().await?;
            let tx = match build_signed(
                self.ledger.as_ref(),
                &handle,
                &prepared.instructions,
                &self.payer,
                &prepared.extra_signers,
                self.priority_fee,
                &self.config,
            )
            .await
            {
                Ok(tx) => tx,
                Err(BuildError::Ledger(e)) if e.is_retryable() => {
                    tracing::debug!(error = %e, "build failed, refetching block handle");
                    sleep(self.config.poll_interval).await;
                    continue;
                }
                Err(BuildError::Ledger(e)) => return Err(DispatchError::Fatal(e)),
                Err(e @ BuildError::Signing(_)) => return Err(DispatchError::Build(e.to_string())),
            };
            tracing::debug!(signature = %tx.signatures[0], cycle = cycles, "built");

            if let Some(signature) = self.drive(&tx, &handle).await? {
                return Ok(signature);
            }

            cycles += 1;
            self.progress.record_retry();
            tracing::warn!(signature = %tx.signatures[0], cycle = cycles, "transaction expired, rebuilding");
            if let Some(max) = self.config.max_expiry_cycles {
                if cycles >= max {
                    return Err(DispatchError::Exhausted { cycles });
                }
            }
            sleep(self.config.expiry_backoff).await;
        }
    }

    async fn fresh_handle(&self) -> Result<BlockHandle, DispatchError> {
        loop {
            match self.ledger.latest_block_handle().await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, "failed to fetch block handle, retrying");
                    sleep(self.config.poll_interval).await;
                }
                Err(e) => return Err(DispatchError::Fatal(e)),
            }
        }
    }

    /// Submits and polls one signed transaction within its validity window.
    /// `Ok(None)` means the window closed without confirmation.
    ///
    /// Once a submission has been accepted the transaction may land at any
    /// moment, so from then on only an execution failure ends the loop early.
    async fn drive(&self, tx: &VersionedTransaction, handle: &BlockHandle) -> Result<Option<Signature>, DispatchError> {
        let signature = tx.signatures[0];
        let deadline = handle.last_valid_block_height + self.config.grace_blocks;
        let mut sent = false;
        let mut height = self.current_height(false).await?;

        while height < deadline {
            if height < handle.last_valid_block_height || !sent {
                let result = self
                    .gate
                    .submit(|| self.ledger.send_raw(tx, handle.min_context_slot))
                    .await;
                match result {
                    Ok(_) => {
                        if !sent {
                            tracing::debug!(%signature, "sent");
                        }
                        sent = true;
                    }
                    Err(LedgerError::MinContextSlotNotReached) => {
                        tracing::debug!(%signature, "endpoint behind minimum context slot");
                        sleep(self.config.poll_interval).await;
                        height = self.current_height(sent).await?;
                        continue;
                    }
                    // Already in flight; a failed resubmission changes nothing.
                    Err(e) if sent => tracing::debug!(%signature, error = %e, "resubmission failed"),
                    Err(e) if e.is_retryable() => {
                        tracing::debug!(%signature, error = %e, "submission failed, retrying");
                        sleep(self.config.poll_interval).await;
                        height = self.current_height(sent).await?;
                        continue;
                    }
                    Err(e) => return Err(DispatchError::Fatal(e)),
                }
            }

            sleep(self.config.poll_interval).await;
            match self.ledger.confirm(&signature).await {
                Ok(Confirmation::Confirmed) => return Ok(Some(signature)),
                Ok(Confirmation::Failed(reason)) => {
                    tracing::debug!(%signature, %reason, "failed");
                    return Err(DispatchError::Fatal(LedgerError::ExecutionFailed(reason)));
                }
                Ok(Confirmation::Pending) => {}
                Err(e) => tracing::debug!(%signature, error = %e, "confirmation poll failed"),
            }
            height = self.current_height(sent).await?;
        }
        Ok(None)
    }

    /// With a transaction in flight every error is retried; before that a
    /// fatal error ends the job.
    async fn current_height(&self, in_flight: bool) -> Result<u64, DispatchError> {
        loop {
            match self.ledger.block_height().await {
                Ok(height) => return Ok(height),
                Err(e) if in_flight || e.is_retryable() => {
                    tracing::debug!(error = %e, "failed to fetch block height, retrying");
                    sleep(self.config.poll_interval).await;
                }
                Err(e) => return Err(DispatchError::Fatal(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ConfirmPlan, MockLedger};
    use solana_client::{
        client_error::ClientError,
        rpc_request::{RpcError, RpcResponseErrorData},
    };
    use solana_sdk::{
        instruction::{AccountMeta, Instruction},
        pubkey::Pubkey,
        signer::Signer,
    };
    use std::{num::NonZeroU32, time::Duration};

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            send_rate: NonZeroU32::new(1_000).unwrap(),
            send_concurrency: 4,
            poll_interval: Duration::from_millis(1),
            expiry_backoff: Duration::from_millis(1),
            grace_blocks: 2,
            ..DispatchConfig::default()
        }
    }

    fn make_sender(ledger: Arc<MockLedger>, config: DispatchConfig) -> (Sender, Arc<Progress>, Arc<Keypair>) {
        let progress = Arc::new(Progress::hidden());
        let payer = Arc::new(Keypair::new());
        let gate = Arc::new(SendGate::new(config.send_concurrency, config.send_rate));
        let sender = Sender::new(ledger, gate, payer.clone(), None, Arc::new(config), progress.clone());
        (sender, progress, payer)
    }

    fn prepared(payer: &Keypair) -> PreparedInstructions {
        let ix = Instruction::new_with_bytes(Pubkey::new_unique(), b"pay", vec![AccountMeta::new(payer.pubkey(), true)]);
        PreparedInstructions { instructions: vec![ix], extra_signers: Vec::new(), contract_id: None }
    }

    #[tokio::test]
    async fn test_confirms_on_first_handle() {
        let ledger = Arc::new(MockLedger::default());
        let (sender, progress, payer) = make_sender(ledger.clone(), fast_config());
        let signature = sender.send_and_confirm(&prepared(&payer)).await.unwrap();
        assert_eq!(ledger.handles().len(), 1);
        assert_eq!(ledger.sent()[0].0, signature);
        assert_eq!(progress.snapshot().retried, 0);
    }

    #[tokio::test]
    async fn test_expiry_rebuilds_with_fresh_handle() {
        let ledger = Arc::new(MockLedger::default());
        ledger.set_chain(3, 1);
        ledger.set_confirm_plan(ConfirmPlan::FromHandle(1));
        let (sender, progress, payer) = make_sender(ledger.clone(), fast_config());

        let signature = sender.send_and_confirm(&prepared(&payer)).await.unwrap();
        let handles = ledger.handles();
        assert_eq!(handles.len(), 2);
        let sent = ledger.sent();
        // The stale transaction was resubmitted, but never past its window.
        let stale = sent.iter().filter(|(_, hash)| *hash == handles[0]).count();
        assert!(stale >= 1 && stale <= 3, "stale submissions: {stale}");
        let (last_sig, last_hash) = sent.last().unwrap();
        assert_eq!(*last_sig, signature);
        assert_eq!(*last_hash, handles[1]);
        assert_eq!(progress.snapshot().retried, 1);
    }

    #[tokio::test]
    async fn test_execution_failure_is_not_retried() {
        let ledger = Arc::new(MockLedger::default());
        ledger.set_confirm_plan(ConfirmPlan::Fail("custom program error: 0x1".into()));
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        let err = sender.send_and_confirm(&prepared(&payer)).await.unwrap_err();
        assert_eq!(err, DispatchError::Fatal(LedgerError::ExecutionFailed("custom program error: 0x1".into())));
        assert_eq!(ledger.handles().len(), 1);
        assert_eq!(ledger.sends(), 1);
    }

    #[tokio::test]
    async fn test_transient_send_errors_are_absorbed() {
        let ledger = Arc::new(MockLedger::default());
        ledger.fail_next_send(LedgerError::MinContextSlotNotReached);
        ledger.fail_next_send(LedgerError::Transport("connection reset".into()));
        ledger.fail_next_handle(LedgerError::RateLimited("429".into()));
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        sender.send_and_confirm(&prepared(&payer)).await.unwrap();
        assert_eq!(ledger.handles().len(), 1);
        assert_eq!(ledger.sends(), 1);
    }

    #[tokio::test]
    async fn test_fatal_submission_error_ends_job() {
        let ledger = Arc::new(MockLedger::default());
        ledger.fail_next_send(LedgerError::Rejected("invalid transaction".into()));
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        let err = sender.send_and_confirm(&prepared(&payer)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Fatal(LedgerError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_errors_after_first_send_are_ignored() {
        let ledger = Arc::new(MockLedger::default());
        ledger.set_confirm_plan(ConfirmPlan::AfterPolls(2));
        ledger.reject_duplicates();
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        sender.send_and_confirm(&prepared(&payer)).await.unwrap();
        assert_eq!(ledger.sends(), 1);
        assert_eq!(ledger.handles().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_errors_after_send_keep_polling() {
        let ledger = Arc::new(MockLedger::default());
        ledger.reject_duplicates();
        let internal = LedgerError::from(ClientError::from(RpcError::RpcResponseError {
            code: -32603,
            message: "Internal error".into(),
            data: RpcResponseErrorData::Empty,
        }));
        ledger.fail_next_confirm(internal);
        ledger.fail_next_confirm(LedgerError::Rejected("unexpected response".into()));
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        let signature = sender.send_and_confirm(&prepared(&payer)).await.unwrap();
        assert_eq!(ledger.sends(), 1);
        assert_eq!(ledger.sent()[0].0, signature);
        assert_eq!(ledger.handles().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_height_error_before_send_ends_job() {
        let ledger = Arc::new(MockLedger::default());
        ledger.fail_next_height(LedgerError::Rejected("method not found".into()));
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        let err = sender.send_and_confirm(&prepared(&payer)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Fatal(LedgerError::Rejected(_))));
        assert_eq!(ledger.sends(), 0);
    }

    #[tokio::test]
    async fn test_expiry_cap_gives_up() {
        let ledger = Arc::new(MockLedger::default());
        ledger.set_chain(2, 1);
        ledger.set_confirm_plan(ConfirmPlan::Never);
        let config = DispatchConfig { max_expiry_cycles: Some(3), ..fast_config() };
        let (sender, progress, payer) = make_sender(ledger.clone(), config);

        let err = sender.send_and_confirm(&prepared(&payer)).await.unwrap_err();
        assert_eq!(err, DispatchError::Exhausted { cycles: 3 });
        assert_eq!(err.to_string(), "gave up after 3 expiry cycles");
        assert_eq!(ledger.handles().len(), 3);
        assert_eq!(progress.snapshot().retried, 3);
    }

    #[tokio::test]
    async fn test_retryable_simulation_failure_refetches_handle() {
        let ledger = Arc::new(MockLedger::default());
        ledger.fail_next_simulation(LedgerError::BlockhashExpired);
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        sender.send_and_confirm(&prepared(&payer)).await.unwrap();
        assert_eq!(ledger.handles().len(), 2);
        assert_eq!(ledger.simulations(), 2);
    }

    #[tokio::test]
    async fn test_fatal_simulation_failure_is_not_retried() {
        let ledger = Arc::new(MockLedger::default());
        ledger.fail_next_simulation(LedgerError::ExecutionFailed("insufficient funds".into()));
        let (sender, _, payer) = make_sender(ledger.clone(), fast_config());

        let err = sender.send_and_confirm(&prepared(&payer)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Fatal(LedgerError::ExecutionFailed(_))));
        assert_eq!(ledger.sends(), 0);
    }
}
