//! Ledger endpoint collaborator.
//!
//! Everything the dispatcher needs from the network is behind [`LedgerClient`].
//! Errors are classified into retryable and fatal at the point they come out of
//! the RPC client, so callers never inspect error text.

use async_trait::async_trait;
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::rpc_client::RpcClient,
    rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcSendTransactionConfig, RpcSimulateTransactionConfig},
    rpc_filter::{Memcmp, RpcFilterType},
    rpc_request::RpcError,
};
use solana_sdk::{
    commitment_config::CommitmentConfig,
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    transaction::{TransactionError, VersionedTransaction},
};
use solana_transaction_status::TransactionConfirmationStatus;
use std::sync::Arc;

/// JSON-RPC server error returned when the node is behind `minContextSlot`.
const MIN_CONTEXT_SLOT_NOT_REACHED: i64 = -32016;
/// Server-side conditions that clear up on their own: internal error, node
/// unhealthy, and the block/slot-not-available family.
const TRANSIENT_RPC_CODES: [i64; 6] = [-32603, -32005, -32004, -32007, -32009, -32014];
const HTTP_REQUEST_TIMEOUT: u16 = 408;
const HTTP_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited by endpoint: {0}")]
    RateLimited(String),
    #[error("minimum context slot has not been reached")]
    MinContextSlotNotReached,
    #[error("block handle expired")]
    BlockhashExpired,
    #[error("transaction execution failed: {0}")]
    ExecutionFailed(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Retryable errors are looped on by the send/confirm state machine and never
    /// surface as a job outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Transport(_)
                | LedgerError::RateLimited(_)
                | LedgerError::MinContextSlotNotReached
                | LedgerError::BlockhashExpired
        )
    }
}

impl From<ClientError> for LedgerError {
    fn from(err: ClientError) -> Self {
        match err.kind() {
            ClientErrorKind::TransactionError(TransactionError::BlockhashNotFound) => {
                LedgerError::BlockhashExpired
            }
            ClientErrorKind::TransactionError(tx_err) => LedgerError::ExecutionFailed(tx_err.to_string()),
            ClientErrorKind::RpcError(RpcError::RpcResponseError { code, message, .. }) => {
                from_rpc_code(*code, message)
            }
            ClientErrorKind::Reqwest(http) => match http.status() {
                Some(status) => from_http_status(status.as_u16(), http.to_string()),
                None => LedgerError::Transport(http.to_string()),
            },
            ClientErrorKind::SigningError(e) => LedgerError::Rejected(e.to_string()),
            _ => LedgerError::Transport(err.to_string()),
        }
    }
}

fn from_rpc_code(code: i64, message: &str) -> LedgerError {
    if code == MIN_CONTEXT_SLOT_NOT_REACHED {
        LedgerError::MinContextSlotNotReached
    } else if TRANSIENT_RPC_CODES.contains(&code) {
        LedgerError::Transport(format!("{code}: {message}"))
    } else {
        LedgerError::Rejected(format!("{code}: {message}"))
    }
}

fn from_http_status(status: u16, message: String) -> LedgerError {
    match status {
        HTTP_TOO_MANY_REQUESTS => LedgerError::RateLimited(message),
        HTTP_REQUEST_TIMEOUT | 500..=599 => LedgerError::Transport(message),
        _ => LedgerError::Rejected(message),
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// A recent block handle and the bounds of its validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    /// Slot observed before the blockhash was fetched; used as `minContextSlot` on send.
    pub min_context_slot: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Simulation {
    pub units_consumed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Pending,
    Failed(String),
}

/// Byte-equality predicate on a program account's data at a fixed offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountFilter {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

impl AccountFilter {
    pub fn pubkey_at(offset: usize, key: &Pubkey) -> Self {
        Self { offset, bytes: key.to_bytes().to_vec() }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn latest_block_handle(&self) -> LedgerResult<BlockHandle>;
    /// Dry run with no state change. An on-chain error in the simulation result
    /// is returned as `Err`, already classified.
    async fn simulate(&self, tx: &VersionedTransaction) -> LedgerResult<Simulation>;
    async fn send_raw(&self, tx: &VersionedTransaction, min_context_slot: u64) -> LedgerResult<Signature>;
    async fn confirm(&self, signature: &Signature) -> LedgerResult<Confirmation>;
    async fn block_height(&self) -> LedgerResult<u64>;
    async fn query_accounts(&self, program_id: &Pubkey, filters: &[AccountFilter]) -> LedgerResult<Vec<Pubkey>>;
    async fn account_exists(&self, address: &Pubkey) -> LedgerResult<bool>;
}

/// [`LedgerClient`] backed by a Solana JSON-RPC node.
pub struct RpcLedger {
    client: Arc<RpcClient>,
    /// Commitment used for block handles and block height; must match so that
    /// `last_valid_block_height` is comparable to the observed height.
    handle_commitment: CommitmentConfig,
}

impl RpcLedger {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client, handle_commitment: CommitmentConfig::finalized() }
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn latest_block_handle(&self) -> LedgerResult<BlockHandle> {
        let min_context_slot = self.client.get_slot_with_commitment(self.handle_commitment).await?;
        let (blockhash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(self.handle_commitment)
            .await?;
        Ok(BlockHandle { blockhash, last_valid_block_height, min_context_slot })
    }

    async fn simulate(&self, tx: &VersionedTransaction) -> LedgerResult<Simulation> {
        let config = RpcSimulateTransactionConfig {
            sig_verify: false,
            replace_recent_blockhash: false,
            commitment: Some(CommitmentConfig::processed()),
            ..Default::default()
        };
        let result = self.client.simulate_transaction_with_config(tx, config).await?;
        match result.value.err {
            Some(TransactionError::BlockhashNotFound) => Err(LedgerError::BlockhashExpired),
            Some(err) => Err(LedgerError::ExecutionFailed(format!("simulation: {err}"))),
            None => Ok(Simulation { units_consumed: result.value.units_consumed }),
        }
    }

    async fn send_raw(&self, tx: &VersionedTransaction, min_context_slot: u64) -> LedgerResult<Signature> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            preflight_commitment: Some(self.handle_commitment.commitment),
            max_retries: Some(0),
            min_context_slot: Some(min_context_slot),
            ..Default::default()
        };
        Ok(self.client.send_transaction_with_config(tx, config).await?)
    }

    async fn confirm(&self, signature: &Signature) -> LedgerResult<Confirmation> {
        let statuses = self.client.get_signature_statuses(&[*signature]).await?;
        let status = match statuses.value.into_iter().next().flatten() {
            Some(status) => status,
            None => return Ok(Confirmation::Pending),
        };
        if let Some(err) = status.err {
            return Ok(Confirmation::Failed(err.to_string()));
        }
        Ok(match status.confirmation_status {
            Some(TransactionConfirmationStatus::Confirmed) | Some(TransactionConfirmationStatus::Finalized) => {
                Confirmation::Confirmed
            }
            _ => Confirmation::Pending,
        })
    }

    async fn block_height(&self) -> LedgerResult<u64> {
        Ok(self.client.get_block_height_with_commitment(self.handle_commitment).await?)
    }

    async fn query_accounts(&self, program_id: &Pubkey, filters: &[AccountFilter]) -> LedgerResult<Vec<Pubkey>> {
        let config = RpcProgramAccountsConfig {
            filters: Some(
                filters
                    .iter()
                    .map(|f| RpcFilterType::Memcmp(Memcmp::new_base58_encoded(f.offset, &f.bytes)))
                    .collect(),
            ),
            account_config: RpcAccountInfoConfig {
                commitment: Some(CommitmentConfig::confirmed()),
                ..Default::default()
            },
            ..Default::default()
        };
        let accounts = self.client.get_program_accounts_with_config(program_id, config).await?;
        Ok(accounts.into_iter().map(|(key, _)| key).collect())
    }

    async fn account_exists(&self, address: &Pubkey) -> LedgerResult<bool> {
        let response = self
            .client
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await?;
        Ok(response.value.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::instruction::InstructionError;

    #[test]
    fn test_retryable_classification() {
        assert!(LedgerError::Transport("timeout".into()).is_retryable());
        assert!(LedgerError::RateLimited("429".into()).is_retryable());
        assert!(LedgerError::MinContextSlotNotReached.is_retryable());
        assert!(LedgerError::BlockhashExpired.is_retryable());
        assert!(!LedgerError::ExecutionFailed("custom program error".into()).is_retryable());
        assert!(!LedgerError::Rejected("bad request".into()).is_retryable());
    }

    #[test]
    fn test_client_error_mapping() {
        let expired: LedgerError = ClientError::from(TransactionError::BlockhashNotFound).into();
        assert_eq!(expired, LedgerError::BlockhashExpired);

        let failed: LedgerError =
            ClientError::from(TransactionError::InstructionError(0, InstructionError::InsufficientFunds)).into();
        assert!(matches!(failed, LedgerError::ExecutionFailed(_)));
        assert!(!failed.is_retryable());

        let min_slot: LedgerError = ClientError::from(RpcError::RpcResponseError {
            code: MIN_CONTEXT_SLOT_NOT_REACHED,
            message: "Minimum context slot has not been reached".into(),
            data: solana_client::rpc_request::RpcResponseErrorData::Empty,
        })
        .into();
        assert_eq!(min_slot, LedgerError::MinContextSlotNotReached);

        let internal: LedgerError = ClientError::from(RpcError::RpcResponseError {
            code: -32603,
            message: "Internal error".into(),
            data: solana_client::rpc_request::RpcResponseErrorData::Empty,
        })
        .into();
        assert_eq!(internal, LedgerError::Transport("-32603: Internal error".into()));

        let io: LedgerError =
            ClientError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out")).into();
        assert!(io.is_retryable());
    }

    #[test]
    fn test_rpc_codes_are_tagged() {
        for code in [-32603, -32005, -32004, -32007, -32009, -32014] {
            assert!(from_rpc_code(code, "busy").is_retryable(), "code {code}");
        }
        assert_eq!(from_rpc_code(-32016, "behind"), LedgerError::MinContextSlotNotReached);
        for code in [-32002, -32602, -32015, -32600] {
            assert!(!from_rpc_code(code, "bad").is_retryable(), "code {code}");
        }
    }

    #[test]
    fn test_http_statuses_are_tagged() {
        assert_eq!(from_http_status(429, "slow down".into()), LedgerError::RateLimited("slow down".into()));
        for status in [408, 500, 502, 503, 504] {
            assert!(from_http_status(status, "x".into()).is_retryable(), "status {status}");
        }
        for status in [400, 401, 403, 404] {
            assert!(!from_http_status(status, "x".into()).is_retryable(), "status {status}");
        }
    }

    #[test]
    fn test_pubkey_filter_bytes() {
        let key = Pubkey::new_unique();
        let filter = AccountFilter::pubkey_at(177, &key);
        assert_eq!(filter.offset, 177);
        assert_eq!(filter.bytes, key.to_bytes().to_vec());
    }
}
