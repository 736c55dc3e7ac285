//! Concurrency controller: admits records into a bounded pool of workers and
//! turns each one into exactly one [`Outcome`].

use std::{future::Future, io, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::sleep,
};

use crate::config::{BatchConfig, DispatchConfig};
use crate::instructions::InstructionBuilder;
use crate::ledger::LedgerResult;
use crate::output::Outcome;
use crate::progress::Progress;
use crate::recipients::RecipientRecord;
use crate::sender::Sender;
use crate::vesting::GrantGuard;

/// How a run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub admitted: u64,
    pub cancelled: bool,
    /// The input could not be read to the end.
    pub read_error: Option<String>,
}

impl RunReport {
    pub fn completed(&self) -> bool {
        !self.cancelled && self.read_error.is_none()
    }
}

pub struct Dispatcher {
    batch: Arc<BatchConfig>,
    config: Arc<DispatchConfig>,
    builder: Arc<dyn InstructionBuilder>,
    guard: Option<GrantGuard>,
    sender: Sender,
    progress: Arc<Progress>,
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl Dispatcher {
    pub fn new(
        batch: Arc<BatchConfig>,
        config: Arc<DispatchConfig>,
        builder: Arc<dyn InstructionBuilder>,
        guard: Option<GrantGuard>,
        sender: Sender,
        progress: Arc<Progress>,
        outcomes: mpsc::UnboundedSender<Outcome>,
    ) -> Self {
        Self { batch, config, builder, guard, sender, progress, outcomes }
    }

    /// Consumes the record stream until it ends or `cancel` flips to true.
    ///
    /// Once cancelled no further records are admitted, but every job already
    /// running is awaited to its terminal outcome.
    pub async fn run(
        self: Arc<Self>,
        mut records: mpsc::Receiver<io::Result<RecipientRecord>>,
        mut cancel: watch::Receiver<bool>,
    ) -> RunReport {
        let mut report = RunReport::default();
        let mut jobs = JoinSet::new();

        loop {
            if jobs.len() >= self.config.workers.max(1) {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => {
                        report.cancelled = true;
                        break;
                    }
                    Some(joined) = jobs.join_next() => log_join(joined),
                }
                continue;
            }

            let next = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    report.cancelled = true;
                    break;
                }
                next = records.recv() => next,
            };
            match next {
                Some(Ok(record)) => {
                    report.admitted += 1;
                    let this = self.clone();
                    jobs.spawn(async move { this.process(record).await });
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "failed to read recipients");
                    report.read_error = Some(e.to_string());
                    break;
                }
                None => break,
            }
        }

        if report.cancelled {
            self.progress.println(format!("Cancelled, waiting for {} in-flight jobs", jobs.len()));
        }
        while let Some(joined) = jobs.join_next().await {
            log_join(joined);
        }
        report
    }

    async fn process(&self, record: RecipientRecord) {
        self.progress.job_started();
        let outcome = self.classify(record).await;
        match &outcome {
            Outcome::Success { .. } => self.progress.record_success(),
            Outcome::Invalid { .. } => self.progress.record_invalid(),
            Outcome::Error { .. } => self.progress.record_failure(),
        }
        if self.outcomes.send(outcome).is_err() {
            tracing::error!("outcome writer has stopped");
        }
    }

    async fn classify(&self, record: RecipientRecord) -> Outcome {
        if !record.is_valid {
            return Outcome::Invalid { raw_line: record.raw_line };
        }

        if let Some(guard) = &self.guard {
            match self.retrying(|| guard.exists(&self.batch.mint, &record.address)).await {
                Ok(Some(contract)) => {
                    tracing::info!(recipient = %record.address, %contract, "grant already exists, skipping");
                    return Outcome::Success { record, transaction_id: String::new(), contract_id: Some(contract) };
                }
                Ok(None) => {}
                Err(e) => return failed(record, e.to_string()),
            }
        }

        let prepared = match self.retrying(|| self.builder.prepare(&record)).await {
            Ok(prepared) => prepared,
            Err(e) => return failed(record, e.to_string()),
        };

        match self.sender.send_and_confirm(&prepared).await {
            Ok(signature) => Outcome::Success {
                record,
                transaction_id: signature.to_string(),
                contract_id: prepared.contract_id,
            },
            Err(e) => failed(record, e.to_string()),
        }
    }

    /// Repeats a ledger read until it succeeds or fails fatally.
    async fn retrying<T, F, Fut>(&self, mut op: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        loop {
            match op().await {
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, "ledger read failed, retrying");
                    sleep(self.config.poll_interval).await;
                }
                result => return result,
            }
        }
    }
}

fn failed(record: RecipientRecord, last_error: String) -> Outcome {
    tracing::warn!(line = record.line_number, raw = %record.raw_line, error = %last_error, "job failed");
    Outcome::Error { raw_line: record.raw_line, last_error }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "worker task aborted");
    }
}

/// Resolves once the flag is set. Never resolves if the flag's owner is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
