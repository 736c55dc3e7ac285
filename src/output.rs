//! Outcome sinks. One writer task owns all three files; workers only send
//! outcomes over a channel.

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::recipients::RecipientRecord;

const RAW_HEADER: &str = "Amount,Wallet Address,Title,Email";

/// Terminal classification of one input row.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        record: RecipientRecord,
        /// Empty when an existing grant was found and nothing was sent.
        transaction_id: String,
        contract_id: Option<Pubkey>,
    },
    Invalid { raw_line: String },
    Error { raw_line: String, last_error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub success: u64,
    pub invalid: u64,
    pub error: u64,
    /// Outcomes that could not be written to their sink.
    pub unrecorded: u64,
}

#[derive(Debug, Clone)]
pub struct SinkPaths {
    pub success: PathBuf,
    pub invalid: PathBuf,
    pub error: PathBuf,
}

impl SinkPaths {
    pub fn new(dir: &Path, stamp: &str) -> Self {
        Self {
            success: dir.join(format!("{stamp}-success.csv")),
            invalid: dir.join(format!("{stamp}-invalid.csv")),
            error: dir.join(format!("{stamp}-error.csv")),
        }
    }
}

/// Raw-line sink: rows are written exactly as read so the file can be fed
/// back as input.
struct RawSink {
    out: BufWriter<File>,
}

impl RawSink {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut sink = Self { out: BufWriter::new(file) };
        sink.append(RAW_HEADER)?;
        Ok(sink)
    }

    fn append(&mut self, line: &str) -> Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

pub struct OutputSinks {
    success: csv::Writer<File>,
    invalid: RawSink,
    error: RawSink,
    with_contract: bool,
    tally: Tally,
}

impl OutputSinks {
    pub fn create(paths: &SinkPaths, with_contract: bool) -> Result<Self> {
        let file = File::create(&paths.success)
            .with_context(|| format!("Failed to create {}", paths.success.display()))?;
        let mut success = csv::Writer::from_writer(file);
        let mut header = vec!["Amount", "Wallet Address", "Title", "Email", "TransactionID"];
        if with_contract {
            header.push("ContractID");
        }
        success.write_record(&header)?;
        success.flush()?;

        Ok(Self {
            success,
            invalid: RawSink::create(&paths.invalid)?,
            error: RawSink::create(&paths.error)?,
            with_contract,
            tally: Tally::default(),
        })
    }

    pub fn write(&mut self, outcome: &Outcome) -> Result<()> {
        match outcome {
            Outcome::Success { record, transaction_id, contract_id } => {
                let amount = record.amount.to_string();
                let address = record.address.to_string();
                let mut row = vec![
                    amount.as_str(),
                    address.as_str(),
                    record.display_name.as_str(),
                    record.email.as_str(),
                    transaction_id.as_str(),
                ];
                let contract = contract_id.map(|c| c.to_string()).unwrap_or_default();
                if self.with_contract {
                    row.push(contract.as_str());
                }
                self.success.write_record(&row)?;
                self.success.flush()?;
                self.tally.success += 1;
            }
            Outcome::Invalid { raw_line } => {
                self.invalid.append(raw_line)?;
                self.tally.invalid += 1;
            }
            Outcome::Error { raw_line, last_error } => {
                tracing::debug!(%raw_line, %last_error, "recording failed row");
                self.error.append(raw_line)?;
                self.tally.error += 1;
            }
        }
        Ok(())
    }

    pub fn tally(&self) -> Tally {
        self.tally
    }
}

/// Starts the single writer. The task ends, returning the tally, once every
/// sender has been dropped and the channel is drained.
pub fn spawn_writer(mut sinks: OutputSinks) -> (mpsc::UnboundedSender<Outcome>, JoinHandle<Tally>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
    let handle = tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            if let Err(e) = sinks.write(&outcome) {
                tracing::error!(error = %e, ?outcome, "failed to record outcome");
                sinks.tally.unrecorded += 1;
            }
        }
        sinks.tally()
    });
    (tx, handle)
}
