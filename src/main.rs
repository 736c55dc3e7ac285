use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    program_pack::Pack,
    pubkey::Pubkey,
    signature::Keypair,
    signer::{keypair::keypair_from_seed, Signer},
};
use spl_associated_token_account::get_associated_token_address;
use spl_token::state::Mint;
use std::{
    fs,
    io::{BufRead, Write},
    num::NonZeroU32,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Instant,
};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;
mod dispatcher;
mod fingerprint;
mod gate;
mod instructions;
mod ledger;
mod output;
mod progress;
mod recipients;
mod sender;
mod transaction;
mod vesting;

#[cfg(test)]
mod testing;

use config::{BatchConfig, DispatchConfig, Mode};
use dispatcher::Dispatcher;
use gate::SendGate;
use instructions::{InstructionBuilder, TransferInstructions};
use ledger::{LedgerClient, RpcLedger};
use output::{spawn_writer, OutputSinks, SinkPaths};
use progress::Progress;
use recipients::{spawn_stream, RecipientStream};
use sender::Sender;
use vesting::{default_program_id, DurationUnit, GrantGuard, VestingInstructions, VestingSchedule};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Log filter (error, warn, info, debug, trace or a full directive)
    #[clap(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send tokens or create vesting grants for every row of a recipients CSV
    Distribute(DistributeArgs),
    /// Generate a synthetic recipients file
    GenerateRecipients(GenerateArgs),
}

#[derive(Parser)]
struct DistributeArgs {
    /// Sender key file (JSON byte array: 64-byte keypair or 32-byte seed)
    #[clap(long)]
    key: PathBuf,

    /// SPL token mint address
    #[clap(long)]
    mint: String,

    /// Recipients CSV: amount,address[,name[,email]] with a header row
    #[clap(long)]
    recipients: PathBuf,

    /// RPC URL
    #[clap(long, env = "AIRDROP_RPC_URL", default_value = "https://api.mainnet-beta.solana.com")]
    url: String,

    /// Input read rate in bytes per second
    #[clap(long, default_value = "100")]
    speed: u64,

    /// Create vesting grants instead of plain transfers
    #[clap(long)]
    vesting: bool,

    /// Vesting start: unix seconds or RFC 3339; 0 starts immediately
    #[clap(long, default_value = "0")]
    start: String,

    /// Vesting duration, in --duration-unit
    #[clap(long, default_value = "1")]
    duration: u64,

    #[clap(long, value_enum, default_value = "month")]
    duration_unit: DurationUnit,

    /// Number of unlocks over the vesting duration
    #[clap(long, default_value = "1")]
    unlock_count: u64,

    /// Percentage released at start
    #[clap(long, default_value = "0")]
    cliff_percentage: f64,

    /// Sender may cancel the grant (pass `false` to disable)
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    cancelable_by_sender: bool,

    #[clap(long)]
    cancelable_by_recipient: bool,

    #[clap(long)]
    transferable_by_sender: bool,

    /// Recipient may transfer the grant (pass `false` to disable)
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    transferable_by_recipient: bool,

    #[clap(long)]
    automatic_withdrawal: bool,

    #[clap(long)]
    can_topup: bool,

    /// Vesting program id (defaults to the deployment for the chosen cluster)
    #[clap(long)]
    program_id: Option<String>,

    /// Use the devnet vesting deployment
    #[clap(long)]
    devnet: bool,

    /// Compute unit price in microlamports
    #[clap(long)]
    priority_fee: Option<u64>,

    /// Recipients processed in parallel
    #[clap(long, default_value = "20")]
    workers: usize,

    /// Concurrent transaction submissions across all workers
    #[clap(long, default_value = "2")]
    send_concurrency: usize,

    /// Transaction submissions per second across all workers
    #[clap(long, default_value = "2")]
    send_rate: u32,

    /// Give a recipient up after this many expired transactions (default: never)
    #[clap(long)]
    max_expiry_cycles: Option<u32>,

    /// Directory for the success, invalid and error files
    #[clap(long, default_value = ".")]
    output_dir: PathBuf,

    /// Skip confirmation prompts
    #[clap(long)]
    yes: bool,
}

#[derive(Parser)]
struct GenerateArgs {
    /// Number of recipients
    #[clap(long)]
    count: usize,

    /// Amount per recipient (in whole tokens)
    #[clap(long)]
    amount: f64,

    /// Output CSV file
    #[clap(long)]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install log subscriber")?;

    match cli.command {
        Commands::Distribute(args) => distribute(args).await,
        Commands::GenerateRecipients(args) => generate_recipients(args),
    }
}

fn generate_recipients(args: GenerateArgs) -> Result<()> {
    println!("Generating {} recipients with {} tokens each...", args.count, args.amount);

    let mut writer = csv::Writer::from_path(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    writer.write_record(["amount", "address", "name", "email"])?;

    // Different recipients on every run.
    let stamp = chrono::Utc::now().timestamp_millis();
    for i in 0..args.count {
        let seed = format!("recipient_{}_{}", stamp, i);
        let address = Pubkey::new_from_array(solana_sdk::hash::hash(seed.as_bytes()).to_bytes());
        writer.write_record([
            args.amount.to_string(),
            address.to_string(),
            format!("Recipient {}", i + 1),
            format!("recipient{}@example.com", i + 1),
        ])?;
    }

    writer.flush()?;
    println!("Generated {} recipients in {}", args.count, args.output.display());
    Ok(())
}

async fn distribute(args: DistributeArgs) -> Result<()> {
    let payer = Arc::new(load_keypair(&args.key)?);
    let mint = Pubkey::from_str(&args.mint).with_context(|| format!("Invalid mint address {}", args.mint))?;
    if !args.recipients.is_file() {
        bail!("Recipients file {} does not exist", args.recipients.display());
    }
    let mode = if args.vesting {
        Mode::Vesting(vesting_schedule(&args)?)
    } else {
        Mode::Transfer
    };
    let program_id = match &args.program_id {
        Some(id) => Pubkey::from_str(id).with_context(|| format!("Invalid program id {}", id))?,
        None => default_program_id(args.devnet),
    };
    let send_rate = NonZeroU32::new(args.send_rate).context("--send-rate must be at least 1")?;

    println!("Sender: {}", payer.pubkey());
    println!("Connecting to {}", args.url);
    let client = Arc::new(RpcClient::new_with_commitment(args.url.clone(), CommitmentConfig::confirmed()));

    let mint_account = client
        .get_account(&mint)
        .await
        .with_context(|| format!("Failed to fetch mint {}", mint))?;
    let decimals = Mint::unpack(&mint_account.data)
        .with_context(|| format!("{} is not an SPL token mint", mint))?
        .decimals;
    println!("Token mint: {} (decimals: {})", mint, decimals);

    let source = get_associated_token_address(&payer.pubkey(), &mint);
    match client.get_token_account_balance(&source).await {
        Ok(balance) => println!("Sender balance: {} tokens", balance.ui_amount_string),
        Err(_) => println!("Sender has no token account for this mint"),
    }

    let stdin = std::io::stdin();
    let mut answers = stdin.lock();
    if fingerprint::already_processed(&args.recipients)? {
        println!("\n{} was already processed by an earlier run.", args.recipients.display());
        if !args.yes && !confirm(&mut answers, "Distribute to it again? [y/N] ")? {
            println!("Aborted.");
            return Ok(());
        }
    }
    if !args.yes && !confirm(&mut answers, "\nReady to distribute? [y/N] ")? {
        println!("Aborted.");
        return Ok(());
    }
    drop(answers);

    let batch = Arc::new(BatchConfig {
        mint,
        decimals,
        mode,
        program_id,
        priority_fee: args.priority_fee,
        devnet: args.devnet,
    });
    let config = Arc::new(DispatchConfig {
        workers: args.workers.max(1),
        send_concurrency: args.send_concurrency.max(1),
        send_rate,
        max_expiry_cycles: args.max_expiry_cycles,
        ..DispatchConfig::default()
    });

    if let Mode::Vesting(schedule) = &batch.mode {
        println!(
            "Vesting grants via {} ({}): {} unlocks every {}s, {}% cliff",
            batch.program_id,
            if batch.devnet { "devnet" } else { "mainnet" },
            schedule.unlock_count,
            schedule.period(),
            schedule.cliff_percentage
        );
    }

    let ledger: Arc<dyn LedgerClient> = Arc::new(RpcLedger::new(client));
    let (builder, guard) = match &batch.mode {
        Mode::Transfer => (
            Arc::new(TransferInstructions {
                ledger: ledger.clone(),
                sender: payer.pubkey(),
                mint: batch.mint,
                decimals: batch.decimals,
            })
                as Arc<dyn InstructionBuilder>,
            None,
        ),
        Mode::Vesting(schedule) => (
            Arc::new(VestingInstructions {
                program_id: batch.program_id,
                sender: payer.pubkey(),
                mint: batch.mint,
                schedule: schedule.clone(),
            }) as Arc<dyn InstructionBuilder>,
            Some(GrantGuard::new(ledger.clone(), batch.program_id)),
        ),
    };

    let stamp = chrono::Utc::now().timestamp_millis().to_string();
    let paths = SinkPaths::new(&args.output_dir, &stamp);
    let (outcomes, writer) = spawn_writer(OutputSinks::create(&paths, batch.is_vesting())?);

    let progress = Arc::new(Progress::new());
    let gate = Arc::new(SendGate::new(config.send_concurrency, config.send_rate));
    let sender = Sender::new(ledger, gate, payer, batch.priority_fee, config.clone(), progress.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        batch.clone(),
        config.clone(),
        builder,
        guard,
        sender,
        progress.clone(),
        outcomes,
    ));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (interrupt_tx, interrupts) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_tx.send(()).is_err() {
                break;
            }
        }
    });
    let interrupt_progress = progress.clone();
    tokio::spawn(async move {
        if escalate_interrupts(interrupts, cancel_tx, &interrupt_progress).await {
            interrupt_progress.println("Interrupted again, exiting without waiting for in-flight jobs.");
            std::process::exit(130);
        }
    });

    let records = spawn_stream(RecipientStream::open(&args.recipients, args.speed, batch.decimals)?, config.workers);
    progress.println("Starting distribution...");
    let started = Instant::now();
    let report = dispatcher.run(records, cancel_rx).await;
    let tally = writer.await.context("Outcome writer stopped unexpectedly")?;
    progress.finish();

    println!("\nFinished in {:.1}s", started.elapsed().as_secs_f64());
    println!("{} successful, recorded in {}", tally.success, paths.success.display());
    if tally.error > 0 {
        println!(
            "{} failed. Retry them by passing {} as --recipients",
            tally.error,
            paths.error.display()
        );
    }
    if tally.invalid > 0 {
        println!("{} invalid rows, recorded in {}", tally.invalid, paths.invalid.display());
    }
    if tally.unrecorded > 0 {
        println!(
            "{} outcomes could not be written to the output files; see the log for their rows",
            tally.unrecorded
        );
    }
    if report.cancelled {
        println!("Cancelled after {} rows; remaining rows were not processed.", report.admitted);
    }
    if let Some(err) = &report.read_error {
        println!("Stopped early, the recipients file could not be read: {}", err);
    }

    if report.completed() && tally.unrecorded == 0 {
        let hash = fingerprint::body_hash(&args.recipients)?;
        fingerprint::annotate(&args.recipients, &hash)?;
        tracing::info!(%hash, file = %args.recipients.display(), "recipients file annotated");
    }
    Ok(())
}

/// The first interrupt cancels the run. Returns true if a second one arrives,
/// at which point the caller should exit without waiting.
async fn escalate_interrupts(
    mut interrupts: mpsc::UnboundedReceiver<()>,
    cancel: watch::Sender<bool>,
    progress: &Progress,
) -> bool {
    if interrupts.recv().await.is_none() {
        return false;
    }
    let _ = cancel.send(true);
    progress.println("Cancelling. Press Ctrl-C again to exit immediately.");
    interrupts.recv().await.is_some()
}

fn vesting_schedule(args: &DistributeArgs) -> Result<VestingSchedule> {
    if args.unlock_count == 0 {
        bail!("--unlock-count must be at least 1");
    }
    if !(0.0..=100.0).contains(&args.cliff_percentage) {
        bail!("--cliff-percentage must be between 0 and 100");
    }
    let duration = args
        .duration
        .checked_mul(args.duration_unit.seconds())
        .context("--duration is too large")?;
    if duration == 0 {
        bail!("--duration must be at least 1");
    }
    Ok(VestingSchedule {
        start: parse_start(&args.start)?,
        duration,
        unlock_count: args.unlock_count,
        cliff_percentage: args.cliff_percentage,
        cancelable_by_sender: args.cancelable_by_sender,
        cancelable_by_recipient: args.cancelable_by_recipient,
        transferable_by_sender: args.transferable_by_sender,
        transferable_by_recipient: args.transferable_by_recipient,
        automatic_withdrawal: args.automatic_withdrawal,
        can_topup: args.can_topup,
    })
}

/// Unix seconds or an RFC 3339 timestamp; empty or 0 means "now".
fn parse_start(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Ok(seconds);
    }
    let at = chrono::DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid start time {}: expected unix seconds or RFC 3339", raw))?;
    u64::try_from(at.timestamp()).context("Start time is before 1970")
}

fn load_keypair(path: &Path) -> Result<Keypair> {
    let keypair_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read keypair from {}", path.display()))?;

    let keypair_bytes: Vec<u8> = serde_json::from_str(&keypair_str)
        .with_context(|| format!("Failed to parse keypair JSON from {}", path.display()))?;

    keypair_from_bytes(&keypair_bytes).with_context(|| format!("Invalid keypair format in {}", path.display()))
}

/// A full 64-byte keypair, otherwise the first 32 bytes as an ed25519 seed.
fn keypair_from_bytes(bytes: &[u8]) -> Result<Keypair> {
    if bytes.len() == 64 {
        if let Ok(keypair) = Keypair::from_bytes(bytes) {
            return Ok(keypair);
        }
    }
    if bytes.len() < 32 {
        bail!("expected at least 32 bytes, got {}", bytes.len());
    }
    keypair_from_seed(&bytes[..32]).map_err(|e| anyhow::anyhow!("{}", e))
}

fn confirm(input: &mut impl BufRead, question: &str) -> Result<bool> {
    print!("{}", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
