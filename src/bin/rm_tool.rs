use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use seqrelay::storage::{SendRepository, SequenceRepository, StorageBackend};
use seqrelay::{JournalBackend, JournalConfig, RangeSet, RmPolicy};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "rm-tool")]
#[command(about = "Developer tooling for seqrelay state stores and policies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print sequences and queued sends recovered from a journal directory.
    Inspect {
        #[arg(long)]
        dir: PathBuf,
    },
    /// List journal records committed after a sequence number.
    Journal {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = 0)]
        after: u64,
    },
    /// Validate a policy file and print it with defaults filled in.
    ValidatePolicy {
        #[arg(long)]
        file: PathBuf,
    },
    DefaultPolicy,
    /// Normalize an acknowledgement range list such as "[1,3][5,7][4,4]".
    Ranges {
        text: String,
        /// Report missing numbers up to this one.
        #[arg(long)]
        up_to: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { dir } => inspect(&dir).await,
        Command::Journal { dir, after } => list_journal(&dir, after).await,
        Command::ValidatePolicy { file } => validate_policy(&file),
        Command::DefaultPolicy => {
            let json = serde_json::to_string_pretty(&RmPolicy::default())
                .context("Failed to serialize default policy")?;
            println!("{}", json);
            Ok(())
        }
        Command::Ranges { text, up_to } => ranges(&text, up_to),
    }
}

async fn open_backend(dir: &Path) -> Result<JournalBackend> {
    if !dir.is_dir() {
        return Err(anyhow!("'{}' is not a directory", dir.display()));
    }
    JournalBackend::open(dir, JournalConfig::default())
        .await
        .with_context(|| format!("Failed to open journal directory '{}'", dir.display()))
}

async fn inspect(dir: &Path) -> Result<()> {
    let backend = open_backend(dir).await?;
    let loaded = backend
        .load()
        .await
        .with_context(|| format!("Failed to recover state from '{}'", dir.display()))?;
    let tables = loaded.tables;

    println!("Recovered through commit {}", loaded.last_seq);
    println!("Sending sequences:");
    for record in tables.sending_sequences() {
        println!(
            "  {} wire={} state={:?} acked={} last={:?} next={} replies_expected={}",
            record.internal_id,
            record.sequence_id.as_deref().unwrap_or("-"),
            record.state(),
            record.acked,
            record.last_message_number,
            record.next_message_number,
            record.expected_replies
        );
        if let Some(error) = &record.last_send_error {
            println!("    last send error: {}", error);
        }
    }
    println!("Receiving sequences:");
    for record in tables.receiving_sequences() {
        println!(
            "  {} state={:?} received={} next_to_invoke={} acks_to={}",
            record.internal_id,
            record.state(),
            record.acked,
            record.next_message_to_invoke,
            record.acks_to.as_deref().unwrap_or("-")
        );
    }
    println!("Queued sends:");
    for send in tables.sends.values() {
        println!(
            "  {} {} seq={} n={:?} attempts={} due_ms={} enabled={}",
            send.message_id,
            send.kind,
            send.sequence_id.as_deref().unwrap_or("-"),
            send.message_number,
            send.sent_count,
            send.time_to_send_ms,
            send.send
        );
    }
    let parked = tables.pollable(i64::MAX, None, None);
    if !parked.is_empty() {
        println!("Parked for MakeConnection: {}", parked.len());
    }
    println!("Queued invocations: {}", tables.invokes.len());
    Ok(())
}

async fn list_journal(dir: &Path, after: u64) -> Result<()> {
    let backend = open_backend(dir).await?;
    let records = backend
        .read_journal_records(after)
        .await
        .with_context(|| format!("Failed to read journal in '{}'", dir.display()))?;
    if records.is_empty() {
        println!("No journal records after {}", after);
        return Ok(());
    }
    for record in records {
        let ops = record
            .ops
            .iter()
            .map(|op| op.label())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:>8} {:>14} {:<28} {}",
            record.seq, record.ts_unix_ms, record.label, ops
        );
    }
    Ok(())
}

fn validate_policy(file: &Path) -> Result<()> {
    let policy = RmPolicy::from_json_file(file)
        .with_context(|| format!("Invalid policy file '{}'", file.display()))?;
    let json = serde_json::to_string_pretty(&policy).context("Failed to serialize policy")?;
    println!("{}", json);
    Ok(())
}

fn ranges(text: &str, up_to: Option<u64>) -> Result<()> {
    let set = RangeSet::from_str(text).with_context(|| format!("Invalid range list '{}'", text))?;
    println!("normalized: {}", set);
    println!("count: {}", set.covered_count());
    if let Some(upper) = up_to.or(set.highest()) {
        let gaps = set.gaps_up_to(upper);
        if gaps.is_empty() {
            println!("complete up to {}", upper);
        } else {
            let listed = gaps.iter().map(|gap| gap.to_string()).collect::<String>();
            println!("missing up to {}: {}", upper, listed);
        }
    }
    Ok(())
}
