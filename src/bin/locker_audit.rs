//! Off-line audit tool: hash files and check ledger records without the
//! HTTP service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use evidence_locker::chain::ChainClient;
use evidence_locker::config::LockerConfig;
use evidence_locker::digest::digest_reader;
use evidence_locker::ledger::EvidenceKey;
use evidence_locker::verify::{verify_against_ledger, BlockchainRecord, VerificationStatus};

#[derive(Parser, Debug)]
#[command(name = "locker-audit", version, about = "Audit evidence against the anchoring ledger")]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute the SHA-256 digest of a file.
    Hash {
        path: PathBuf,
    },
    /// Show the ledger record stored under a key (`<caseId>/<evidenceId>` or a bare case id).
    Lookup {
        key: String,
    },
    /// Hash a file and compare it with the record stored under a key.
    Verify {
        path: PathBuf,
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Hash { path } => handle_hash(path, cli.json).await,
        Commands::Lookup { key } => handle_lookup(key, cli.json).await,
        Commands::Verify { path, key } => handle_verify(path, key, cli.json).await,
    }
}

async fn hash_file(path: &PathBuf) -> Result<(evidence_locker::FileDigest, u64)> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    Ok(digest_reader(file).await?)
}

async fn connect() -> Result<ChainClient> {
    let config = LockerConfig::from_env().context("invalid configuration")?;
    let ledger = evidence_locker::open_ledger(&config).await?;
    Ok(ChainClient::new(ledger, config.anchor))
}

async fn handle_hash(path: PathBuf, json: bool) -> Result<ExitCode> {
    let (digest, size) = hash_file(&path).await?;
    if json {
        println!("{}", serde_json::json!({ "path": path, "hash": digest, "size_bytes": size }));
    } else {
        println!("{}  {}", digest, path.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_lookup(key: String, json: bool) -> Result<ExitCode> {
    let key = EvidenceKey::parse(&key)?;
    let chain = connect().await?;
    let record = chain.lookup(&key).await.context("ledger lookup failed")?;

    match record {
        Some(record) => {
            let shown = BlockchainRecord::from(&record);
            if json {
                println!("{}", serde_json::json!({ "key": key.to_string(), "found": true, "record": shown }));
            } else {
                println!("key:           {}", key);
                println!("stored hash:   {}", shown.stored_hash);
                match shown.timestamp {
                    Some(ts) => println!("anchored at:   {}", ts.to_rfc3339()),
                    None => println!("anchored at:   {} (raw)", record.timestamp),
                }
                if let Some(role) = shown.uploader_role {
                    println!("uploader role: {}", role);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            if json {
                println!("{}", serde_json::json!({ "key": key.to_string(), "found": false }));
            } else {
                println!("No ledger record for '{}'", key);
            }
            Ok(ExitCode::from(2))
        }
    }
}

async fn handle_verify(path: PathBuf, key: String, json: bool) -> Result<ExitCode> {
    let key = EvidenceKey::parse(&key)?;
    let (digest, _) = hash_file(&path).await?;
    let chain = connect().await?;

    let report = verify_against_ledger(&chain, &key, digest).await.context("ledger lookup failed")?;

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!("{:?}: {}", report.status, report.status.details());
        println!("computed hash: {}", digest);
        if let Some(record) = &report.record {
            println!("stored hash:   {}", record.stored_hash);
        }
    }

    Ok(match report.status {
        VerificationStatus::Verified => ExitCode::SUCCESS,
        VerificationStatus::Mismatch => ExitCode::from(1),
        VerificationStatus::NotFound => ExitCode::from(2),
    })
}
