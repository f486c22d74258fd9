use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use oplog_replicator::{Config, FileLedgerStore, ProgressLedger, WorkerSettings};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "oplog-replicator")]
#[command(about = "Oplog tailing replicator: progress ledger administration", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the last committed timestamp of every source
    Progress {
        #[arg(long, help = "Print entries as JSON")]
        json: bool,
    },
    /// Forget progress so the next start performs a full dump
    Reset {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        source: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Validate the configuration and print a summary
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).with_context(|| format!("loading {}", args.config.display()));
        }
    };

    let ledger = ProgressLedger::new(FileLedgerStore::new(&config.ledger.path));

    match args.command {
        Commands::Progress { json } => print_progress(&ledger, json).await,
        Commands::Reset { source, all } => reset(&ledger, source, all).await,
        Commands::Check => check(&config),
    }
}

async fn print_progress(ledger: &ProgressLedger<FileLedgerStore>, json: bool) -> anyhow::Result<()> {
    let entries = ledger
        .entries()
        .await
        .context("reading progress ledger")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("no progress recorded");
    }
    for entry in entries {
        println!(
            "{}\t{}\t{}\t{}",
            entry.source,
            entry.timestamp(),
            entry.commit_ts,
            entry.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn reset(
    ledger: &ProgressLedger<FileLedgerStore>,
    source: Option<String>,
    all: bool,
) -> anyhow::Result<()> {
    let sources = match (source, all) {
        (Some(source), false) => vec![source],
        (None, true) => ledger.entries().await?.into_iter().map(|e| e.source).collect(),
        _ => bail!("pass either --source or --all"),
    };
    for source in sources {
        let existed = ledger
            .reset(&source)
            .await
            .with_context(|| format!("resetting {}", source))?;
        if existed {
            println!("reset {}", source);
        } else {
            println!("{}: no progress recorded", source);
        }
    }
    Ok(())
}

fn check(config: &Config) -> anyhow::Result<()> {
    let settings = WorkerSettings::from_config(config).context("invalid configuration")?;
    info!(
        namespaces = ?config.replication.namespaces,
        batch_size = settings.batch_size,
        poll_interval_ms = config.replication.poll_interval_ms,
        checkpoint_interval_secs = config.replication.checkpoint_interval_secs,
        ledger = %config.ledger.path.display(),
        "Configuration summary"
    );
    println!("configuration ok");
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("oplog_replicator=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("oplog_replicator=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
