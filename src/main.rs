use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use mail_triage::config::TriageConfig;
use mail_triage::mail::memory::INBOX_ID;
use mail_triage::mail::{CandidateMessage, GraphMailStore, InMemoryMailStore, MailStore};
use mail_triage::pipeline::{CycleScheduler, build_orchestrator};

/// Periodically triage a mailbox with a tool-calling classifier.
#[derive(Debug, Parser)]
#[command(name = "mail-triage", version)]
struct Args {
    /// Config file (defaults to $MAIL_TRIAGE_CONFIG or ./mail-triage.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use an in-memory mailbox instead of Microsoft Graph.
    #[arg(long)]
    dry_run: bool,

    /// JSON array of messages to load into the dry-run inbox.
    #[arg(long, requires = "dry_run")]
    seed: Option<PathBuf>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let dry_run = args.dry_run
        || std::env::var("MAIL_TRIAGE_DRY_RUN").is_ok_and(|v| v == "1" || v == "true");

    // ── Configuration ───────────────────────────────────────────────────
    let config_path = args.config.clone().unwrap_or_else(TriageConfig::path_from_env);
    let config = TriageConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let _log_guard = init_tracing(config.log_dir.as_deref());
    config.validate(dry_run).context("invalid configuration")?;

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!("   Mailbox: {}", config.mailbox.owner_id);
    eprintln!("   Source: {}", config.mailbox.source_folder);
    eprintln!("   Model: {}", config.classifier.model);
    eprintln!("   Every: {}s", config.schedule.poll_interval_secs);
    if dry_run {
        eprintln!("   Dry run: in-memory mailbox");
    }

    // ── Mail store ──────────────────────────────────────────────────────
    let store: Arc<dyn MailStore> = if dry_run {
        let memory = InMemoryMailStore::new();
        if let Some(ref seed) = args.seed {
            let messages = load_seed(seed)?;
            eprintln!("   Seeded {} message(s)", messages.len());
            for message in messages {
                memory.add_message(INBOX_ID, message);
            }
        }
        Arc::new(memory)
    } else {
        Arc::new(GraphMailStore::new(config.graph_config()?))
    };

    // ── Pipeline ────────────────────────────────────────────────────────
    let orchestrator = Arc::new(
        build_orchestrator(&config, store).context("building triage pipeline")?,
    );

    // ── Shutdown ────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down");
                cancel.cancel();
            }
        });
    }

    if args.once {
        match orchestrator.run_cycle(&cancel).await {
            Ok(report) => eprintln!(
                "   Cycle: fetched {}, moved {}, no action {}, errors {}",
                report.fetched, report.moved, report.no_action, report.errors
            ),
            Err(e) => eprintln!("   Cycle stopped: {e}"),
        }
        return Ok(());
    }

    let handle = CycleScheduler::new(orchestrator, config.poll_interval()).spawn(cancel);
    handle.await.context("scheduler task failed")?;

    Ok(())
}

/// Stderr logging, plus a daily-rolling file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

fn load_seed(path: &Path) -> anyhow::Result<Vec<CandidateMessage>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing seed file {}", path.display()))
}
