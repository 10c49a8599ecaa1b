use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swbatch::device::DryRunDevice;
use swbatch::settings::AppConfig;
use swbatch::{kv, trace, BatchOrchestrator};

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Inspect and exercise switch batch queues
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a switch's pending batches, oldest first
    Pending { switch: String },
    /// Submit commands through the queue against a dry-run device that
    /// echoes them back
    Submit {
        switch: String,
        #[arg(required = true)]
        cmds: Vec<String>,
        /// how long to wait for the result; defaults to the configured timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Delete a switch's execution lock slots after its holder died
    Unlock { switch: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.logging.format);
    if args.verbose {
        println!("DEBUG {args:?}");
    }

    let store = kv::open(&cfg.coordination).await?;
    let orchestrator = BatchOrchestrator::new(store, cfg.batch.clone());

    match args.command {
        Command::Pending { switch } => {
            let queue = orchestrator.queue(&switch)?;
            let pending = queue.list_pending(None).await?;
            if pending.is_empty() {
                println!("no pending batches for {switch}");
            }
            for batch in pending {
                println!("{}\t{}", batch.uuid, batch.cmds.join("; "));
            }
        }
        Command::Submit {
            switch,
            cmds,
            timeout_secs,
        } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| cfg.batch.result_timeout());
            let device = Arc::new(DryRunDevice::new(switch));
            let result = orchestrator.submit(device, cmds, timeout).await;
            orchestrator.drain(cfg.batch.drain_grace()).await;
            println!("{}", result?);
        }
        Command::Unlock { switch } => {
            let deleted = orchestrator.queue(&switch)?.clear_execution_locks().await?;
            println!("deleted {deleted} lock slot(s) for {switch}");
        }
    }

    Ok(())
}
