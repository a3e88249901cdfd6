// reply-engine/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use reply_engine::{config::Config, run_engine};

/// Reply scheduling engine fed by newline-delimited JSON on stdin.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "reply-engine", version, about)]
struct Cli {
    /// Overrides BACKEND_URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Overrides DATA_DIR
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Overrides REPLY_MODE (interest or priority)
    #[arg(long)]
    reply_mode: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let mut cfg = Config::from_env()?;
    if let Some(url) = cli.backend_url {
        cfg.backend_url = url;
    }
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
    }
    if let Some(mode) = cli.reply_mode {
        cfg.orchestrator.reply_mode = mode.parse()?;
    }
    cfg.validate()?;

    if cli.check_config {
        reply_engine::telemetry::init_tracing();
        cfg.print_config();
        return Ok(());
    }

    run_engine(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
