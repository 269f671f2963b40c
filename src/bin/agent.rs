use std::path::PathBuf;

use clap::Parser;
use hostwatch::{
    config::read_config_file,
    lifecycle::{Coordinator, FATAL_EXIT_CODE, run_agent},
    os_signals::ShutdownSignals,
    util::get_config_path,
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Host telemetry agent")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit debug diagnostics on stderr
    #[arg(short, long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    let filter = filter::Targets::new().with_targets(vec![("hostwatch", level), ("agent", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let path = args.config.unwrap_or_else(get_config_path);
    let config = match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config from {}: {e}", path.display());
            std::process::exit(FATAL_EXIT_CODE);
        }
    };
    info!(agent = %config.agent.id, "loaded config from {}", path.display());

    let termination = ShutdownSignals::install().map(ShutdownSignals::recv);
    let code = run_agent(Coordinator::new(config), termination).await;
    std::process::exit(code);
}
