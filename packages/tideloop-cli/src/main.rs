use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::rc::Rc;
use tideloop::{LoopConfig, Scheduler, WallClock};
use tracing_subscriber::EnvFilter;

mod scenarios;

use scenarios::{Scenario, Transcript};

#[derive(Parser)]
#[command(name = "tideloop")]
#[command(about = "Runs event loop demonstration scenarios", long_about = None)]
struct Cli {
    /// Log filter, e.g. `debug` or `tideloop=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log: Option<String>,

    /// JSON file with loop configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the run result as JSON once the loop finishes
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    scenario: Scenario,
}

fn init_tracing(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter `{directives}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref())?;

    let config = match &cli.config {
        Some(path) => LoopConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LoopConfig::default(),
    };
    tracing::debug!(?config, scenario = ?cli.scenario, "starting");

    let scheduler = Rc::new(Scheduler::with_config(WallClock::new(), config)?);
    let out = Transcript::stdout();

    scenarios::prepare(&cli.scenario, &scheduler, &out)?;
    let result = scheduler.run();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}
