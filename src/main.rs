//! # WS Loadgen - Main Entry Point
//!
//! 1. **Initialize logging**: console formatter plus optional log file
//! 2. **Parse arguments** and build the validated session config
//! 3. **Dial** every connection before any measurement starts
//! 4. **Run** the echo or rate session
//! 5. **Report**: print the report and write the JSON results file
//!
//! Any failure before the session starts (bad flags, unreachable target,
//! unresolvable server process) exits non-zero without writing results.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use ws_loadgen::{
    benchmark::{self, BenchmarkConfig},
    cli::Args,
    logging,
    pool::ConnectionPool,
    results::ResultsManager,
    ws,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = logging::init(args.verbose, args.log_file.as_deref())?;

    info!("Starting WS Loadgen v{}", ws_loadgen::VERSION);
    tracing::debug!("Configuration: {:?}", args);

    if let Err(e) = run(&args).await {
        error!("Benchmark failed: {:#}", e);
        return Err(e);
    }

    info!("WS Loadgen completed successfully");
    Ok(())
}

async fn run(args: &Args) -> Result<()> {
    let config = BenchmarkConfig::from_args(args)?;
    let mut results_manager = ResultsManager::new(&args.output_file);

    let conns = ws::dial_all(&config.hosts, &config.path, config.connections).await?;
    let pool = ConnectionPool::new(conns);
    info!("{} connections established", pool.len());

    let report = benchmark::run(config, pool).await?;
    println!("{}", report);

    results_manager.add_report(report);
    results_manager.print_summary();
    results_manager.finalize()?;
    Ok(())
}
