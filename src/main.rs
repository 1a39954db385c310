use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};

use amplicon_preprocess::cli::{parse, Command};
use amplicon_preprocess::config::run::RunConfiguration;
use amplicon_preprocess::pipelines::dispatcher::run_worker;
use amplicon_preprocess::pipelines::preprocess::Preprocess;
use amplicon_preprocess::PipelineError;

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();
    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    if let Command::Worker(worker) = &args.command {
        if let Err(e) = run_worker(&worker.manifest).await {
            error!("Worker failed: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let dir = std::env::current_dir()?;
    info!("The current directory is {:?}", dir);

    if let Err(e) = preprocess_run(&args.command).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    info!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

async fn preprocess_run(command: &Command) -> Result<(), PipelineError> {
    let (config, source) = RunConfiguration::from_command(command)?;
    debug!("Run configuration: {:?}", config);
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    Preprocess::new(Arc::new(config)).run(&source, &command_line).await
}
