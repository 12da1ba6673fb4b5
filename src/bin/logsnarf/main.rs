// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logsnarf::crypto::init_crypto_provider;
use logsnarf::init::args::{LogFormatArg, StartArgs};
use logsnarf::init::config::ConfigSource;
use logsnarf::init::wait;
use logsnarf::pipeline::Pipeline;

// Added to the longest per-pipeline shutdown timeout when waiting for pipelines to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Tail log files and upload them
    Start(StartArgs),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logsnarf")]
#[command(bin_name = "logsnarf")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGSNARF_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(args)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = init_crypto_provider() {
                error!(error = e, "Failed to initialize TLS.");
                return ExitCode::from(1);
            }

            match run(args) {
                Ok(_) => {}
                Err(e) => {
                    error!(error = e, "Failed to run logsnarf.");
                    return ExitCode::from(1);
                }
            }
        }
        _ => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run(args: StartArgs) -> Result<(), BoxError> {
    let source = ConfigSource::new(args.config.clone())?;
    let mut names = args.pipeline_names();
    if names.is_empty() {
        names = source.pipeline_names()?;
    }
    if names.is_empty() {
        return Err("no pipelines configured".into());
    }
    info!(config = ?source.file(), pipelines = ?names, "Starting logsnarf");

    // Build everything before starting anything, so a bad section aborts startup cleanly.
    let mut pipelines = Vec::with_capacity(names.len());
    let mut shutdown_timeout = Duration::ZERO;
    for name in &names {
        let config = source.pipeline(name)?;
        shutdown_timeout = shutdown_timeout.max(config.shutdown_timeout);
        let pipeline = Pipeline::build(name, &config)
            .map_err(|e| format!("failed to set up pipeline {}: {}", name, e))?;
        pipelines.push(pipeline);
    }

    let cancel_token = CancellationToken::new();
    let mut pipeline_set: JoinSet<Result<(), BoxError>> = JoinSet::new();
    for pipeline in pipelines {
        pipeline_set.spawn(pipeline.run(cancel_token.clone()));
    }

    select! {
        res = signal_wait() => {
            res?;
            info!("Shutdown signal received.");
        },
        e = wait::wait_for_any_task(&mut pipeline_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of pipeline."),
                Err(e) => {
                    cancel_token.cancel();
                    let _ = wait::wait_for_tasks_with_timeout(
                        &mut pipeline_set,
                        shutdown_timeout + SHUTDOWN_GRACE,
                    )
                    .await;
                    return Err(e);
                }
            }
        },
    }

    cancel_token.cancel();
    wait::wait_for_tasks_with_timeout(&mut pipeline_set, shutdown_timeout + SHUTDOWN_GRACE)
        .await?;

    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("rustls=warn".parse()?);

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stdout().is_terminal();

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

async fn signal_wait() -> Result<(), BoxError> {
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_int = signal(SignalKind::interrupt())?;

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
    Ok(())
}
