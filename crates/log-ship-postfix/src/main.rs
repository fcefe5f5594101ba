// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use postfix_ship::{
    config::ShipperConfig,
    constants::INDEX_TEMPLATE_NAME,
    coordinator::BatchCoordinator,
    elastic::ElasticStore,
    errors::PipelineError,
    flow::FlowController,
    logger,
    pipeline::{Pipeline, PipelineExit},
    reader::{FileReader, FileReaderConfig},
    shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownReason},
    spool::ensure_spool_dir,
    tokenizer::SyslogTokenizer,
    watchdog::Watchdog,
};
use tokio_util::sync::CancellationToken;

const PIPELINE_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Ships postfix mail log lines to Elasticsearch as one document per message
#[derive(Debug, Parser)]
#[command(name = "log-ship-postfix", version)]
struct Args {
    /// Directory searched for log-ship-elastic-postfix.yaml before /etc and ./
    #[arg(short = 'c', long = "config-dir", env = "LOGSHIP_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match ShipperConfig::load(args.config_dir.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            // logging is not up yet
            eprintln!("LOGSHIP | ERROR | {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = format!(
        "h2=off,hyper=off,reqwest=off,rustls=off,{}",
        config.log_level
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ShipperConfig) -> Result<(), PipelineError> {
    let bookmark_dir = ensure_spool_dir(&config.spool_dir)?;
    let timezone = config.timezone()?;
    let partitions = config.partition_scheme()?;
    let store = ElasticStore::new(config.elastic())?;

    // nothing is read until the cluster answers and the mapping is in place
    store.ping().await?;
    store
        .install_template(INDEX_TEMPLATE_NAME, &partitions.index_glob())
        .await?;

    let reader = FileReader::open(FileReaderConfig {
        path: config.reader_file.clone(),
        bookmark_dir,
        batch_limit: config.batch_limit,
        follow: config.reader_follow,
        poll_interval: config.reader_poll,
    })
    .await?;

    let shutdown = CancellationToken::new();
    let watchdog = Watchdog::new(config.idle_timeout);
    let coordinator = BatchCoordinator::new(
        Arc::new(store),
        partitions,
        config.coordinator(),
        watchdog.clone(),
    );
    let flow = FlowController::new(coordinator, config.batch_limit);
    let pipeline = Pipeline::new(
        reader,
        SyslogTokenizer::new(timezone),
        flow,
        shutdown.clone(),
    );
    let state = pipeline.subscribe();

    info!(
        "Shipping {} to {} (batches of {})",
        config.reader_file.display(),
        config.store_hosts.join(","),
        config.batch_limit
    );

    let watchdog_task = tokio::spawn(watchdog.run(shutdown.clone()));
    let mut pipeline_task = tokio::spawn(pipeline.run());

    let reason = tokio::select! {
        () = shutdown_signal() => ShutdownReason::Signal,
        () = shutdown.cancelled() => ShutdownReason::Internal,
        result = &mut pipeline_task => {
            shutdown.cancel();
            watchdog_task.abort();
            return match result {
                Ok(Ok(PipelineExit::InputClosed)) => {
                    info!("Input closed, all records committed");
                    Ok(())
                }
                Ok(Ok(PipelineExit::Stopped)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
        }
    };

    let outcome = ShutdownCoordinator::new(shutdown.clone(), state, config.shutdown_deadline)
        .drain(reason)
        .await;
    debug!("Shutdown finished: {:?}", outcome);
    watchdog_task.abort();

    let settled = match outcome {
        ShutdownOutcome::DeadlineExceeded => None,
        _ => timeout(PIPELINE_EXIT_GRACE, &mut pipeline_task).await.ok(),
    };
    match settled {
        Some(Ok(Err(e))) => return Err(e),
        Some(Err(e)) => return Err(e.into()),
        Some(Ok(Ok(_))) => {}
        None => {
            warn!("Pipeline still running at exit, unconfirmed lines will be read again");
            pipeline_task.abort();
        }
    }

    match watchdog_task.await {
        Ok(true) => Err(PipelineError::IdleTimeout(config.idle_timeout)),
        _ => Ok(()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, draining"),
        () = terminate => info!("Received terminate signal, draining"),
    }
}
