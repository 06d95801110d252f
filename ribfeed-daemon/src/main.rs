//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;

use clap::Parser;
use config::{Config, LoggingFileRotation, LoggingFmtStyle};
use ribfeed::coordinator::ImportCoordinator;
use ribfeed::proto::coordinator_server::CoordinatorServer;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "ribfeedd", version, about = "BIRD route-import coordinator daemon")]
struct Args {
    /// Specify an alternative configuration file.
    #[arg(short, long, value_name = "file")]
    config: Option<String>,
}

fn init_tracing(config: &config::Logging) {
    // Enable logging to a file.
    let file = config.file.enabled.then(|| {
        let file_appender = match config.file.rotation {
            LoggingFileRotation::Never => {
                rolling::never(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Hourly => {
                rolling::hourly(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Daily => {
                rolling::daily(&config.file.dir, &config.file.name)
            }
        };

        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(false)
            .with_ansi(false);
        let layer = match config.file.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        let log_level_filter = LevelFilter::from_level(tracing::Level::TRACE);
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(config.stdout.colors);
        let layer = match config.stdout.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(log_level_filter)
    });

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("ribfeed=debug".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file)
        .with(stdout)
        .init();
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let args = Args::parse();

    // Read configuration file.
    let config = Config::load(args.config.as_deref());

    // Initialize tracing.
    init_tracing(&config.logging);

    // Set panic handler to abort the process if any child task panics.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // We're ready to go!
    info!("starting up");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(async {
            run(config).await;
        });
}

async fn run(config: Config) {
    let address = config
        .listen_address
        .parse()
        .expect("Failed to parse gRPC server address");
    let coordinator = ImportCoordinator::new(config.gateway_endpoint);

    let shutdown = {
        let coordinator = coordinator.clone();
        async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for interrupt signal");
            info!("received interrupt signal, shutting down");
            coordinator.shutdown();
        }
    };

    tonic::transport::Server::builder()
        .add_service(CoordinatorServer::new(coordinator))
        .serve_with_shutdown(address, shutdown)
        .await
        .expect("Failed to start gRPC service");
}
