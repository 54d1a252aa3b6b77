/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stagg::config::{Args, ServerConfig};
use stagg::{Server, DEFAULT_STAGE_TIMEOUT};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &ServerConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level {}", config.log_level))?;

    let stderr_layer = config
        .log_stderr
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::resolve(&args)?;
    init_logging(&config)?;

    let mut server = Server::new(config);
    // A collector bind failure aborts startup with a non-zero exit.
    server.start().await?;
    info!("stagg started");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, initiating shutdown");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                match ServerConfig::resolve(&args) {
                    Ok(config) => {
                        if let Err(err) = server.reload(config, DEFAULT_STAGE_TIMEOUT).await {
                            error!(error = %err, "reload failed");
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "ignoring reload, configuration is invalid");
                    }
                }
            }
        }
    }

    server.shutdown(DEFAULT_STAGE_TIMEOUT).await;
    info!("shutdown complete");
    Ok(())
}
