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

//! # stagg - Statsd-compatible metrics aggregation daemon
//!
//! Ingests Statsd metric lines from UDP and TCP collectors, aggregates
//! them in memory over a fixed wall-clock interval, and periodically
//! flushes the aggregated snapshot to Graphite, file, and stdout
//! destinations.
//!
//! ## Pipeline
//!
//! network bytes → collector → shared queue → processor (parse → shelf)
//! → flush timer → destinations
//!
//! ## Example
//!
//! ```rust,no_run
//! use stagg::config::{Args, ServerConfig};
//! use stagg::Server;
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::resolve(&Args::parse())?;
//!     let mut server = Server::new(config);
//!     server.start().await?;
//!     // ... wait for a shutdown signal ...
//!     server.shutdown(stagg::DEFAULT_STAGE_TIMEOUT).await;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod aggregation;
pub mod config;
pub mod model;
pub mod sinks;
pub mod sources;
pub mod sync;

use aggregation::{ProcessorHandle, QueueProcessor};
use config::{Endpoint, ServerConfig};
use sinks::{stdout_sink, Destination, FileSink, GraphiteSink};
use sources::{Collector, CollectorConfig, CollectorHandle, TcpCollector, UdpCollector};
use sync::{request_queue, QueueSender, StateFlag};

/// Default per-stage timeout for graceful shutdown and reload.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long startup waits for the processor and each collector to
/// report ready.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

struct RunningCollector {
    handle: CollectorHandle,
    task: JoinHandle<()>,
}

/// Statsd server supervisor.
///
/// Owns the shared queue, the queue processor, and one collector per
/// configured endpoint. Startup brings the processor up before any
/// collector; shutdown stops collectors first so the processor can
/// drain the queue and emit a final flush. Reload replaces collectors
/// and destinations while the processor and its shelf keep running.
pub struct Server {
    config: ServerConfig,
    queue: Option<QueueSender>,
    processor: Option<ProcessorHandle>,
    processor_task: Option<JoinHandle<()>>,
    collectors: Vec<RunningCollector>,
    running: StateFlag,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            queue: None,
            processor: None,
            processor_task: None,
            collectors: Vec::new(),
            running: StateFlag::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_set()
    }

    pub async fn wait_until_running(&self, timeout: Duration) -> bool {
        self.running.wait_timeout(timeout).await
    }

    /// Addresses the collectors are bound to, in startup order (UDP
    /// endpoints first).
    pub fn collector_addrs(&self) -> Vec<SocketAddr> {
        self.collectors
            .iter()
            .filter_map(|collector| collector.handle.local_addr())
            .collect()
    }

    /// Start the queue processor, then every configured collector.
    ///
    /// A collector bind failure aborts startup and tears down whatever
    /// already came up.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_set() {
            bail!("server is already running");
        }
        if self.config.udp.is_empty() && self.config.tcp.is_empty() {
            bail!("can not start without a collector");
        }
        info!("starting");

        let (queue_tx, queue_rx) = request_queue(self.config.queue_size);
        let flush_interval = Duration::from_secs_f64(self.config.flush_interval);
        let mut processor = QueueProcessor::new(queue_rx, flush_interval);
        processor.set_destinations(create_destinations(&self.config));
        let processor_handle = processor.handle();
        let processor_task = tokio::spawn(processor.process());

        if !processor_handle.wait_until_processing(STARTUP_TIMEOUT).await {
            processor_handle.shutdown();
            bail!("queue processor failed to start");
        }

        if let Err(err) = self.start_collectors(&queue_tx).await {
            self.stop_collectors(DEFAULT_STAGE_TIMEOUT).await;
            processor_handle.shutdown();
            processor_handle
                .wait_until_shutdown(DEFAULT_STAGE_TIMEOUT)
                .await;
            return Err(err);
        }

        self.queue = Some(queue_tx);
        self.processor = Some(processor_handle);
        self.processor_task = Some(processor_task);
        self.running.set();
        info!("collectors are running");
        Ok(())
    }

    /// Gracefully stop everything: collectors first, then the processor
    /// (which drains the queue and emits a final flush), then the
    /// queue. Each stage is bounded by `timeout`; a stage that exceeds
    /// it is logged and forced.
    pub async fn shutdown(&mut self, timeout: Duration) {
        info!("shutting down");
        self.stop_collectors(timeout).await;

        if let Some(processor) = self.processor.take() {
            processor.shutdown();
            if !processor.wait_until_shutdown(timeout).await {
                warn!("queue processor shutdown timed out");
            }
        }
        if let Some(task) = self.processor_task.take() {
            let _ = tokio::time::timeout(timeout, task).await;
        }

        self.queue = None;
        self.running.clear();
        info!("shutdown complete");
    }

    /// Apply a re-read configuration: stop collectors, swap the
    /// destination list, and start collectors from the new
    /// configuration. The processor, its shelf, and the flush cadence
    /// are untouched, so no folded metric is lost and no flush is
    /// skipped or duplicated.
    pub async fn reload(&mut self, config: ServerConfig, timeout: Duration) -> Result<()> {
        if !self.running.is_set() {
            bail!("server is not running, can not reload");
        }
        info!("reloading");
        self.stop_collectors(timeout).await;
        self.config = config;

        if let Some(processor) = &self.processor {
            processor.set_destinations(create_destinations(&self.config));
        }

        let queue = self.queue.clone().context("request queue is gone")?;
        self.start_collectors(&queue).await?;
        info!("reload complete");
        Ok(())
    }

    async fn start_collectors(&mut self, queue: &QueueSender) -> Result<()> {
        let udp = self.config.udp.clone();
        let tcp = self.config.tcp.clone();
        for endpoint in &udp {
            let collector = UdpCollector::new(self.collector_config(endpoint), queue.clone());
            self.spawn_collector(Box::new(collector)).await?;
        }
        for endpoint in &tcp {
            let collector = TcpCollector::new(
                self.collector_config(endpoint),
                queue.clone(),
                self.config.collector_threads,
                self.config.collector_threads_limit,
            );
            self.spawn_collector(Box::new(collector)).await?;
        }
        Ok(())
    }

    async fn spawn_collector(&mut self, mut collector: Box<dyn Collector>) -> Result<()> {
        collector.bind().await?;
        let handle = collector.handle();
        let task = tokio::spawn(collector.run());
        if !handle.wait_until_queuing_requests(STARTUP_TIMEOUT).await {
            handle.shutdown();
            bail!("collector failed to start queuing requests");
        }
        self.collectors.push(RunningCollector { handle, task });
        Ok(())
    }

    async fn stop_collectors(&mut self, timeout: Duration) {
        for collector in &self.collectors {
            collector.handle.shutdown();
        }
        for collector in self.collectors.drain(..) {
            if !collector.handle.wait_until_shutdown(timeout).await {
                warn!("collector shutdown timed out, forcing close");
                collector.task.abort();
            }
        }
    }

    fn collector_config(&self, endpoint: &Endpoint) -> CollectorConfig {
        CollectorConfig {
            host: endpoint.host.clone(),
            port: endpoint.port,
            user: self.config.user.clone(),
            group: self.config.group.clone(),
        }
    }
}

/// Build the destination list for the processor, in flush order:
/// stdout, then Graphite endpoints, then files, then CSV files.
pub fn create_destinations(config: &ServerConfig) -> Vec<Box<dyn Destination>> {
    let mut destinations: Vec<Box<dyn Destination>> = Vec::new();
    if config.flush_stdout {
        destinations.push(Box::new(stdout_sink()));
    }
    for endpoint in &config.graphite {
        destinations.push(Box::new(GraphiteSink::new(
            endpoint.host.clone(),
            endpoint.port,
        )));
    }
    for path in &config.flush_files {
        destinations.push(Box::new(FileSink::carbon(path.clone())));
    }
    for path in &config.flush_csv_files {
        destinations.push(Box::new(FileSink::csv(path.clone())));
    }
    destinations
}
