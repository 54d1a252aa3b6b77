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

//! Metric collectors for ingesting data from the network
//!
//! Collectors listen on a socket, turn received bytes into raw request
//! strings, and push them onto the shared queue injected by the server.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::sync::StateFlag;

pub mod tcp;
pub mod udp;

pub use tcp::TcpCollector;
pub use udp::UdpCollector;

/// Default Statsd listening port.
pub const DEFAULT_PORT: u16 = 8125;

/// Largest single read accepted from a client (64 KiB).
pub const MAX_READ_SIZE: usize = 64 * 1024;

/// Listening endpoint configuration shared by both collector kinds.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub host: String,
    pub port: u16,
    /// Drop to this user after binding.
    pub user: Option<String>,
    /// Drop to this group after binding.
    pub group: Option<String>,
}

/// Trait for all metric collectors.
///
/// Binding is the only fallible stage of the lifecycle; a bind failure
/// at startup aborts the server. Once bound, `run` serves until the
/// handle requests shutdown.
#[async_trait]
pub trait Collector: Send {
    /// Create the listening socket and drop privileges if configured.
    async fn bind(&mut self) -> Result<SocketAddr>;

    /// Serve requests until shutdown is requested. Must be called after
    /// a successful `bind`.
    async fn run(self: Box<Self>);

    /// Lifecycle handle shared with the supervisor.
    fn handle(&self) -> CollectorHandle;
}

/// Cloneable handle for observing and stopping a spawned collector.
#[derive(Clone)]
pub struct CollectorHandle {
    pub(crate) stop: StateFlag,
    pub(crate) queuing: StateFlag,
    pub(crate) stopped: StateFlag,
    pub(crate) local_addr: Arc<OnceLock<SocketAddr>>,
}

impl CollectorHandle {
    pub(crate) fn new() -> Self {
        Self {
            stop: StateFlag::new(),
            queuing: StateFlag::new(),
            stopped: StateFlag::new(),
            local_addr: Arc::new(OnceLock::new()),
        }
    }

    /// Request the collector to stop serving and close its socket.
    pub fn shutdown(&self) {
        self.stop.set();
    }

    pub fn is_queuing_requests(&self) -> bool {
        self.queuing.is_set()
    }

    pub async fn wait_until_queuing_requests(&self, timeout: Duration) -> bool {
        self.queuing.wait_timeout(timeout).await
    }

    pub async fn wait_until_shutdown(&self, timeout: Duration) -> bool {
        self.stopped.wait_timeout(timeout).await
    }

    /// The bound address, once binding has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

/// Switch the process to the configured user and group.
///
/// Called after the socket is bound and before the serve loop; the
/// group must change before the user or the right to setgid is gone.
pub(crate) fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if let Some(name) = group {
        let group = nix::unistd::Group::from_name(name)
            .with_context(|| format!("failed to look up group {name}"))?
            .with_context(|| format!("unknown group {name}"))?;
        nix::unistd::setgid(group.gid)
            .with_context(|| format!("failed to switch to group {name}"))?;
        tracing::info!(group = name, "changed process group");
    }
    if let Some(name) = user {
        let user = nix::unistd::User::from_name(name)
            .with_context(|| format!("failed to look up user {name}"))?
            .with_context(|| format!("unknown user {name}"))?;
        nix::unistd::setuid(user.uid)
            .with_context(|| format!("failed to switch to user {name}"))?;
        tracing::info!(user = name, "changed process user");
    }
    Ok(())
}
