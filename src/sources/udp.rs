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

//! UDP collector
//!
//! One datagram socket per collector; each received datagram is pushed
//! onto the shared queue as a single raw request. Datagrams are
//! self-contained, so there is no per-client state.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{drop_privileges, Collector, CollectorConfig, CollectorHandle, MAX_READ_SIZE};
use crate::sync::QueueSender;

/// Collect Statsd metrics from a UDP socket.
pub struct UdpCollector {
    config: CollectorConfig,
    queue: QueueSender,
    socket: Option<UdpSocket>,
    handle: CollectorHandle,
}

impl UdpCollector {
    pub fn new(config: CollectorConfig, queue: QueueSender) -> Self {
        Self {
            config,
            queue,
            socket: None,
            handle: CollectorHandle::new(),
        }
    }
}

#[async_trait]
impl Collector for UdpCollector {
    async fn bind(&mut self) -> Result<SocketAddr> {
        let socket = UdpSocket::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind udp collector to {}:{}",
                    self.config.host, self.config.port
                )
            })?;
        let addr = socket.local_addr()?;
        drop_privileges(self.config.user.as_deref(), self.config.group.as_deref())?;
        let _ = self.handle.local_addr.set(addr);
        info!(%addr, "udp collector bound");
        self.socket = Some(socket);
        Ok(addr)
    }

    async fn run(self: Box<Self>) {
        let Some(socket) = self.socket else {
            self.handle.stopped.set();
            return;
        };

        info!("serving udp requests");
        self.handle.queuing.set();

        let mut buf = vec![0u8; MAX_READ_SIZE];
        loop {
            tokio::select! {
                _ = self.handle.stop.wait() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => match std::str::from_utf8(&buf[..len]) {
                        Ok(payload) if !payload.is_empty() => {
                            if !self.queue.send(payload.to_owned()).await {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(_) => debug!(%peer, "dropping non-utf8 datagram"),
                    },
                    Err(err) => warn!(error = %err, "udp read error"),
                },
            }
        }

        self.handle.queuing.clear();
        self.handle.stopped.set();
        info!("udp collector stopped");
    }

    fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }
}
