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

//! TCP collector
//!
//! A listening socket feeding an elastic pool of connection workers.
//! The pool starts at a configured size and may grow to a hard limit
//! when every worker is busy; at the limit the accept loop itself waits,
//! which backpressures new connections. Workers frame the byte stream
//! into lines and enqueue each complete line as one raw request; a
//! trailing partial line is kept across reads and discarded when the
//! client closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{drop_privileges, Collector, CollectorConfig, CollectorHandle, MAX_READ_SIZE};
use crate::sync::{QueueSender, StateFlag};

/// How long a worker above the initial pool size waits for a connection
/// before retiring.
pub const IDLE_WORKER_GRACE: Duration = Duration::from_secs(30);

type SharedConnections = Arc<Mutex<mpsc::Receiver<TcpStream>>>;

/// Collect Statsd metrics from TCP connections.
pub struct TcpCollector {
    config: CollectorConfig,
    queue: QueueSender,
    workers: usize,
    workers_limit: usize,
    listener: Option<TcpListener>,
    handle: CollectorHandle,
}

impl TcpCollector {
    pub fn new(
        config: CollectorConfig,
        queue: QueueSender,
        workers: usize,
        workers_limit: usize,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            config,
            queue,
            workers,
            workers_limit: workers_limit.max(workers),
            listener: None,
            handle: CollectorHandle::new(),
        }
    }
}

#[async_trait]
impl Collector for TcpCollector {
    async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind tcp collector to {}:{}",
                    self.config.host, self.config.port
                )
            })?;
        let addr = listener.local_addr()?;
        drop_privileges(self.config.user.as_deref(), self.config.group.as_deref())?;
        let _ = self.handle.local_addr.set(addr);
        info!(%addr, "tcp collector bound");
        self.listener = Some(listener);
        Ok(addr)
    }

    async fn run(self: Box<Self>) {
        let Some(listener) = self.listener else {
            self.handle.stopped.set();
            return;
        };

        let pool_size = Arc::new(AtomicUsize::new(0));
        // Capacity 1: a full slot means no worker is waiting for work.
        let (conn_tx, conn_rx) = mpsc::channel::<TcpStream>(1);
        let conn_rx: SharedConnections = Arc::new(Mutex::new(conn_rx));

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            spawn_worker(
                &mut workers,
                id,
                false,
                conn_rx.clone(),
                self.queue.clone(),
                self.handle.stop.clone(),
                pool_size.clone(),
            );
        }

        info!("serving tcp requests");
        self.handle.queuing.set();

        let mut next_worker_id = self.workers;
        loop {
            tokio::select! {
                _ = self.handle.stop.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        match conn_tx.try_send(stream) {
                            Ok(()) => {}
                            Err(TrySendError::Full(stream)) => {
                                if pool_size.load(Ordering::Acquire) < self.workers_limit {
                                    spawn_worker(
                                        &mut workers,
                                        next_worker_id,
                                        true,
                                        conn_rx.clone(),
                                        self.queue.clone(),
                                        self.handle.stop.clone(),
                                        pool_size.clone(),
                                    );
                                    next_worker_id += 1;
                                }
                                // At the pool limit this parks the accept
                                // loop until a worker frees up.
                                if conn_tx.send(stream).await.is_err() {
                                    break;
                                }
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(err) => warn!(error = %err, "accept error"),
                },
            }
        }

        // Close the listener, then let in-flight connection reads finish.
        drop(listener);
        drop(conn_tx);
        while workers.join_next().await.is_some() {}

        self.handle.queuing.clear();
        self.handle.stopped.set();
        info!("tcp collector stopped");
    }

    fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }
}

fn spawn_worker(
    workers: &mut JoinSet<()>,
    id: usize,
    transient: bool,
    connections: SharedConnections,
    queue: QueueSender,
    stop: StateFlag,
    pool_size: Arc<AtomicUsize>,
) {
    pool_size.fetch_add(1, Ordering::AcqRel);
    workers.spawn(async move {
        debug!(id, transient, "connection worker started");
        loop {
            let connection = if transient {
                match tokio::time::timeout(IDLE_WORKER_GRACE, async {
                    connections.lock().await.recv().await
                })
                .await
                {
                    Ok(connection) => connection,
                    Err(_) => {
                        debug!(id, "idle worker retiring");
                        None
                    }
                }
            } else {
                connections.lock().await.recv().await
            };

            let Some(connection) = connection else { break };
            serve_connection(connection, &queue, &stop).await;
            if stop.is_set() {
                break;
            }
        }
        pool_size.fetch_sub(1, Ordering::AcqRel);
        debug!(id, "connection worker stopped");
    });
}

/// Read one connection to completion, enqueuing each complete line.
///
/// `read_until` keeps an incomplete trailing line buffered across
/// reads; a partial line still pending when the client closes is
/// discarded.
async fn serve_connection(stream: TcpStream, queue: &QueueSender, stop: &StateFlag) {
    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::with_capacity(MAX_READ_SIZE, stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        tokio::select! {
            _ = stop.wait() => break,
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if line.last() != Some(&b'\n') {
                        // EOF in the middle of a line.
                        break;
                    }
                    let Ok(text) = std::str::from_utf8(&line) else {
                        debug!(?peer, "dropping non-utf8 line");
                        continue;
                    };
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if !queue.send(text.to_owned()).await {
                        break;
                    }
                }
                Err(err) => {
                    debug!(?peer, error = %err, "connection read error");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::request_queue;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn local_config() -> CollectorConfig {
        CollectorConfig {
            host: "127.0.0.1".into(),
            port: 0,
            user: None,
            group: None,
        }
    }

    async fn started_collector(
        workers: usize,
        limit: usize,
    ) -> (SocketAddr, CollectorHandle, crate::sync::QueueReceiver) {
        let (queue_tx, queue_rx) = request_queue(0);
        let mut collector = TcpCollector::new(local_config(), queue_tx, workers, limit);
        let addr = collector.bind().await.unwrap();
        let handle = collector.handle();
        tokio::spawn(Box::new(collector).run());
        assert!(
            handle
                .wait_until_queuing_requests(Duration::from_secs(5))
                .await
        );
        (addr, handle, queue_rx)
    }

    async fn expect_request(queue_rx: &mut crate::sync::QueueReceiver) -> String {
        timeout(Duration::from_secs(5), queue_rx.recv())
            .await
            .expect("timed out waiting for a queued request")
            .expect("queue closed unexpectedly")
    }

    #[tokio::test]
    async fn test_tcp_collector_frames_complete_lines() {
        let (addr, handle, mut queue_rx) = started_collector(2, 4).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"a:1|c\nb:2|c\npartial:3").await.unwrap();

        assert_eq!(expect_request(&mut queue_rx).await, "a:1|c");
        assert_eq!(expect_request(&mut queue_rx).await, "b:2|c");

        // The partial line stays buffered until its terminator arrives.
        assert!(
            timeout(Duration::from_millis(200), queue_rx.recv())
                .await
                .is_err()
        );

        client.write_all(b"|c\n").await.unwrap();
        assert_eq!(expect_request(&mut queue_rx).await, "partial:3|c");

        drop(client);
        handle.shutdown();
        assert!(handle.wait_until_shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_tcp_collector_discards_partial_line_on_close() {
        let (addr, handle, mut queue_rx) = started_collector(1, 2).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x:1|c\nleftover:9").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        assert_eq!(expect_request(&mut queue_rx).await, "x:1|c");
        assert!(
            timeout(Duration::from_millis(200), queue_rx.recv())
                .await
                .is_err()
        );

        handle.shutdown();
        assert!(handle.wait_until_shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_tcp_collector_grows_past_initial_pool() {
        let (addr, handle, mut queue_rx) = started_collector(1, 4).await;

        // Three clients held open against a single initial worker. The
        // third arrival finds every worker busy and forces the pool to
        // grow, so the second connection gets served while the first is
        // still open.
        let mut clients = Vec::new();
        for i in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(format!("conn{i}:1|c\n").as_bytes())
                .await
                .unwrap();
            clients.push(client);
        }

        let mut received = vec![
            expect_request(&mut queue_rx).await,
            expect_request(&mut queue_rx).await,
        ];
        received.sort();
        assert_eq!(received, vec!["conn0:1|c", "conn1:1|c"]);

        // The third connection waits for a free worker.
        assert!(
            timeout(Duration::from_millis(200), queue_rx.recv())
                .await
                .is_err()
        );

        drop(clients);
        assert_eq!(expect_request(&mut queue_rx).await, "conn2:1|c");

        handle.shutdown();
        assert!(handle.wait_until_shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_tcp_collector_bind_failure_is_fatal() {
        let (queue_tx, _queue_rx) = request_queue(0);
        let mut first = TcpCollector::new(local_config(), queue_tx.clone(), 1, 1);
        let addr = first.bind().await.unwrap();

        let mut second = TcpCollector::new(
            CollectorConfig {
                port: addr.port(),
                ..local_config()
            },
            queue_tx,
            1,
            1,
        );
        assert!(second.bind().await.is_err());
    }
}
