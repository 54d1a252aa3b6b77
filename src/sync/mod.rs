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

//! Cross-task plumbing: lifecycle flags and the shared request queue
//!
//! The request queue is the only mutable state shared between collectors
//! (producers) and the queue processor (single consumer). Everything else
//! communicates through [`StateFlag`] lifecycle latches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

/// A boolean lifecycle latch that tasks can set, clear, poll, and await.
///
/// Clones observe the same flag. Used for `is_processing` /
/// `is_queuing_requests` style probes and their `wait_until_*`
/// counterparts.
#[derive(Clone, Debug)]
pub struct StateFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl StateFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender cannot drop while `self` is alive, so this only
        // returns once the flag is observed set.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Wait until the flag is set, giving up after `timeout`.
    /// Returns whether the flag was observed set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for StateFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer half of the shared request queue.
///
/// Collectors clone one of these per listening endpoint. On a bounded
/// queue, `send` awaits capacity, which is what backpressures a fast
/// client all the way down to the socket read.
#[derive(Clone, Debug)]
pub enum QueueSender {
    Bounded(mpsc::Sender<String>),
    Unbounded(mpsc::UnboundedSender<String>),
}

impl QueueSender {
    /// Enqueue one raw request. Returns `false` once the processor side
    /// has gone away.
    pub async fn send(&self, request: String) -> bool {
        match self {
            QueueSender::Bounded(tx) => tx.send(request).await.is_ok(),
            QueueSender::Unbounded(tx) => tx.send(request).is_ok(),
        }
    }
}

/// Consumer half of the shared request queue, owned by the processor.
#[derive(Debug)]
pub enum QueueReceiver {
    Bounded(mpsc::Receiver<String>),
    Unbounded(mpsc::UnboundedReceiver<String>),
}

impl QueueReceiver {
    /// Receive the next raw request, or `None` when all senders are gone.
    pub async fn recv(&mut self) -> Option<String> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Non-blocking receive; `None` when the queue is currently empty or
    /// closed. Used to drain remaining items during shutdown.
    pub fn try_recv(&mut self) -> Option<String> {
        match self {
            QueueReceiver::Bounded(rx) => rx.try_recv().ok(),
            QueueReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Create the shared request queue. `capacity == 0` means unbounded.
pub fn request_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
    }
}
