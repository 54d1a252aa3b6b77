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

//! Time-based metrics aggregation engine
//!
//! The [`StatsShelf`] folds parsed metrics into per-kind accumulators;
//! the [`QueueProcessor`] owns the shelf, drains the shared request
//! queue, and drives the periodic flush that fans out to destinations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashMapExt, HashSet};
use anyhow::ensure;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::model::{FlushRecord, Metric};
use crate::sinks::Destination;
use crate::sync::{QueueReceiver, StateFlag};

/// In-memory aggregator holding partially-reduced metrics between
/// flushes.
///
/// The shelf has no internal locking: it is owned and mutated only by
/// the processor task.
#[derive(Debug, Default)]
pub struct StatsShelf {
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    sets: HashMap<String, HashSet<String>>,
    timers: HashMap<String, Vec<f64>>,
}

impl StatsShelf {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
            gauges: HashMap::new(),
            sets: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Fold a single parsed metric into the shelf.
    pub fn add(&mut self, metric: Metric) {
        match metric {
            Metric::Counter {
                name,
                value,
                sample_rate,
            } => {
                *self.counters.entry(name).or_insert(0.0) += value / sample_rate;
            }
            Metric::Gauge { name, value } => {
                self.gauges.insert(name, value);
            }
            Metric::GaugeDelta { name, delta } => {
                *self.gauges.entry(name).or_insert(0.0) += delta;
            }
            Metric::Set { name, member } => {
                self.sets.entry(name).or_default().insert(member);
            }
            Metric::Timer {
                name,
                value,
                sample_rate,
            } => {
                // Each sampled occurrence stands in for round(1/rate)
                // unsampled ones, never fewer than 1, so downstream
                // percentile math stays correct.
                let weight = ((1.0 / sample_rate).round() as usize).max(1);
                self.timers
                    .entry(name)
                    .or_default()
                    .extend(std::iter::repeat(value).take(weight));
            }
        }
    }

    /// Produce the flush records for the current state and reset the
    /// shelf. Names are emitted in sorted order so the output is stable
    /// for a given shelf state.
    pub fn snapshot_and_clear(&mut self, timestamp: i64, flush_interval: f64) -> Vec<FlushRecord> {
        let mut records = Vec::new();

        let mut counters: Vec<_> = self.counters.drain().collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, sum) in counters {
            records.push(FlushRecord::new(name.clone(), sum, timestamp));
            records.push(FlushRecord::new(
                format!("{name}.rate"),
                sum / flush_interval,
                timestamp,
            ));
        }

        let mut gauges: Vec<_> = self.gauges.drain().collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in gauges {
            records.push(FlushRecord::new(name, value, timestamp));
        }

        let mut sets: Vec<_> = self.sets.drain().collect();
        sets.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, members) in sets {
            records.push(FlushRecord::new(name, members.len() as f64, timestamp));
        }

        let mut timers: Vec<_> = self.timers.drain().collect();
        timers.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, samples) in timers {
            if samples.is_empty() {
                continue;
            }
            let count = samples.len() as f64;
            let sum: f64 = samples.iter().sum();
            let lower = samples.iter().cloned().fold(f64::INFINITY, f64::min);
            let upper = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            records.push(FlushRecord::new(format!("{name}.count"), count, timestamp));
            records.push(FlushRecord::new(format!("{name}.lower"), lower, timestamp));
            records.push(FlushRecord::new(format!("{name}.upper"), upper, timestamp));
            records.push(FlushRecord::new(format!("{name}.mean"), sum / count, timestamp));
            records.push(FlushRecord::new(format!("{name}.sum"), sum, timestamp));
        }

        records
    }

    /// Reset all accumulators to empty.
    pub fn clear(&mut self) {
        self.counters.clear();
        self.gauges.clear();
        self.sets.clear();
        self.timers.clear();
    }
}

/// Control messages the supervisor can send to a running processor.
pub enum ProcessorCommand {
    /// Replace the destination list; applied between flushes.
    SetDestinations(Vec<Box<dyn Destination>>),
    /// Drain the queue, emit a final flush, and stop.
    Shutdown,
}

/// Cloneable handle for observing and controlling a spawned processor.
#[derive(Clone)]
pub struct ProcessorHandle {
    commands: mpsc::UnboundedSender<ProcessorCommand>,
    processing: StateFlag,
    stopped: StateFlag,
    parse_errors: Arc<AtomicU64>,
}

impl ProcessorHandle {
    /// Request termination. The processor finishes its current cycle,
    /// drains the queue, and emits a final flush before stopping.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ProcessorCommand::Shutdown);
    }

    /// Atomically replace the destination list between flushes.
    pub fn set_destinations(&self, destinations: Vec<Box<dyn Destination>>) {
        let _ = self
            .commands
            .send(ProcessorCommand::SetDestinations(destinations));
    }

    pub fn is_processing(&self) -> bool {
        self.processing.is_set()
    }

    pub async fn wait_until_processing(&self, timeout: Duration) -> bool {
        self.processing.wait_timeout(timeout).await
    }

    pub async fn wait_until_shutdown(&self, timeout: Duration) -> bool {
        self.stopped.wait_timeout(timeout).await
    }

    /// Lines dropped so far because they failed to parse.
    pub fn parse_error_count(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }
}

/// Process Statsd requests queued by the collectors.
///
/// Owns the shelf and the consumer half of the shared queue. The driver
/// makes progress both when requests arrive and when the flush deadline
/// passes; a busy queue never delays a flush.
pub struct QueueProcessor {
    queue: QueueReceiver,
    flush_interval: Duration,
    shelf: StatsShelf,
    destinations: Vec<Box<dyn Destination>>,
    commands: mpsc::UnboundedReceiver<ProcessorCommand>,
    handle: ProcessorHandle,
}

impl QueueProcessor {
    pub fn new(queue: QueueReceiver, flush_interval: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            queue,
            flush_interval,
            shelf: StatsShelf::new(),
            destinations: Vec::new(),
            commands: command_rx,
            handle: ProcessorHandle {
                commands: command_tx,
                processing: StateFlag::new(),
                stopped: StateFlag::new(),
                parse_errors: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    pub fn handle(&self) -> ProcessorHandle {
        self.handle.clone()
    }

    pub fn set_flush_interval(&mut self, interval: Duration) -> anyhow::Result<()> {
        ensure!(interval > Duration::ZERO, "flush interval must be positive");
        self.flush_interval = interval;
        Ok(())
    }

    pub fn add_destination(&mut self, destination: Box<dyn Destination>) {
        self.destinations.push(destination);
    }

    pub fn set_destinations(&mut self, destinations: Vec<Box<dyn Destination>>) {
        self.destinations = destinations;
    }

    pub fn clear_destinations(&mut self) {
        self.destinations.clear();
    }

    /// Lines dropped so far because they failed to parse.
    pub fn parse_error_count(&self) -> u64 {
        self.handle.parse_error_count()
    }

    /// Run the driver until shutdown is requested, then drain the queue
    /// and emit a final flush.
    pub async fn process(mut self) {
        info!("processing the queue");
        self.handle.processing.set();
        let mut last_flush = Instant::now();

        loop {
            let deadline = last_flush + self.flush_interval;
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(ProcessorCommand::SetDestinations(destinations)) => {
                        debug!(count = destinations.len(), "swapping destinations");
                        self.destinations = destinations;
                    }
                    Some(ProcessorCommand::Shutdown) | None => break,
                },
                _ = sleep_until(deadline) => {
                    self.flush().await;
                    last_flush = Instant::now();
                }
                request = self.queue.recv() => match request {
                    Some(request) => self.fold_request(&request),
                    None => break,
                },
            }
        }

        // Everything enqueued before the shutdown request still lands in
        // the final flush.
        while let Some(request) = self.queue.try_recv() {
            self.fold_request(&request);
        }
        self.flush().await;

        info!("stopped processing the queue");
        self.handle.processing.clear();
        self.handle.stopped.set();
    }

    /// Snapshot the shelf and forward the records to every destination
    /// in registration order. The shelf is cleared before any
    /// destination write; a failing destination loses the batch for
    /// itself only.
    pub async fn flush(&mut self) {
        let now = Utc::now().timestamp();
        let records = self
            .shelf
            .snapshot_and_clear(now, self.flush_interval.as_secs_f64());
        debug!(
            records = records.len(),
            destinations = self.destinations.len(),
            parse_errors = self.parse_error_count(),
            "flushing metrics"
        );
        for destination in &mut self.destinations {
            if let Err(err) = destination.flush(&records).await {
                warn!(
                    destination = destination.name(),
                    error = %err,
                    "failed to flush to destination, dropping its batch"
                );
            }
        }
    }

    fn fold_request(&mut self, request: &str) {
        for line in request.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Metric::parse(line) {
                Ok(metric) => self.shelf.add(metric),
                Err(err) => {
                    self.handle.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(line, error = %err, "dropping unparseable metric line");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::SinkError;
    use crate::sync::request_queue;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    fn record_value<'a>(records: &'a [FlushRecord], name: &str) -> Option<&'a FlushRecord> {
        records.iter().find(|r| r.name == name)
    }

    #[test]
    fn test_counter_sum_scales_by_sample_rate() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("hits:3|c").unwrap());
        shelf.add(Metric::parse("hits:2|c|@0.5").unwrap());

        let records = shelf.snapshot_and_clear(100, 10.0);
        assert_eq!(record_value(&records, "hits").unwrap().value, 7.0);
        assert_eq!(record_value(&records, "hits.rate").unwrap().value, 0.7);
    }

    #[test]
    fn test_gauge_last_write_wins_with_deltas_on_top() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("temp:50|g").unwrap());
        shelf.add(Metric::parse("temp:+5|g").unwrap());
        shelf.add(Metric::parse("temp:-2|g").unwrap());

        let records = shelf.snapshot_and_clear(100, 1.0);
        assert_eq!(record_value(&records, "temp").unwrap().value, 53.0);
    }

    #[test]
    fn test_gauge_absolute_overrides_accumulated_state() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("temp:50|g").unwrap());
        shelf.add(Metric::parse("temp:10|g").unwrap());
        shelf.add(Metric::parse("temp:+1|g").unwrap());

        let records = shelf.snapshot_and_clear(100, 1.0);
        assert_eq!(record_value(&records, "temp").unwrap().value, 11.0);
    }

    #[test]
    fn test_gauge_delta_seeds_missing_gauge() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("pressure:-3|g").unwrap());

        let records = shelf.snapshot_and_clear(100, 1.0);
        assert_eq!(record_value(&records, "pressure").unwrap().value, -3.0);
    }

    #[test]
    fn test_set_counts_distinct_members() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("users:alice|s").unwrap());
        shelf.add(Metric::parse("users:bob|s").unwrap());
        shelf.add(Metric::parse("users:alice|s").unwrap());

        let records = shelf.snapshot_and_clear(100, 1.0);
        assert_eq!(record_value(&records, "users").unwrap().value, 2.0);
    }

    #[test]
    fn test_timer_aggregates() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("t:10|ms").unwrap());
        shelf.add(Metric::parse("t:30|ms").unwrap());
        shelf.add(Metric::parse("t:20|ms").unwrap());

        let records = shelf.snapshot_and_clear(100, 1.0);
        assert_eq!(record_value(&records, "t.count").unwrap().value, 3.0);
        assert_eq!(record_value(&records, "t.lower").unwrap().value, 10.0);
        assert_eq!(record_value(&records, "t.upper").unwrap().value, 30.0);
        assert_eq!(record_value(&records, "t.mean").unwrap().value, 20.0);
        assert_eq!(record_value(&records, "t.sum").unwrap().value, 60.0);
    }

    #[test]
    fn test_sampled_timer_is_weighted() {
        let mut shelf = StatsShelf::new();
        // 1/0.3 rounds to 3; a single sampled occurrence counts thrice.
        shelf.add(Metric::parse("t:12|ms|@0.3").unwrap());

        let records = shelf.snapshot_and_clear(100, 1.0);
        assert_eq!(record_value(&records, "t.count").unwrap().value, 3.0);
        assert_eq!(record_value(&records, "t.sum").unwrap().value, 36.0);

        // A rate close to 1 still contributes at least one sample.
        shelf.add(Metric::parse("t:12|ms|@0.9").unwrap());
        let records = shelf.snapshot_and_clear(100, 1.0);
        assert_eq!(record_value(&records, "t.count").unwrap().value, 1.0);
    }

    #[test]
    fn test_snapshot_clears_the_shelf() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("hits:1|c").unwrap());
        shelf.add(Metric::parse("temp:2|g").unwrap());
        shelf.add(Metric::parse("users:u|s").unwrap());
        shelf.add(Metric::parse("t:3|ms").unwrap());

        assert!(!shelf.snapshot_and_clear(100, 1.0).is_empty());
        assert!(shelf.snapshot_and_clear(101, 1.0).is_empty());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("hits:1|c").unwrap());
        shelf.clear();
        assert!(shelf.snapshot_and_clear(100, 1.0).is_empty());
    }

    #[test]
    fn test_snapshot_order_is_stable() {
        let mut shelf = StatsShelf::new();
        shelf.add(Metric::parse("b:1|c").unwrap());
        shelf.add(Metric::parse("a:1|c").unwrap());
        let first: Vec<String> = shelf
            .snapshot_and_clear(100, 1.0)
            .into_iter()
            .map(|r| r.name)
            .collect();

        shelf.add(Metric::parse("a:1|c").unwrap());
        shelf.add(Metric::parse("b:1|c").unwrap());
        let second: Vec<String> = shelf
            .snapshot_and_clear(100, 1.0)
            .into_iter()
            .map(|r| r.name)
            .collect();

        assert_eq!(first, second);
        assert_eq!(first, vec!["a", "a.rate", "b", "b.rate"]);
    }

    struct CaptureSink {
        batches: Arc<Mutex<Vec<Vec<FlushRecord>>>>,
    }

    #[async_trait]
    impl Destination for CaptureSink {
        async fn flush(&mut self, records: &[FlushRecord]) -> Result<(), SinkError> {
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }

        fn name(&self) -> &str {
            "capture"
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Destination for FailingSink {
        async fn flush(&mut self, _records: &[FlushRecord]) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("boom")))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn capture() -> (Arc<Mutex<Vec<Vec<FlushRecord>>>>, Box<CaptureSink>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(CaptureSink {
            batches: batches.clone(),
        });
        (batches, sink)
    }

    fn flushed_value(batches: &Arc<Mutex<Vec<Vec<FlushRecord>>>>, name: &str) -> Option<f64> {
        batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|r| r.name == name)
            .map(|r| r.value)
    }

    #[tokio::test]
    async fn test_set_flush_interval_rejects_zero() {
        let (_tx, rx) = request_queue(0);
        let mut processor = QueueProcessor::new(rx, Duration::from_secs(1));

        // Duration cannot go negative, so zero is the whole invalid range.
        assert!(processor.set_flush_interval(Duration::ZERO).is_err());
        assert!(processor
            .set_flush_interval(Duration::from_secs_f64(2.5))
            .is_ok());
        assert_eq!(processor.flush_interval, Duration::from_secs_f64(2.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_flushes_on_the_deadline() {
        let (tx, rx) = request_queue(0);
        let mut processor = QueueProcessor::new(rx, Duration::from_secs(1));
        let (batches, sink) = capture();
        processor.add_destination(sink);
        let handle = processor.handle();

        let task = tokio::spawn(processor.process());
        assert!(handle.wait_until_processing(Duration::from_secs(5)).await);

        assert!(tx.send("hits:3|c\nhits:2|c|@0.5".into()).await);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(flushed_value(&batches, "hits"), Some(7.0));
        assert_eq!(flushed_value(&batches, "hits.rate"), Some(7.0));

        handle.shutdown();
        assert!(handle.wait_until_shutdown(Duration::from_secs(5)).await);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_final_flush_on_shutdown() {
        let (tx, rx) = request_queue(0);
        let mut processor = QueueProcessor::new(rx, Duration::from_secs(60));
        let (batches, sink) = capture();
        processor.add_destination(sink);
        let handle = processor.handle();

        let task = tokio::spawn(processor.process());
        assert!(handle.wait_until_processing(Duration::from_secs(5)).await);

        // Enqueued but never flushed: the deadline is a minute away.
        assert!(tx.send("pending:4|c".into()).await);
        handle.shutdown();
        assert!(handle.wait_until_shutdown(Duration::from_secs(5)).await);
        task.await.unwrap();

        assert!(!handle.is_processing());
        assert_eq!(flushed_value(&batches, "pending"), Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_survives_destination_failure() {
        let (tx, rx) = request_queue(0);
        let mut processor = QueueProcessor::new(rx, Duration::from_secs(1));
        let (batches, sink) = capture();
        processor.add_destination(Box::new(FailingSink));
        processor.add_destination(sink);
        let handle = processor.handle();

        let task = tokio::spawn(processor.process());
        assert!(tx.send("good:1|c".into()).await);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        // The failing destination did not stop the healthy one.
        assert_eq!(flushed_value(&batches, "good"), Some(1.0));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_swap_preserves_shelf_state() {
        let (tx, rx) = request_queue(0);
        let mut processor = QueueProcessor::new(rx, Duration::from_secs(1));
        let handle = processor.handle();

        let task = tokio::spawn(processor.process());
        assert!(handle.wait_until_processing(Duration::from_secs(5)).await);

        assert!(tx.send("a:1|c".into()).await);
        tokio::task::yield_now().await;

        // A reload swaps destinations mid-window; folded metrics survive.
        let (batches, sink) = capture();
        handle.set_destinations(vec![sink]);
        assert!(tx.send("a:2|c".into()).await);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(flushed_value(&batches, "a"), Some(3.0));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_lines_do_not_halt_the_batch() {
        let (tx, rx) = request_queue(0);
        let mut processor = QueueProcessor::new(rx, Duration::from_secs(1));
        let (batches, sink) = capture();
        processor.add_destination(sink);
        let handle = processor.handle();

        let task = tokio::spawn(processor.process());
        assert!(tx.send("bad_line_without_value\ngood:1|c".into()).await);

        handle.shutdown();
        assert!(handle.wait_until_shutdown(Duration::from_secs(5)).await);
        task.await.unwrap();

        assert_eq!(flushed_value(&batches, "good"), Some(1.0));
        assert_eq!(flushed_value(&batches, "bad_line_without_value"), None);
        // The dropped line was counted.
        assert_eq!(handle.parse_error_count(), 1);
    }
}
