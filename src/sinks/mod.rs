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

//! Metric sinks for outputting aggregated data to various destinations
//!
//! Destinations receive the records of one flush and forward them to
//! external systems. A failing destination loses that batch for itself
//! only; the processor keeps flushing to the others and the destination
//! reconnects on the next cycle.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::model::FlushRecord;

/// Default port of a Graphite/Carbon line receiver.
pub const DEFAULT_GRAPHITE_PORT: u16 = 2003;

/// Failure to deliver a batch of flush records.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
}

/// Trait for all flush destinations.
///
/// Implementations are owned by the queue processor and invoked in
/// registration order on every flush.
#[async_trait]
pub trait Destination: Send {
    /// Deliver one batch of flush records.
    async fn flush(&mut self, records: &[FlushRecord]) -> Result<(), SinkError>;

    /// Get the name of this destination, for logging.
    fn name(&self) -> &str;
}

/// Wire rendering of a flush record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// Carbon plaintext: `<name> <value> <unix_timestamp>\n`
    Carbon,
    /// Comma separated: `<name>,<value>,<unix_timestamp>\n`
    Csv,
}

impl LineFormat {
    fn render_batch(&self, records: &[FlushRecord]) -> String {
        let mut out = String::new();
        for record in records {
            match self {
                LineFormat::Carbon => {
                    out.push_str(&format!(
                        "{} {} {}\n",
                        record.name, record.value, record.timestamp
                    ));
                }
                LineFormat::Csv => {
                    out.push_str(&format!(
                        "{},{},{}\n",
                        record.name, record.value, record.timestamp
                    ));
                }
            }
        }
        out
    }
}

/// Destination that writes Carbon plaintext to a Graphite/Carbon line
/// receiver over a reconnecting TCP connection.
pub struct GraphiteSink {
    host: String,
    port: u16,
    label: String,
    stream: Option<TcpStream>,
}

impl GraphiteSink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            label: format!("graphite({host}:{port})"),
            host,
            port,
            stream: None,
        }
    }

    async fn write_payload(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
        stream.write_all(payload).await?;
        stream.flush().await
    }
}

#[async_trait]
impl Destination for GraphiteSink {
    async fn flush(&mut self, records: &[FlushRecord]) -> Result<(), SinkError> {
        let payload = LineFormat::Carbon.render_batch(records);

        if self.stream.is_none() {
            let addr = format!("{}:{}", self.host, self.port);
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|source| SinkError::Connect { addr, source })?;
            self.stream = Some(stream);
        }

        if let Some(stream) = self.stream.as_mut() {
            if let Err(err) = Self::write_payload(stream, payload.as_bytes()).await {
                // Drop the connection; the next flush re-dials.
                self.stream = None;
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Destination that writes flush records to any async writer.
pub struct StreamSink<W> {
    writer: W,
    format: LineFormat,
    label: String,
}

impl<W: AsyncWrite + Unpin + Send> StreamSink<W> {
    pub fn new(label: impl Into<String>, writer: W, format: LineFormat) -> Self {
        Self {
            writer,
            format,
            label: label.into(),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Destination for StreamSink<W> {
    async fn flush(&mut self, records: &[FlushRecord]) -> Result<(), SinkError> {
        let payload = self.format.render_batch(records);
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Stream destination writing Carbon plaintext to standard output.
pub fn stdout_sink() -> StreamSink<tokio::io::Stdout> {
    StreamSink::new("stdout", tokio::io::stdout(), LineFormat::Carbon)
}

/// Destination that appends flush records to a file.
///
/// The file is opened lazily and kept open across flushes; a write
/// failure drops the handle so the next flush reopens the path.
pub struct FileSink {
    path: PathBuf,
    format: LineFormat,
    label: String,
    file: Option<File>,
}

impl FileSink {
    pub fn carbon(path: impl Into<PathBuf>) -> Self {
        Self::with_format(path, LineFormat::Carbon)
    }

    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self::with_format(path, LineFormat::Csv)
    }

    fn with_format(path: impl Into<PathBuf>, format: LineFormat) -> Self {
        let path = path.into();
        let label = match format {
            LineFormat::Carbon => format!("file({})", path.display()),
            LineFormat::Csv => format!("csv-file({})", path.display()),
        };
        Self {
            path,
            format,
            label,
            file: None,
        }
    }

    async fn write_payload(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
        file.write_all(payload).await?;
        file.flush().await
    }
}

#[async_trait]
impl Destination for FileSink {
    async fn flush(&mut self, records: &[FlushRecord]) -> Result<(), SinkError> {
        let payload = self.format.render_batch(records);

        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }

        if let Some(file) = self.file.as_mut() {
            if let Err(err) = Self::write_payload(file, payload.as_bytes()).await {
                self.file = None;
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}
