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

//! Configuration parsing and merging
//!
//! Options arrive from the command line and from an optional JSON
//! configuration file carrying the same keys; command line values win.
//! The merged [`ServerConfig`] is what the server consumes, and is
//! rebuilt from scratch on reload.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::sinks::DEFAULT_GRAPHITE_PORT;
use crate::sources::DEFAULT_PORT;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("port {0:?} is out of range")]
    PortOutOfRange(String),

    #[error("port {0} is specified more than once")]
    DuplicatePort(u16),

    #[error("flush interval must be positive, got {0}")]
    InvalidFlushInterval(f64),

    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),

    #[error("collector thread limit {limit} is below the initial count {initial}")]
    InvalidWorkerLimits { initial: usize, limit: usize },
}

/// Command line arguments.
#[derive(Debug, Default, Parser)]
#[command(
    name = "stagg",
    about = "Statsd-compatible metrics aggregation daemon",
    version
)]
pub struct Args {
    /// Path to a JSON configuration file; command line flags override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Minimum log severity (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log to stderr
    #[arg(long)]
    pub log_stderr: bool,

    /// Seconds between flushes
    #[arg(long)]
    pub flush_interval: Option<f64>,

    /// Flush aggregated metrics to standard output
    #[arg(long)]
    pub flush_stdout: bool,

    /// Comma separated host[:port] list of Graphite destinations
    #[arg(long)]
    pub flush_graphite: Option<String>,

    /// Pipe separated list of files receiving Carbon-format lines
    #[arg(long)]
    pub flush_file: Option<String>,

    /// Pipe separated list of files receiving CSV lines
    #[arg(long)]
    pub flush_file_csv: Option<String>,

    /// Comma separated [host][:port] UDP listen addresses
    #[arg(long)]
    pub collect_udp: Option<String>,

    /// Comma separated [host][:port] TCP listen addresses
    #[arg(long)]
    pub collect_tcp: Option<String>,

    /// Bound the shared request queue (0 means unbounded)
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Initial TCP connection workers per collector
    #[arg(long)]
    pub collector_threads: Option<usize>,

    /// Maximum TCP connection workers per collector
    #[arg(long)]
    pub collector_threads_limit: Option<usize>,

    /// Drop to this user after binding sockets
    #[arg(long)]
    pub user: Option<String>,

    /// Drop to this group after binding sockets
    #[arg(long)]
    pub group: Option<String>,
}

/// Configuration file contents; every key optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_stderr: Option<bool>,
    pub flush_interval: Option<f64>,
    pub flush_stdout: Option<bool>,
    pub flush_graphite: Option<String>,
    pub flush_file: Option<String>,
    pub flush_file_csv: Option<String>,
    pub collect_udp: Option<String>,
    pub collect_tcp: Option<String>,
    pub queue_size: Option<usize>,
    pub collector_threads: Option<usize>,
    pub collector_threads_limit: Option<usize>,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl FileConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse configuration")
    }
}

/// A `host:port` pair for a listener or a Graphite destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Fully resolved configuration consumed by the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_stderr: bool,
    pub flush_interval: f64,
    pub flush_stdout: bool,
    pub graphite: Vec<Endpoint>,
    pub flush_files: Vec<PathBuf>,
    pub flush_csv_files: Vec<PathBuf>,
    pub udp: Vec<Endpoint>,
    pub tcp: Vec<Endpoint>,
    pub queue_size: usize,
    pub collector_threads: usize,
    pub collector_threads_limit: usize,
    pub user: Option<String>,
    pub group: Option<String>,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ServerConfig {
    /// Resolve the effective configuration from the command line and the
    /// optional configuration file it references.
    pub fn resolve(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, &file)
    }

    fn merge(args: &Args, file: &FileConfig) -> Result<Self> {
        let log_level = args
            .log_level
            .clone()
            .or_else(|| file.log_level.clone())
            .unwrap_or_else(|| "info".to_owned())
            .to_lowercase();
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(log_level).into());
        }

        let flush_interval = args.flush_interval.or(file.flush_interval).unwrap_or(1.0);
        if !(flush_interval > 0.0) {
            return Err(ConfigError::InvalidFlushInterval(flush_interval).into());
        }

        let collector_threads = args
            .collector_threads
            .or(file.collector_threads)
            .unwrap_or(2)
            .max(1);
        let collector_threads_limit = args
            .collector_threads_limit
            .or(file.collector_threads_limit)
            .unwrap_or(8);
        if collector_threads_limit < collector_threads {
            return Err(ConfigError::InvalidWorkerLimits {
                initial: collector_threads,
                limit: collector_threads_limit,
            }
            .into());
        }

        let graphite = match args.flush_graphite.as_deref().or(file.flush_graphite.as_deref()) {
            Some(list) => parse_address_list(list, DEFAULT_GRAPHITE_PORT)?,
            None => Vec::new(),
        };
        let mut udp = match args.collect_udp.as_deref().or(file.collect_udp.as_deref()) {
            Some(list) => parse_listen_addresses(list, DEFAULT_PORT)?,
            None => Vec::new(),
        };
        let tcp = match args.collect_tcp.as_deref().or(file.collect_tcp.as_deref()) {
            Some(list) => parse_listen_addresses(list, DEFAULT_PORT)?,
            None => Vec::new(),
        };
        if udp.is_empty() && tcp.is_empty() {
            udp.push(Endpoint {
                host: "127.0.0.1".to_owned(),
                port: DEFAULT_PORT,
            });
        }

        Ok(Self {
            log_level,
            log_file: args.log_file.clone().or_else(|| file.log_file.clone()),
            log_stderr: args.log_stderr || file.log_stderr.unwrap_or(true),
            flush_interval,
            flush_stdout: args.flush_stdout || file.flush_stdout.unwrap_or(false),
            graphite,
            flush_files: parse_path_list(
                args.flush_file.as_deref().or(file.flush_file.as_deref()),
            ),
            flush_csv_files: parse_path_list(
                args.flush_file_csv
                    .as_deref()
                    .or(file.flush_file_csv.as_deref()),
            ),
            udp,
            tcp,
            queue_size: args.queue_size.or(file.queue_size).unwrap_or(0),
            collector_threads,
            collector_threads_limit,
            user: args.user.clone().or_else(|| file.user.clone()),
            group: args.group.clone().or_else(|| file.group.clone()),
        })
    }
}

/// Parse a comma separated `[host][:port]` list. A missing host falls
/// back to loopback and a missing port to `default_port`.
pub fn parse_address_list(list: &str, default_port: u16) -> Result<Vec<Endpoint>, ConfigError> {
    let mut endpoints = Vec::new();
    for item in list.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (host, port) = match item.split_once(':') {
            Some((host, port_str)) if !port_str.is_empty() => {
                let port: u32 = port_str
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress(item.to_owned()))?;
                if !(1..=65535).contains(&port) {
                    return Err(ConfigError::PortOutOfRange(port_str.to_owned()));
                }
                (host, port as u16)
            }
            Some((host, _)) => (host, default_port),
            None => (item, default_port),
        };
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        endpoints.push(Endpoint {
            host: host.to_owned(),
            port,
        });
    }
    Ok(endpoints)
}

/// Like [`parse_address_list`], but rejects a port that appears twice;
/// two listeners cannot bind the same port anyway.
pub fn parse_listen_addresses(list: &str, default_port: u16) -> Result<Vec<Endpoint>, ConfigError> {
    let endpoints = parse_address_list(list, default_port)?;
    let mut ports = HashSet::new();
    for endpoint in &endpoints {
        if !ports.insert(endpoint.port) {
            return Err(ConfigError::DuplicatePort(endpoint.port));
        }
    }
    Ok(endpoints)
}

fn parse_path_list(list: Option<&str>) -> Vec<PathBuf> {
    list.map(|list| {
        list.split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect()
    })
    .unwrap_or_default()
}
