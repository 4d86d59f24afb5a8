//! Backend load reports.
//!
//! Each backend that registers with a non-zero stats port pushes reports of the form
//! `ip,port,availableMemory,numRunning,numWaiting` over a ZeroMQ PUSH socket. The router pulls
//! them through a [`StatsStream`] and the registry applies them (see
//! [`NodeRegistry::receive_stats`](crate::registry::NodeRegistry::receive_stats)).
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use zeromq::{PullSocket, Socket, SocketRecv};

use crate::errors::StatsParseError;
use crate::models::NodeStats;

const STATS_CHANNEL_CAPACITY: usize = 64;

/// One parsed stats report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub ip: String,
    pub port: u16,
    pub available_memory: u64,
    pub num_running: u64,
    pub num_waiting: u64,
}

impl StatsReport {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            available_memory: self.available_memory,
            num_running: self.num_running,
            num_waiting: self.num_waiting,
        }
    }
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, StatsParseError> {
    value.parse().map_err(|_| StatsParseError::InvalidNumber {
        field,
        value: value.to_owned(),
    })
}

impl FromStr for StatsReport {
    type Err = StatsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(',').map(str::trim).collect();
        let [ip, port, available_memory, num_running, num_waiting] = fields[..] else {
            return Err(StatsParseError::FieldCount(fields.len()));
        };
        if ip.is_empty() {
            return Err(StatsParseError::EmptyIp);
        }

        Ok(StatsReport {
            ip: ip.to_owned(),
            port: parse_field("port", port)?,
            available_memory: parse_field("available_memory", available_memory)?,
            num_running: parse_field("num_running", num_running)?,
            num_waiting: parse_field("num_waiting", num_waiting)?,
        })
    }
}

/// A source of raw stats reports.
#[async_trait]
pub trait StatsStream {
    /// Starts receiving. The returned channel closes when the source is torn down.
    async fn receive(&self) -> Result<mpsc::Receiver<String>, anyhow::Error>;
}

/// Timing knobs for [`ZmqStatsSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSocketOptions {
    /// Upper bound on one connection attempt, and the pause after a failed one.
    pub reconnect_interval: Duration,
    /// Rebuild the connection when no report arrives for this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for StatsSocketOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Pulls reports from a backend's ZeroMQ PUSH socket.
///
/// A PULL socket gives no signal when its peer goes away: `recv` simply never returns again.
/// Backends report periodically, so a connection that stays silent for
/// [`StatsSocketOptions::idle_timeout`] is dropped and dialled again. This is what picks a
/// restarted backend back up. The task only ends when the receiving side is dropped.
#[derive(Debug, Clone)]
pub struct ZmqStatsSocket {
    endpoint: String,
    options: StatsSocketOptions,
}

impl ZmqStatsSocket {
    pub fn new(endpoint: impl Into<String>, options: StatsSocketOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Resolves once `timeout` has elapsed, or never when there is none.
async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl StatsStream for ZmqStatsSocket {
    async fn receive(&self) -> Result<mpsc::Receiver<String>, anyhow::Error> {
        let (tx, rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);
        let endpoint = self.endpoint.clone();
        let options = self.options;

        tokio::spawn(async move {
            'connect: while !tx.is_closed() {
                let mut socket = PullSocket::new();
                // zeromq retries refused connections internally with its own backoff, so the
                // attempt is bounded here to keep the retry period at `reconnect_interval`.
                let attempt = tokio::select! {
                    _ = tx.closed() => break 'connect,
                    result = tokio::time::timeout(
                        options.reconnect_interval,
                        socket.connect(&endpoint),
                    ) => result,
                };
                match attempt {
                    Ok(Ok(())) => info!(endpoint = %endpoint, "Connected to stats socket"),
                    Ok(Err(e)) => {
                        debug!(endpoint = %endpoint, error = %e, "Failed to connect stats socket");
                        tokio::time::sleep(options.reconnect_interval).await;
                        continue;
                    }
                    Err(_) => {
                        trace!(endpoint = %endpoint, "Stats socket not reachable yet");
                        continue;
                    }
                }

                loop {
                    let message = tokio::select! {
                        _ = tx.closed() => break 'connect,
                        message = socket.recv() => message,
                        _ = idle(options.idle_timeout) => {
                            debug!(endpoint = %endpoint, "No stats report within the idle timeout, reconnecting");
                            continue 'connect;
                        }
                    };
                    match message {
                        Ok(message) => {
                            let Some(report) = message
                                .get(0)
                                .and_then(|frame| std::str::from_utf8(frame).ok())
                            else {
                                trace!(endpoint = %endpoint, "Dropping non-UTF-8 stats frame");
                                continue;
                            };
                            if report.is_empty() {
                                continue;
                            }
                            if tx.send(report.to_owned()).await.is_err() {
                                break 'connect;
                            }
                        }
                        Err(e) => {
                            warn!(endpoint = %endpoint, error = %e, "Stats socket error, reconnecting");
                            tokio::time::sleep(options.reconnect_interval).await;
                            continue 'connect;
                        }
                    }
                }
            }
            debug!(endpoint = %endpoint, "Stats socket task finished");
        });

        Ok(rx)
    }
}
