//! Command-line configuration for the router
//!
//! Every option can also be supplied through an `INFER_ROUTER_*` environment variable.
use clap::Parser;
use std::time::Duration;

use crate::client::PoolConfig;
use crate::controller::ControllerConfig;
use crate::dispatcher::DispatchOptions;
use crate::errors::ConfigError;
use crate::load_balancer::{LoadBalanceMethod, PowerOfTwoOptions, Scheduler, TieBreak};
use crate::stats::StatsSocketOptions;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The host the router listens on.
    #[arg(long, env = "INFER_ROUTER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// The port the router listens on.
    #[arg(short = 'p', long, env = "INFER_ROUTER_PORT", default_value_t = 23000)]
    pub port: u16,

    /// The load balancing strategy. One of round_robin, shortest_queue, resources_aware,
    /// power_of_2_choice, pre_radix, multi_turn, bucket. Only round_robin and
    /// power_of_2_choice are implemented.
    #[arg(long, env = "INFER_ROUTER_LOAD_BALANCE_METHOD", default_value = "round_robin")]
    pub load_balance_method: String,

    /// Seed for the power-of-two sampler. Random when unset.
    #[arg(long, env = "INFER_ROUTER_RANDOM_SEED")]
    pub random_seed: Option<u64>,

    /// Second ranking key for power-of-two choices, after the waiting queue length.
    #[arg(long, value_enum, default_value_t = TieBreak::Waiting)]
    pub p2c_tiebreak: TieBreak,

    /// Always compare two different nodes in power-of-two choices.
    #[arg(long, default_value_t = false)]
    pub p2c_distinct: bool,

    /// The logging level of all loggers.
    #[arg(long, env = "INFER_ROUTER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// The logging level of the HTTP handlers. Reuses --log-level when unset.
    #[arg(long)]
    pub log_level_http: Option<String>,

    /// Log the inputs of all requests.
    #[arg(long, default_value_t = false)]
    pub log_requests: bool,

    /// Log how long each backend call takes.
    #[arg(long, default_value_t = false)]
    pub show_time_cost: bool,

    /// How many response chunks a dispatch may buffer ahead of the client.
    #[arg(long, default_value_t = 16)]
    pub dispatch_buffer: usize,

    /// Milliseconds allowed for one attempt to reach a node's stats socket, and the pause
    /// after a failed one. Keep it above the network round trip to the backends.
    #[arg(long, default_value_t = 1000)]
    pub stats_reconnect_ms: u64,

    /// Reconnect to a node's stats socket after this many milliseconds without a report.
    /// Zero never reconnects a silent socket.
    #[arg(long, default_value_t = 10000)]
    pub stats_idle_timeout_ms: u64,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true, action = clap::ArgAction::Set)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "infer_router")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per backend.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle backend connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    /// Resolves the load balancing method, refusing unknown and unimplemented ones.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let method = self.method()?;
        Scheduler::from_method(method, self.power_of_two_options())?;
        Ok(self)
    }

    pub fn method(&self) -> Result<LoadBalanceMethod, ConfigError> {
        self.load_balance_method.parse()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The `RUST_LOG`-style filter used when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> String {
        let http_level = self.log_level_http.as_deref().unwrap_or(&self.log_level);
        format!(
            "{},{}::handlers={}",
            self.log_level,
            env!("CARGO_CRATE_NAME"),
            http_level
        )
    }

    fn power_of_two_options(&self) -> PowerOfTwoOptions {
        PowerOfTwoOptions {
            tie_break: self.p2c_tiebreak,
            distinct: self.p2c_distinct,
            seed: self.random_seed,
        }
    }

    pub fn controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        Ok(ControllerConfig {
            method: self.method()?,
            power_of_two: self.power_of_two_options(),
            dispatch: DispatchOptions {
                buffer: self.dispatch_buffer,
                show_time_cost: self.show_time_cost,
            },
            stats: self.stats_socket_options(),
        })
    }

    fn stats_socket_options(&self) -> StatsSocketOptions {
        StatsSocketOptions {
            reconnect_interval: Duration::from_millis(self.stats_reconnect_ms),
            idle_timeout: (self.stats_idle_timeout_ms > 0)
                .then(|| Duration::from_millis(self.stats_idle_timeout_ms)),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}
