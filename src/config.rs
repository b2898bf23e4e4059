/**
 * Configuration for the hub, client connections and watch supervisors
 */
use crate::k8s::watch_source::ResourceKind;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Retry delay applied after a failed watch open (seconds)
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 5;

/// Brief delay before reopening a watch stream that ended cleanly (seconds)
pub const RESTART_DELAY_SECONDS: u64 = 1;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Outbound queue capacity per connected client
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the hub's broadcast channel
pub const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the hub's register and unregister channels
pub const MEMBERSHIP_CHANNEL_CAPACITY: usize = 64;

/// Time allowed to write one message to a client
pub const WRITE_TIMEOUT_SECONDS: u64 = 10;

/// Time allowed between two inbound frames (pongs included) before a client is considered gone
pub const PONG_WAIT_SECONDS: u64 = 60;

/// Ping period, must stay below `PONG_WAIT_SECONDS`
pub const PING_PERIOD_SECONDS: u64 = PONG_WAIT_SECONDS * 9 / 10;

/// Largest inbound message accepted from a client
pub const MAX_INBOUND_MESSAGE_BYTES: usize = 512;

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_RETRY_DELAY_SECONDS > 0, "DEFAULT_RETRY_DELAY_SECONDS must be greater than 0");
    assert!(RESTART_DELAY_SECONDS > 0, "RESTART_DELAY_SECONDS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(DEFAULT_CLIENT_QUEUE_CAPACITY > 0, "DEFAULT_CLIENT_QUEUE_CAPACITY must be greater than 0");
    assert!(BROADCAST_CHANNEL_CAPACITY > 0, "BROADCAST_CHANNEL_CAPACITY must be greater than 0");
    assert!(MEMBERSHIP_CHANNEL_CAPACITY > 0, "MEMBERSHIP_CHANNEL_CAPACITY must be greater than 0");
    assert!(PING_PERIOD_SECONDS < PONG_WAIT_SECONDS, "PING_PERIOD_SECONDS must be below PONG_WAIT_SECONDS");
};

/// Command line arguments for the `kubeowl` binary
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address the http server listens on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Directory with the dashboard's static assets
    #[arg(long, default_value = "./web/static")]
    pub static_dir: PathBuf,

    /// Restrict namespaced watches to one namespace (all namespaces when absent)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Resource kinds to watch
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "pods,events,nodes"
    )]
    pub watch: Vec<ResourceKind>,

    /// Delay before retrying a failed watch open
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_SECONDS)]
    pub retry_delay_secs: u64,

    /// Upper bound for the retry delay; anything above --retry-delay-secs enables exponential backoff
    #[arg(long)]
    pub max_retry_delay_secs: Option<u64>,

    /// Outbound queue capacity per client before it is dropped as too slow
    #[arg(long, default_value_t = DEFAULT_CLIENT_QUEUE_CAPACITY)]
    pub client_queue: usize,

    /// Override the user-agent sent to the cluster api
    #[arg(long)]
    pub user_agent: Option<String>,
}

impl Args {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_secs(self.retry_delay_secs.max(1));
        let max = self
            .max_retry_delay_secs
            .map_or(initial, |secs| Duration::from_secs(secs).max(initial));
        RetryPolicy {
            initial,
            max,
            restart_delay: Duration::from_secs(RESTART_DELAY_SECONDS),
        }
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            client_queue_capacity: self.client_queue.max(1),
            ..HubConfig::default()
        }
    }
}

/// How a watch supervisor waits between attempts.
///
/// With `initial == max` the delay is fixed; otherwise it doubles after every
/// consecutive open failure up to `max` and resets once a stream opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Pause before reopening a stream that ended without error
    pub restart_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            restart_delay: delay,
        }
    }

    #[must_use]
    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            restart_delay: Duration::from_secs(RESTART_DELAY_SECONDS),
        }
    }

    #[must_use]
    pub const fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    /// Delay to use after `current`
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max).max(self.initial)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(DEFAULT_RETRY_DELAY_SECONDS))
            .with_restart_delay(Duration::from_secs(RESTART_DELAY_SECONDS))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub client_queue_capacity: usize,
    pub broadcast_capacity: usize,
    pub membership_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            broadcast_capacity: BROADCAST_CHANNEL_CAPACITY,
            membership_capacity: MEMBERSHIP_CHANNEL_CAPACITY,
        }
    }
}

/// Socket-level timings for one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub write_timeout: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECONDS),
            pong_wait: Duration::from_secs(PONG_WAIT_SECONDS),
            ping_period: Duration::from_secs(PING_PERIOD_SECONDS),
            max_message_size: MAX_INBOUND_MESSAGE_BYTES,
        }
    }
}
