pub mod client;
pub mod watch_manager;
pub mod watch_source;

pub use watch_manager::{WatchManager, WatchManagerHandle, WatchState, WatchStats, WatchSupervisor};
pub use watch_source::{
    ChangeEvent, EventStream, KubeWatchSource, ResourceKind, WatchItem, WatchSource,
};

/// Default user agent for `kubeowl` - automatically uses the package version
///
/// Can be overridden with the `--user-agent` flag.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
