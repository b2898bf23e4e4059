/**
 * Watch supervisors
 *
 * One supervisor per resource kind keeps an upstream watch stream open for
 * the life of the process, forwarding every change event to the hub and
 * reopening the stream after any failure.
 */
use super::watch_source::{ResourceKind, WatchItem, WatchSource};
use crate::config::RetryPolicy;
use crate::error::Error;
use crate::hub::{Envelope, Frame, HubHandle};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchState {
    Starting,
    Streaming,
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStats {
    pub kind: &'static str,
    pub state: WatchState,
    pub events_forwarded: u64,
    pub serialization_failures: u64,
    pub restarts: u64,
    pub last_error: Option<String>,
    /// Where the next attempt resumes; `None` means a fresh listing
    pub resource_version: Option<String>,
}

impl WatchStats {
    #[must_use]
    pub const fn new(kind: ResourceKind) -> Self {
        Self {
            kind: kind.as_str(),
            state: WatchState::Starting,
            events_forwarded: 0,
            serialization_failures: 0,
            restarts: 0,
            last_error: None,
            resource_version: None,
        }
    }
}

/// How one attempt (open + stream) ended
enum AttemptOutcome {
    /// Upstream closed the stream without an error
    Ended,
    OpenFailed(Error),
    StreamFailed(Error),
    /// Shutdown was requested or the hub is gone
    Stopped,
}

/// Keeps one resource kind's upstream stream alive
pub struct WatchSupervisor<S: WatchSource> {
    kind: ResourceKind,
    source: Arc<S>,
    hub: HubHandle,
    retry: RetryPolicy,
    stats: watch::Sender<WatchStats>,
}

impl<S: WatchSource> WatchSupervisor<S> {
    #[must_use]
    pub fn new(kind: ResourceKind, source: Arc<S>, hub: HubHandle, retry: RetryPolicy) -> Self {
        let (stats, _) = watch::channel(WatchStats::new(kind));
        Self {
            kind,
            source,
            hub,
            retry,
            stats,
        }
    }

    /// Receiver that always holds this supervisor's latest stats
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WatchStats> {
        self.stats.subscribe()
    }

    fn set_state(&self, state: WatchState) {
        self.stats.send_modify(|stats| stats.state = state);
    }

    /// Run `STARTING -> STREAMING -> BACKOFF -> STARTING ...` until `shutdown` fires.
    ///
    /// Every attempt gets its own child token, cancelled when the attempt
    /// ends, so an abandoned upstream stream is always released.
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = self.kind;
        let mut delay = self.retry.initial;
        let mut resume = None;
        info!("🔍 Starting {} watcher", kind);

        loop {
            self.set_state(WatchState::Starting);
            let attempt = shutdown.child_token();
            let outcome = self.run_attempt(&attempt, &mut delay, &mut resume).await;
            attempt.cancel();

            let expired = matches!(
                &outcome,
                AttemptOutcome::OpenFailed(e) | AttemptOutcome::StreamFailed(e) if e.is_expired()
            );
            if expired {
                info!("🔍 {} watcher resume point expired, relisting", kind);
                self.resume_at(&mut resume, None);
            }

            let pause = match outcome {
                AttemptOutcome::Stopped => break,
                AttemptOutcome::Ended => {
                    info!("🔍 {} watcher stream ended, restarting", kind);
                    self.retry.restart_delay
                }
                AttemptOutcome::OpenFailed(e) => {
                    error!("❌ Failed to start {} watcher: {}, retrying in {:?}", kind, e, delay);
                    self.record_error(&e);
                    let pause = delay;
                    delay = self.retry.next_delay(delay);
                    pause
                }
                AttemptOutcome::StreamFailed(e) => {
                    warn!("❌ {} watcher stream failed: {}, restarting in {:?}", kind, e, delay);
                    self.record_error(&e);
                    delay
                }
            };

            self.stats.send_modify(|stats| {
                stats.state = WatchState::Backoff;
                stats.restarts += 1;
            });
            if !Self::wait(&shutdown, pause).await {
                break;
            }
        }

        self.set_state(WatchState::Stopped);
        info!("🔍 {} watcher stopped", kind);
    }

    /// Sleep for `pause`; `false` if shutdown was requested meanwhile
    async fn wait(shutdown: &CancellationToken, pause: Duration) -> bool {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => false,
            () = sleep(pause) => true,
        }
    }

    async fn run_attempt(
        &self,
        attempt: &CancellationToken,
        delay: &mut Duration,
        resume: &mut Option<String>,
    ) -> AttemptOutcome {
        let opened = tokio::select! {
            biased;
            () = attempt.cancelled() => return AttemptOutcome::Stopped,
            opened = self.source.open(self.kind, resume.as_deref(), attempt.clone()) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return AttemptOutcome::OpenFailed(e),
        };

        *delay = self.retry.initial;
        self.set_state(WatchState::Streaming);
        info!("🔍 {} watcher started", self.kind);

        loop {
            let next = tokio::select! {
                biased;
                () = attempt.cancelled() => return AttemptOutcome::Stopped,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(WatchItem::Change {
                    event,
                    resource_version,
                })) => {
                    if let Some(frame) = self.encode(&event) {
                        if self.hub.broadcast(frame).await.is_err() {
                            debug!("Hub stopped, {} watcher has nowhere to deliver", self.kind);
                            return AttemptOutcome::Stopped;
                        }
                        self.stats.send_modify(|stats| stats.events_forwarded += 1);
                    }
                    if resource_version.is_some() {
                        self.resume_at(resume, resource_version);
                    }
                }
                Some(Ok(WatchItem::Bookmark { resource_version })) => {
                    self.resume_at(resume, Some(resource_version));
                }
                Some(Err(e)) => return AttemptOutcome::StreamFailed(e),
                None => return AttemptOutcome::Ended,
            }
        }
    }

    /// Wrap and serialize one event. A failure drops only this event.
    fn encode(&self, event: &S::Event) -> Option<Frame> {
        match Envelope::new(self.kind.as_str(), event).encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Dropping {} event that failed to serialize: {}", self.kind, e);
                self.stats
                    .send_modify(|stats| stats.serialization_failures += 1);
                None
            }
        }
    }

    fn resume_at(&self, resume: &mut Option<String>, resource_version: Option<String>) {
        self.stats
            .send_modify(|stats| stats.resource_version.clone_from(&resource_version));
        *resume = resource_version;
    }

    fn record_error(&self, e: &Error) {
        let message = e.to_string();
        self.stats
            .send_modify(|stats| stats.last_error = Some(message));
    }
}

/// Spawns and tracks one supervisor per watched resource kind
pub struct WatchManager<S: WatchSource> {
    source: Arc<S>,
    hub: HubHandle,
    kinds: Vec<ResourceKind>,
    retry: RetryPolicy,
}

impl<S: WatchSource> WatchManager<S> {
    #[must_use]
    pub fn new(source: S, hub: HubHandle, kinds: Vec<ResourceKind>, retry: RetryPolicy) -> Self {
        let mut unique = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }
        Self {
            source: Arc::new(source),
            hub,
            kinds: unique,
            retry,
        }
    }

    /// Start one supervisor task per kind. They run until `shutdown` fires.
    #[must_use]
    pub fn start(self, shutdown: &CancellationToken) -> WatchManagerHandle {
        let mut task_handles = Vec::with_capacity(self.kinds.len());
        let mut stats = Vec::with_capacity(self.kinds.len());

        for kind in self.kinds {
            let supervisor =
                WatchSupervisor::new(kind, self.source.clone(), self.hub.clone(), self.retry);
            stats.push(supervisor.subscribe());
            task_handles.push(tokio::spawn(supervisor.run(shutdown.clone())));
        }

        info!("🔍 {} watch supervisor(s) started", task_handles.len());
        WatchManagerHandle {
            task_handles,
            stats,
        }
    }
}

/// Handle to manage watch supervisor tasks
pub struct WatchManagerHandle {
    task_handles: Vec<JoinHandle<()>>,
    stats: Vec<watch::Receiver<WatchStats>>,
}

impl WatchManagerHandle {
    /// Latest stats of every supervisor
    #[must_use]
    pub fn stats(&self) -> Vec<WatchStats> {
        self.stats.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Stats receivers, for readers that outlive this handle
    #[must_use]
    pub fn subscribe(&self) -> Vec<watch::Receiver<WatchStats>> {
        self.stats.clone()
    }

    /// Wait for every supervisor to stop after shutdown was requested
    pub async fn join(self) {
        for handle in self.task_handles {
            if let Err(e) = handle.await {
                error!("Watch supervisor task failed: {}", e);
            }
        }
    }
}
