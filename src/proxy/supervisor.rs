//! Session supervisor
//!
//! Owns every live session: admits new ones (optionally up to a limit), ties
//! each session's teardown to process shutdown, and tracks the relay tasks so
//! shutdown can wait for them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::error::{ProxyError, ProxyResult};
use super::relay::{RelayPump, SessionReport};
use super::session::{Session, Teardown};

/// A reserved session slot. Released on drop.
///
/// Counts as a tracked task from admission on, so `drain` also waits for
/// sessions that are still dialing or upgrading.
#[derive(Debug)]
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
    _task: TaskTrackerToken,
    active: Arc<AtomicUsize>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Inner {
    limit: Option<usize>,
    permits: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Coordinates admission, cancellation and draining of sessions
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl SessionSupervisor {
    /// Create a supervisor. `None` means no session limit.
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit: max_sessions,
                permits: max_sessions.map(|n| Arc::new(Semaphore::new(n))),
                active: Arc::new(AtomicUsize::new(0)),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Reserve a slot for a new session
    pub fn try_admit(&self) -> ProxyResult<Admission> {
        if self.is_shutting_down() {
            return Err(ProxyError::ShuttingDown);
        }

        let permit = match (&self.inner.permits, self.inner.limit) {
            (Some(permits), Some(limit)) => Some(
                Arc::clone(permits)
                    .try_acquire_owned()
                    .map_err(|_| ProxyError::AtCapacity(limit))?,
            ),
            _ => None,
        };

        self.inner.active.fetch_add(1, Ordering::AcqRel);
        Ok(Admission {
            _permit: permit,
            _task: self.inner.tracker.token(),
            active: Arc::clone(&self.inner.active),
        })
    }

    /// Number of admitted sessions (including ones still dialing)
    pub fn active_sessions(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Relay a session until it ends
    pub async fn run(&self, session: Session) -> SessionReport {
        let teardown = Teardown::child_of(&self.inner.shutdown);
        let pump = RelayPump::new(session, teardown);
        let report = self
            .inner
            .tracker
            .track_future(pump.run(&self.inner.tracker))
            .await;

        match &report.io_error {
            Some(e) => warn!(
                "Session {} on {} ended by I/O error ({} frames up, {} frames down): {}",
                report.id, report.path, report.upstream_frames, report.downstream_frames, e
            ),
            None => info!(
                "Session {} on {} closed ({} frames up, {} frames down)",
                report.id, report.path, report.upstream_frames, report.downstream_frames
            ),
        }
        report
    }

    /// Token cancelled when shutdown starts
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Tear down every live session. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.is_shutting_down() {
            info!("Shutting down {} active sessions", self.active_sessions());
        }
        self.inner.shutdown.cancel();
    }

    /// Whether shutdown has started
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait up to `timeout` for all session tasks to finish.
    ///
    /// Returns `false` if some were still running when the timeout elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let tracker = &self.inner.tracker;
        tracker.close();

        if tracker.is_empty() {
            return true;
        }

        info!("Waiting for {} active sessions to close...", self.active_sessions());
        match tokio::time::timeout(timeout, tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "Session drain timed out after {:?}, {} tasks still running",
                    timeout,
                    tracker.len()
                );
                false
            }
        }
    }
}
