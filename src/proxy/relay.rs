//! Bidirectional relay between a client and its backend
//!
//! Each session runs two copy loops ("pumps"): backend -> client in a spawned
//! task, client -> backend in the task that owns the session. A pump reads one
//! frame, writes it to the other side, and repeats until its source ends, an
//! I/O call fails, or the session is torn down. Whichever pump stops first
//! tears the session down so the other one stops too, even if it is blocked on
//! a read or a stalled write.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::error::SessionIoError;
use super::frame::{self, Forward};
use super::session::{Session, Teardown};

/// How long closing one side of a session may take before it is dropped
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Which way a pump copies frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// Why a pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The source stream ended
    SourceEnded,
    /// A close frame was forwarded
    PeerClosed,
    /// A read or write failed
    Failed(SessionIoError),
    /// The session was torn down elsewhere
    TornDown,
}

/// What a pump hands back when it stops
#[derive(Debug)]
pub struct PumpOutcome<S> {
    /// The destination sink, still open, so the session can close it exactly once
    pub sink: S,
    /// Frames written to the destination
    pub relayed: u64,
    pub stop: StopReason,
}

/// Copy frames from `source` to `sink` until either fails or the session is torn down.
///
/// Always tears the session down before returning.
pub async fn pump<Src, Dst, In, Out, RE, WE>(
    direction: Direction,
    mut source: Src,
    mut sink: Dst,
    convert: fn(In) -> Forward<Out>,
    teardown: Teardown,
) -> PumpOutcome<Dst>
where
    Src: Stream<Item = Result<In, RE>> + Unpin,
    Dst: Sink<Out, Error = WE> + Unpin,
    RE: fmt::Display,
    WE: fmt::Display,
{
    let mut relayed = 0u64;

    let stop = loop {
        let next = tokio::select! {
            biased;
            _ = teardown.closed() => break StopReason::TornDown,
            next = source.next() => next,
        };

        let (out, last) = match next {
            None => break StopReason::SourceEnded,
            Some(Err(e)) => {
                break StopReason::Failed(SessionIoError::Read {
                    direction,
                    reason: e.to_string(),
                })
            }
            Some(Ok(msg)) => match convert(msg) {
                Forward::Relay(out) => (out, false),
                Forward::Final(out) => (out, true),
                Forward::Skip => continue,
            },
        };

        // A stalled destination must not outlive the session
        let written = tokio::select! {
            biased;
            _ = teardown.closed() => break StopReason::TornDown,
            written = sink.send(out) => written,
        };
        if let Err(e) = written {
            break StopReason::Failed(SessionIoError::Write {
                direction,
                reason: e.to_string(),
            });
        }

        relayed += 1;
        if last {
            break StopReason::PeerClosed;
        }
    };

    match &stop {
        StopReason::SourceEnded => debug!("{}: source closed after {} frames", direction, relayed),
        StopReason::PeerClosed => debug!("{}: close forwarded after {} frames", direction, relayed),
        StopReason::Failed(e) => error!("{}", e),
        StopReason::TornDown => debug!("{}: stopped by session teardown", direction),
    }

    teardown.close();
    PumpOutcome {
        sink,
        relayed,
        stop,
    }
}

/// Await a sink close, giving up after `CLOSE_TIMEOUT`
async fn bounded_close<F, E>(close: F, span: &Span, side: &str, target: &str)
where
    F: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(parent: span, "{} close for {}: {}", side, target, e),
        Err(_) => warn!(
            parent: span,
            "{} close for {} timed out after {:?}, dropping connection",
            side,
            target,
            CLOSE_TIMEOUT
        ),
    }
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub path: String,
    /// Frames relayed client -> backend
    pub upstream_frames: u64,
    /// Frames relayed backend -> client
    pub downstream_frames: u64,
    /// First I/O error that ended the session, if any
    pub io_error: Option<SessionIoError>,
}

/// Runs one session's two pumps and closes both connections when they stop
pub struct RelayPump {
    session: Session,
    teardown: Teardown,
}

impl RelayPump {
    pub fn new(session: Session, teardown: Teardown) -> Self {
        Self { session, teardown }
    }

    /// Relay until the session ends.
    ///
    /// The backend -> client pump is spawned on `tracker`; the client -> backend
    /// pump runs on the calling task.
    pub async fn run(self, tracker: &TaskTracker) -> SessionReport {
        let Session {
            id,
            path,
            backend_url,
            client,
            backend,
            admission,
        } = self.session;
        let teardown = self.teardown;

        let span = info_span!("session", %id);
        info!(parent: &span, "Relaying {} <-> {}", path, backend_url);

        let (client_tx, client_rx) = client.split();
        let (backend_tx, backend_rx) = backend.split();

        let downstream = tracker.spawn(
            pump(
                Direction::BackendToClient,
                backend_rx,
                client_tx,
                frame::from_backend,
                teardown.clone(),
            )
            .instrument(span.clone()),
        );

        let upstream = pump(
            Direction::ClientToBackend,
            client_rx,
            backend_tx,
            frame::from_client,
            teardown.clone(),
        )
        .instrument(span.clone())
        .await;

        let mut report = SessionReport {
            id,
            path: path.clone(),
            upstream_frames: upstream.relayed,
            downstream_frames: 0,
            io_error: match upstream.stop {
                StopReason::Failed(e) => Some(e),
                _ => None,
            },
        };

        // Each sink was handed back by its pump, so each is closed exactly once.
        // Both closes run together, each bounded by CLOSE_TIMEOUT.
        let mut backend_tx = upstream.sink;
        let backend_close = bounded_close(backend_tx.close(), &span, "Backend", &backend_url);
        let client_close = async {
            match downstream.await {
                Ok(outcome) => {
                    let mut client_tx = outcome.sink;
                    bounded_close(client_tx.close(), &span, "Client", &path).await;
                    Some((outcome.relayed, outcome.stop))
                }
                Err(e) => {
                    error!(parent: &span, "backend->client task for {} failed: {}", path, e);
                    None
                }
            }
        };
        let ((), finished) = tokio::join!(backend_close, client_close);

        if let Some((relayed, stop)) = finished {
            report.downstream_frames = relayed;
            if report.io_error.is_none() {
                if let StopReason::Failed(e) = stop {
                    report.io_error = Some(e);
                }
            }
        }

        drop(admission);
        report
    }
}
