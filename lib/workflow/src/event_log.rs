//! Append-only per-run event log.
//!
//! Each run gets its own log with sequence numbers starting at 1. The log
//! serves two kinds of readers:
//! - historical reads of a sequence range ([`EventLog::read`])
//! - live subscriptions that replay history from a cursor, then follow the
//!   tail with no gap or duplicate ([`EventLog::subscribe`])
//!
//! A log closes when a terminal event is appended or when it is sealed
//! without one (cancellation). Appends after that fail with `RunClosed`.

use crate::execution::{EventKind, ExecutionEvent};
use braid_core::RunId;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, warn};

/// A live event stream. Ends once the log is closed and drained.
pub type EventStream = BoxStream<'static, ExecutionEvent>;

/// Errors from event log operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLogError {
    /// No log exists for the run.
    RunNotFound { run_id: RunId },
    /// The log already holds its terminal event or was sealed.
    RunClosed { run_id: RunId },
    /// The run is cancelled; no new node may start.
    Cancelled { run_id: RunId },
    /// A log for the run already exists.
    RunExists { run_id: RunId },
    /// The requested sequence has been pruned.
    Pruned {
        run_id: RunId,
        requested: u64,
        first_available: u64,
    },
}

impl fmt::Display for EventLogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => write!(f, "no event log for run {run_id}"),
            Self::RunClosed { run_id } => write!(f, "event log for run {run_id} is closed"),
            Self::Cancelled { run_id } => write!(f, "run {run_id} is cancelled"),
            Self::RunExists { run_id } => write!(f, "event log for run {run_id} already exists"),
            Self::Pruned {
                run_id,
                requested,
                first_available,
            } => write!(
                f,
                "run {run_id}: sequence {requested} was pruned, first available is {first_available}"
            ),
        }
    }
}

impl std::error::Error for EventLogError {}

/// A contiguous slice of a run's log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSlice {
    pub events: Vec<ExecutionEvent>,
    /// Sequence the next append will get.
    pub next_sequence: u64,
    /// Lowest sequence still retained.
    pub first_sequence: u64,
    /// True once no further event can be appended.
    pub closed: bool,
}

#[derive(Debug)]
struct LogState {
    events: VecDeque<ExecutionEvent>,
    first_sequence: u64,
    next_sequence: u64,
    closed: bool,
    cancelled: bool,
}

#[derive(Debug)]
struct RunLog {
    run_id: RunId,
    state: Mutex<LogState>,
    /// Bumped after every append and on close.
    signal: watch::Sender<u64>,
}

impl RunLog {
    fn new(run_id: RunId) -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            run_id,
            state: Mutex::new(LogState {
                events: VecDeque::new(),
                first_sequence: 1,
                next_sequence: 1,
                closed: false,
                cancelled: false,
            }),
            signal,
        }
    }

    async fn slice(&self, from: u64, limit: usize) -> Result<LogSlice, EventLogError> {
        let state = self.state.lock().await;
        let from = from.max(1);
        if from < state.first_sequence {
            return Err(EventLogError::Pruned {
                run_id: self.run_id,
                requested: from,
                first_available: state.first_sequence,
            });
        }
        let skip = usize::try_from(from - state.first_sequence).unwrap_or(usize::MAX);
        let events = state.events.iter().skip(skip).take(limit).cloned().collect();
        Ok(LogSlice {
            events,
            next_sequence: state.next_sequence,
            first_sequence: state.first_sequence,
            closed: state.closed,
        })
    }

    fn notify(&self) {
        self.signal.send_modify(|version| *version += 1);
    }
}

/// Page size used when a live stream catches up on history.
const STREAM_BATCH: usize = 256;

/// Per-run append-only logs.
#[derive(Debug, Default)]
pub struct EventLog {
    runs: RwLock<HashMap<RunId, Arc<RunLog>>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the log for a run.
    ///
    /// # Errors
    ///
    /// Returns `RunExists` if the run already has a log.
    pub async fn create(&self, run_id: RunId) -> Result<(), EventLogError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run_id) {
            return Err(EventLogError::RunExists { run_id });
        }
        runs.insert(run_id, Arc::new(RunLog::new(run_id)));
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Arc<RunLog>, EventLogError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(EventLogError::RunNotFound { run_id })
    }

    /// Appends an event, assigning the next sequence number.
    ///
    /// # Errors
    ///
    /// - `RunClosed` once a terminal event was appended or the log was sealed
    /// - `Cancelled` for `node_start` and terminal events after
    ///   [`EventLog::mark_cancelled`]
    pub async fn append(&self, run_id: RunId, kind: EventKind) -> Result<ExecutionEvent, EventLogError> {
        let log = self.get(run_id).await?;
        let event = {
            let mut state = log.state.lock().await;
            if state.closed {
                warn!(%run_id, event = kind.name(), "append to closed log rejected");
                return Err(EventLogError::RunClosed { run_id });
            }
            if state.cancelled && (kind.is_node_start() || kind.is_terminal()) {
                return Err(EventLogError::Cancelled { run_id });
            }
            let event = ExecutionEvent {
                sequence: state.next_sequence,
                run_id,
                kind,
                timestamp: Utc::now(),
            };
            state.next_sequence += 1;
            if event.is_terminal() {
                state.closed = true;
            }
            state.events.push_back(event.clone());
            event
        };
        debug!(%run_id, sequence = event.sequence, event = event.kind.name(), "appended event");
        log.notify();
        Ok(event)
    }

    /// Closes the log without a terminal event. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run has no log.
    pub async fn seal(&self, run_id: RunId) -> Result<(), EventLogError> {
        let log = self.get(run_id).await?;
        let changed = {
            let mut state = log.state.lock().await;
            !std::mem::replace(&mut state.closed, true)
        };
        if changed {
            debug!(%run_id, "sealed event log");
            log.notify();
        }
        Ok(())
    }

    /// Rejects every later `node_start` and terminal append for the run.
    ///
    /// Returns false, leaving the log untouched, if it was already closed.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run has no log.
    pub async fn mark_cancelled(&self, run_id: RunId) -> Result<bool, EventLogError> {
        let log = self.get(run_id).await?;
        let mut state = log.state.lock().await;
        if state.closed {
            return Ok(false);
        }
        state.cancelled = true;
        Ok(true)
    }

    /// Returns true if [`EventLog::mark_cancelled`] was called for the run.
    pub async fn is_cancelled(&self, run_id: RunId) -> Result<bool, EventLogError> {
        let log = self.get(run_id).await?;
        let cancelled = log.state.lock().await.cancelled;
        Ok(cancelled)
    }

    /// Reads up to `limit` events starting at sequence `from`.
    ///
    /// # Errors
    ///
    /// - `RunNotFound` if the run has no log
    /// - `Pruned` if `from` is below the first retained sequence
    pub async fn read(&self, run_id: RunId, from: u64, limit: usize) -> Result<LogSlice, EventLogError> {
        self.get(run_id).await?.slice(from, limit).await
    }

    /// Returns every retained event of a run.
    pub async fn events(&self, run_id: RunId) -> Result<Vec<ExecutionEvent>, EventLogError> {
        let log = self.get(run_id).await?;
        let state = log.state.lock().await;
        Ok(state.events.iter().cloned().collect())
    }

    /// Returns true once the run's log accepts no more events.
    pub async fn is_closed(&self, run_id: RunId) -> Result<bool, EventLogError> {
        let log = self.get(run_id).await?;
        let closed = log.state.lock().await.closed;
        Ok(closed)
    }

    /// Subscribes to a run, starting at sequence `from`.
    ///
    /// The stream yields retained history first, then live events, and ends
    /// after the log closes.
    ///
    /// # Errors
    ///
    /// - `RunNotFound` if the run has no log
    /// - `Pruned` if `from` is below the first retained sequence
    pub async fn subscribe(&self, run_id: RunId, from: u64) -> Result<EventStream, EventLogError> {
        let log = self.get(run_id).await?;
        // Surface pruning up front instead of as a silently short stream.
        log.slice(from, 0).await?;
        let signal = log.signal.subscribe();

        let stream = stream::unfold(
            (log, signal, from.max(1), VecDeque::new()),
            |(log, mut signal, mut next, mut buffer)| async move {
                loop {
                    if let Some(event) = buffer.pop_front() {
                        return Some((event, (log, signal, next, buffer)));
                    }
                    signal.borrow_and_update();
                    let slice = log.slice(next, STREAM_BATCH).await.ok()?;
                    if let Some(last) = slice.events.last() {
                        next = last.sequence + 1;
                        buffer.extend(slice.events);
                        continue;
                    }
                    if slice.closed {
                        return None;
                    }
                    signal.changed().await.ok()?;
                }
            },
        );
        Ok(stream.boxed())
    }

    /// Drops every event below `sequence`. Returns how many were dropped.
    pub async fn prune_before(&self, run_id: RunId, sequence: u64) -> Result<usize, EventLogError> {
        let log = self.get(run_id).await?;
        let mut state = log.state.lock().await;
        let mut pruned = 0;
        while state
            .events
            .front()
            .is_some_and(|event| event.sequence < sequence)
        {
            state.events.pop_front();
            pruned += 1;
        }
        state.first_sequence = state.first_sequence.max(sequence.min(state.next_sequence));
        Ok(pruned)
    }

    /// Removes a run's log entirely. Open subscriptions end.
    pub async fn remove(&self, run_id: RunId) -> Result<(), EventLogError> {
        let log = self
            .runs
            .write()
            .await
            .remove(&run_id)
            .ok_or(EventLogError::RunNotFound { run_id })?;
        log.state.lock().await.closed = true;
        log.notify();
        Ok(())
    }

    /// Returns true if a log exists for the run.
    pub async fn contains(&self, run_id: RunId) -> bool {
        self.runs.read().await.contains_key(&run_id)
    }
}
