//! Replay service: paginated history reads and live follow.
//!
//! Pages are addressed by opaque cursors that encode the next unread
//! sequence, so consecutive pages never overlap and never skip an event.

use crate::config::EngineConfig;
use crate::event_log::{EventLog, EventLogError, EventStream};
use crate::execution::ExecutionEvent;
use braid_core::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Position in a run's log: the next sequence to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(u64);

impl Cursor {
    /// The cursor of a fresh read.
    pub const START: Self = Self(1);

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.0
    }

    fn at(sequence: u64) -> Self {
        Self(sequence.max(1))
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{:016x}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReplayError::InvalidCursor {
            cursor: s.to_string(),
        };
        let hex = s.strip_prefix('c').ok_or_else(invalid)?;
        if hex.len() != 16 {
            return Err(invalid());
        }
        let sequence = u64::from_str_radix(hex, 16).map_err(|_| invalid())?;
        if sequence == 0 {
            return Err(invalid());
        }
        Ok(Self(sequence))
    }
}

impl Serialize for Cursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One page of a run's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayPage {
    pub events: Vec<ExecutionEvent>,
    /// Where the next page starts.
    pub next_cursor: Cursor,
    /// True while events already appended lie beyond this page.
    pub has_more: bool,
    /// True once the log accepts no further events.
    pub closed: bool,
}

impl ReplayPage {
    /// True when the caller has seen everything and nothing more can come.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !self.has_more && self.closed
    }
}

/// Errors from the replay service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// No run with this id exists.
    RunNotFound { run_id: RunId },
    /// Events at the cursor were pruned; resynchronize from `first_available`.
    Gap {
        run_id: RunId,
        requested: u64,
        first_available: u64,
    },
    /// The cursor string was not issued by this service.
    InvalidCursor { cursor: String },
    /// Page size must be at least 1.
    InvalidPageSize,
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::Gap {
                run_id,
                requested,
                first_available,
            } => write!(
                f,
                "gap in run {run_id}: sequence {requested} requested, first available is {first_available}"
            ),
            Self::InvalidCursor { cursor } => write!(f, "invalid cursor: {cursor}"),
            Self::InvalidPageSize => write!(f, "page size must be at least 1"),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<EventLogError> for ReplayError {
    fn from(e: EventLogError) -> Self {
        match e {
            EventLogError::Pruned {
                run_id,
                requested,
                first_available,
            } => Self::Gap {
                run_id,
                requested,
                first_available,
            },
            EventLogError::RunNotFound { run_id }
            | EventLogError::RunClosed { run_id }
            | EventLogError::Cancelled { run_id }
            | EventLogError::RunExists { run_id } => Self::RunNotFound { run_id },
        }
    }
}

/// Serves run history from the event log.
#[derive(Debug, Clone)]
pub struct ReplayService {
    log: Arc<EventLog>,
    default_page_size: usize,
    max_page_size: usize,
}

impl ReplayService {
    #[must_use]
    pub fn new(log: Arc<EventLog>, config: &EngineConfig) -> Self {
        let max_page_size = config.max_page_size.max(1);
        Self {
            log,
            default_page_size: config.default_page_size.clamp(1, max_page_size),
            max_page_size,
        }
    }

    /// Fetches the page starting at `cursor` (the beginning when absent).
    ///
    /// Without a page size the configured default is used; larger sizes are
    /// clamped to the configured maximum.
    ///
    /// # Errors
    ///
    /// - `InvalidPageSize` for a page size of zero
    /// - `RunNotFound` for unknown runs
    /// - `Gap` if the cursor points at pruned events
    pub async fn fetch(
        &self,
        run_id: RunId,
        cursor: Option<Cursor>,
        page_size: Option<usize>,
    ) -> Result<ReplayPage, ReplayError> {
        let page_size = match page_size {
            Some(0) => return Err(ReplayError::InvalidPageSize),
            Some(size) => size.min(self.max_page_size),
            None => self.default_page_size,
        };
        let from = cursor.unwrap_or_default();
        let slice = self.log.read(run_id, from.sequence(), page_size).await?;

        let next_cursor = slice
            .events
            .last()
            .map_or(from, |event| Cursor::at(event.sequence + 1));
        let has_more = next_cursor.sequence() < slice.next_sequence;
        debug!(%run_id, from = from.sequence(), count = slice.events.len(), has_more, "replay page");
        Ok(ReplayPage {
            events: slice.events,
            next_cursor,
            has_more,
            closed: slice.closed,
        })
    }

    /// Follows a run from `cursor`: history first, then live events, ending
    /// after the log closes.
    ///
    /// # Errors
    ///
    /// - `RunNotFound` for unknown runs
    /// - `Gap` if the cursor points at pruned events
    pub async fn follow(&self, run_id: RunId, cursor: Option<Cursor>) -> Result<EventStream, ReplayError> {
        let from = cursor.unwrap_or_default();
        Ok(self.log.subscribe(run_id, from.sequence()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::EventKind;
    use crate::node::{NodeId, NodeType};
    use futures::StreamExt;
    use serde_json::json;

    fn service(max_page_size: usize) -> (ReplayService, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let config = EngineConfig {
            default_page_size: 2,
            max_page_size,
            ..EngineConfig::default()
        };
        (ReplayService::new(log.clone(), &config), log)
    }

    async fn run_with_events(log: &EventLog, nodes: usize) -> RunId {
        let run_id = RunId::new();
        log.create(run_id).await.expect("create");
        for i in 0..nodes {
            let node_id = NodeId::new(format!("n{i}"));
            log.append(
                run_id,
                EventKind::NodeStart {
                    node_id: node_id.clone(),
                    node_type: NodeType::new("task"),
                },
            )
            .await
            .expect("append");
            log.append(
                run_id,
                EventKind::NodeComplete {
                    node_id,
                    node_type: NodeType::new("task"),
                    output: json!(i),
                },
            )
            .await
            .expect("append");
        }
        run_id
    }

    #[test]
    fn cursor_text_form() {
        let cursor = Cursor::at(42);
        let parsed: Cursor = cursor.to_string().parse().expect("parse");
        assert_eq!(parsed, cursor);
        assert!("42".parse::<Cursor>().is_err());
        assert!("c0000000000000000".parse::<Cursor>().is_err());
        assert!("cnot-hex-at-all!!".parse::<Cursor>().is_err());
    }

    #[tokio::test]
    async fn pages_cover_the_log_without_overlap() {
        let (service, log) = service(1000);
        let run_id = run_with_events(&log, 3).await;
        log.append(
            run_id,
            EventKind::WorkflowComplete {
                result: json!(null),
                execution_log: Vec::new(),
            },
        )
        .await
        .expect("terminal");

        let mut cursor = None;
        let mut sequences = Vec::new();
        loop {
            let page = service.fetch(run_id, cursor, Some(3)).await.expect("page");
            sequences.extend(page.events.iter().map(|e| e.sequence));
            cursor = Some(page.next_cursor);
            if page.is_final() {
                assert!(page.events.last().is_some_and(ExecutionEvent::is_terminal));
                break;
            }
        }
        assert_eq!(sequences, (1..=7).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn open_log_reports_no_more_at_the_tail() {
        let (service, log) = service(1000);
        let run_id = run_with_events(&log, 1).await;

        let page = service.fetch(run_id, None, None).await.expect("page");
        assert_eq!(page.events.len(), 2);
        assert!(!page.has_more);
        assert!(!page.closed);

        let empty = service
            .fetch(run_id, Some(page.next_cursor), None)
            .await
            .expect("page");
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_cursor, page.next_cursor);
    }

    #[tokio::test]
    async fn page_size_is_validated_and_clamped() {
        let (service, log) = service(3);
        let run_id = run_with_events(&log, 3).await;

        assert_eq!(
            service.fetch(run_id, None, Some(0)).await,
            Err(ReplayError::InvalidPageSize)
        );
        let page = service.fetch(run_id, None, Some(500)).await.expect("page");
        assert_eq!(page.events.len(), 3);
        assert!(page.has_more);
        let page = service.fetch(run_id, None, None).await.expect("page");
        assert_eq!(page.events.len(), 2);
    }

    #[tokio::test]
    async fn pruned_history_is_a_gap() {
        let (service, log) = service(1000);
        let run_id = run_with_events(&log, 2).await;
        log.prune_before(run_id, 3).await.expect("prune");

        assert_eq!(
            service.fetch(run_id, None, None).await,
            Err(ReplayError::Gap {
                run_id,
                requested: 1,
                first_available: 3
            })
        );
        let page = service
            .fetch(run_id, Some(Cursor::at(3)), None)
            .await
            .expect("page");
        assert_eq!(page.events[0].sequence, 3);
    }

    #[tokio::test]
    async fn unknown_run() {
        let (service, _) = service(10);
        let run_id = RunId::new();
        assert_eq!(
            service.fetch(run_id, None, None).await,
            Err(ReplayError::RunNotFound { run_id })
        );
        assert!(service.follow(run_id, None).await.is_err());
    }

    #[tokio::test]
    async fn follow_matches_pages() {
        let (service, log) = service(1000);
        let run_id = run_with_events(&log, 2).await;
        log.seal(run_id).await.expect("seal");

        let followed: Vec<u64> = service
            .follow(run_id, Some(Cursor::at(2)))
            .await
            .expect("follow")
            .map(|e| e.sequence)
            .collect()
            .await;
        assert_eq!(followed, vec![2, 3, 4]);
    }
}
