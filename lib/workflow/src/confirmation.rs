//! Confirmation gate for sensitive nodes.
//!
//! Node types whose contract sets `requires_confirmation` pause their branch
//! until someone allows or denies the call. Each pause gets a fresh
//! [`ConfirmId`]; the first decision wins and later ones are rejected. When
//! nobody answers within the timeout the default decision (deny) applies.

use crate::event_log::{EventLog, EventLogError};
use crate::execution::EventKind;
use crate::node::{NodeId, NodeType};
use braid_core::{ConfirmId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Outcome of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    /// Applied when nobody answers.
    pub const DEFAULT: Self = Self::Deny;
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

/// A pause point awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub confirm_id: ConfirmId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub default_decision: Decision,
    /// `None` while unresolved.
    pub decision: Option<Decision>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Errors from deciding a confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationError {
    /// No request with this id was ever issued.
    UnknownConfirmation { confirm_id: ConfirmId },
    /// The request already has a decision.
    AlreadyResolved {
        confirm_id: ConfirmId,
        decision: Decision,
    },
}

impl fmt::Display for ConfirmationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownConfirmation { confirm_id } => {
                write!(f, "unknown confirmation: {confirm_id}")
            }
            Self::AlreadyResolved {
                confirm_id,
                decision,
            } => write!(f, "confirmation {confirm_id} already resolved: {decision}"),
        }
    }
}

impl std::error::Error for ConfirmationError {}

#[derive(Debug, Default)]
struct GateState {
    pending: HashMap<ConfirmId, (ConfirmationRequest, oneshot::Sender<Decision>)>,
    resolved: HashMap<ConfirmId, ConfirmationRequest>,
}

impl GateState {
    /// Resolves a pending request. Returns the effective decision, which is
    /// the earlier one if the request was already resolved.
    fn resolve(&mut self, confirm_id: ConfirmId, decision: Decision) -> Result<ConfirmationRequest, ConfirmationError> {
        if let Some((mut request, tx)) = self.pending.remove(&confirm_id) {
            request.decision = Some(decision);
            // The waiter may be gone after a timeout or cancellation
            let _ = tx.send(decision);
            self.resolved.insert(confirm_id, request.clone());
            return Ok(request);
        }
        match self.resolved.get(&confirm_id) {
            Some(request) => Err(ConfirmationError::AlreadyResolved {
                confirm_id,
                decision: request.decision.unwrap_or(request.default_decision),
            }),
            None => Err(ConfirmationError::UnknownConfirmation { confirm_id }),
        }
    }
}

/// Pauses gated nodes and collects decisions.
#[derive(Debug)]
pub struct ConfirmationGate {
    log: Arc<EventLog>,
    timeout: Duration,
    state: Mutex<GateState>,
}

impl ConfirmationGate {
    #[must_use]
    pub fn new(log: Arc<EventLog>, timeout: Duration) -> Self {
        Self {
            log,
            timeout,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Suspends until a decision is made for this node execution.
    ///
    /// Appends `workflow_confirm_required`, waits for [`decide`](Self::decide),
    /// the timeout or cancellation, then appends `workflow_confirmed`.
    /// On cancellation the request is resolved with the default decision and
    /// no `workflow_confirmed` is appended.
    ///
    /// # Errors
    ///
    /// Returns an error if the run's log rejects the request event.
    #[instrument(skip_all, fields(%run_id, %node_id))]
    pub async fn confirm(
        &self,
        run_id: RunId,
        node_id: &NodeId,
        node_type: &NodeType,
        cancellation: &CancellationToken,
    ) -> Result<Decision, EventLogError> {
        let confirm_id = ConfirmId::new();
        let requested_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|timeout| requested_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let request = ConfirmationRequest {
            confirm_id,
            run_id,
            node_id: node_id.clone(),
            node_type: node_type.clone(),
            default_decision: Decision::DEFAULT,
            decision: None,
            requested_at,
            expires_at,
        };

        // Registered before the event is visible so an immediate answer lands.
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .pending
            .insert(confirm_id, (request, tx));

        let appended = self
            .log
            .append(
                run_id,
                EventKind::WorkflowConfirmRequired {
                    node_id: node_id.clone(),
                    node_type: node_type.clone(),
                    confirm_id,
                    default_decision: Decision::DEFAULT,
                },
            )
            .await;
        if let Err(err) = appended {
            let _ = self.state.lock().await.resolve(confirm_id, Decision::DEFAULT);
            return Err(err);
        }
        info!(%confirm_id, "awaiting confirmation");

        let decision = tokio::select! {
            received = rx => received.unwrap_or(Decision::DEFAULT),
            () = tokio::time::sleep(self.timeout) => {
                let decision = self.expire(confirm_id).await;
                warn!(%confirm_id, %decision, "confirmation timed out");
                decision
            }
            () = cancellation.cancelled() => {
                self.expire(confirm_id).await;
                info!(%confirm_id, "run cancelled while awaiting confirmation");
                return Ok(Decision::DEFAULT);
            }
        };

        self.log
            .append(
                run_id,
                EventKind::WorkflowConfirmed {
                    node_id: node_id.clone(),
                    node_type: node_type.clone(),
                    confirm_id,
                    decision,
                },
            )
            .await?;
        if decision == Decision::Deny {
            warn!(%confirm_id, "node execution denied");
        }
        Ok(decision)
    }

    /// Applies the default decision unless a decision was already made.
    /// Returns the effective decision.
    async fn expire(&self, confirm_id: ConfirmId) -> Decision {
        match self.state.lock().await.resolve(confirm_id, Decision::DEFAULT) {
            Ok(request) => request.decision.unwrap_or(Decision::DEFAULT),
            Err(ConfirmationError::AlreadyResolved { decision, .. }) => decision,
            Err(ConfirmationError::UnknownConfirmation { .. }) => Decision::DEFAULT,
        }
    }

    /// Records a decision for a pending request.
    ///
    /// # Errors
    ///
    /// - `UnknownConfirmation` if the id was never issued
    /// - `AlreadyResolved` if a decision, timeout or cancellation came first
    pub async fn decide(
        &self,
        confirm_id: ConfirmId,
        decision: Decision,
    ) -> Result<ConfirmationRequest, ConfirmationError> {
        let result = self.state.lock().await.resolve(confirm_id, decision);
        match &result {
            Ok(_) => info!(%confirm_id, %decision, "confirmation decided"),
            Err(err) => warn!(%confirm_id, error = %err, "confirmation rejected"),
        }
        result
    }

    /// Lists unresolved requests, oldest first.
    pub async fn pending(&self) -> Vec<ConfirmationRequest> {
        let mut requests: Vec<ConfirmationRequest> = self
            .state
            .lock()
            .await
            .pending
            .values()
            .map(|(request, _)| request.clone())
            .collect();
        requests.sort_by_key(|request| request.confirm_id);
        requests
    }

    /// Looks up a request, pending or resolved.
    pub async fn request(&self, confirm_id: ConfirmId) -> Option<ConfirmationRequest> {
        let state = self.state.lock().await;
        state
            .pending
            .get(&confirm_id)
            .map(|(request, _)| request.clone())
            .or_else(|| state.resolved.get(&confirm_id).cloned())
    }

    /// Forgets resolved requests of a run.
    pub async fn forget_run(&self, run_id: RunId) {
        self.state
            .lock()
            .await
            .resolved
            .retain(|_, request| request.run_id != run_id);
    }
}
