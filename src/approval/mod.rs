//! Operator approvals keyed by runId.
//!
//! A record is created the first time a request needs an operator, resolved
//! exactly once (allow-once / allow-always / deny), and expires after a TTL.
//! Transitions are monotonic; a resolved record never reverts. Expired
//! records are destroyed lazily on access.

use crate::command::ExecRequest;
use crate::command::normalize::normalize_request;
use crate::errors::{GateError, GateResult};
use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Scope an identity must hold to resolve approvals.
pub const OPERATOR_SCOPE: &str = "operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    #[serde(rename = "allow-once")]
    AllowOnce,
    #[serde(rename = "allow-always")]
    AllowAlways,
}

/// Where a record is in its lifecycle; doubles as the operator's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalState {
    Pending,
    AllowOnce,
    AllowAlways,
    Deny,
}

impl ApprovalState {
    pub fn is_resolved(self) -> bool {
        self != ApprovalState::Pending
    }

    pub fn as_decision(self) -> Option<ApprovalDecision> {
        match self {
            ApprovalState::AllowOnce => Some(ApprovalDecision::AllowOnce),
            ApprovalState::AllowAlways => Some(ApprovalDecision::AllowAlways),
            ApprovalState::Pending | ApprovalState::Deny => None,
        }
    }
}

/// An identity plus the scopes it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: String,
    pub scopes: Vec<String>,
}

impl Requester {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scopes: Vec::new(),
        }
    }

    pub fn operator(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scopes: vec![OPERATOR_SCOPE.to_string()],
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Request identity an approval binds to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequestSummary {
    pub run_id: String,
    pub host: String,
    pub cmd_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    /// Equals the runId of the request that opened it.
    pub id: String,
    #[serde(flatten)]
    pub summary: ApprovalRequestSummary,
    pub requester: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub decision: ApprovalState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl ApprovalRecord {
    fn expired(&self, now: i64) -> bool {
        self.decision == ApprovalState::Pending && now >= self.expires_at_ms
    }
}

/// Sanitized parameters handed back to the orchestrator after a successful
/// approval binding.
#[derive(Debug, Clone)]
pub struct SanitizedRequest {
    pub request: ExecRequest,
    pub decision: ApprovalDecision,
}

pub struct ApprovalManager {
    ttl_ms: i64,
    records: Mutex<HashMap<String, ApprovalRecord>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<ApprovalState>>>>,
}

impl ApprovalManager {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            records: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or reuse) the pending record for this request. Returns the id.
    pub fn open(&self, summary: ApprovalRequestSummary, requester: &Requester) -> String {
        self.open_at(summary, requester, now_ms())
    }

    pub fn open_at(
        &self,
        summary: ApprovalRequestSummary,
        requester: &Requester,
        now: i64,
    ) -> String {
        let id = summary.run_id.clone();
        let mut records = self.records.lock().expect("approval records lock");
        if records.get(&id).is_some_and(|r| !r.expired(now)) {
            return id;
        }
        // Drop an expired leftover, if any
        records.remove(&id);
        debug!("opening approval record {} for {}", id, requester.id);
        records.insert(
            id.clone(),
            ApprovalRecord {
                id: id.clone(),
                summary,
                requester: requester.id.clone(),
                created_at_ms: now,
                expires_at_ms: now + self.ttl_ms,
                decision: ApprovalState::Pending,
                resolved_at_ms: None,
                resolved_by: None,
            },
        );
        id
    }

    /// Record the operator's verdict. Fails on unknown, resolved, or expired
    /// records, and on resolvers without the operator scope.
    pub fn resolve(&self, id: &str, decision: ApprovalState, resolver: &Requester) -> GateResult<()> {
        self.resolve_at(id, decision, resolver, now_ms())
    }

    pub fn resolve_at(
        &self,
        id: &str,
        decision: ApprovalState,
        resolver: &Requester,
        now: i64,
    ) -> GateResult<()> {
        if !decision.is_resolved() {
            return Err(GateError::Approval(
                "resolution must be allow-once, allow-always, or deny".to_string(),
            ));
        }
        if !resolver.has_scope(OPERATOR_SCOPE) {
            return Err(GateError::Approval(format!(
                "{} lacks the {} scope",
                resolver.id, OPERATOR_SCOPE
            )));
        }

        let mut records = self.records.lock().expect("approval records lock");
        match records.get(id).map(|r| r.expired(now)) {
            None => {
                return Err(GateError::Approval(format!("no approval record for {id}")));
            }
            Some(true) => {
                records.remove(id);
                return Err(GateError::Approval(format!("approval record {id} expired")));
            }
            Some(false) => {}
        }
        let Some(record) = records.get_mut(id) else {
            return Err(GateError::Approval(format!("no approval record for {id}")));
        };
        if record.decision.is_resolved() {
            return Err(GateError::Approval(format!(
                "approval record {id} already resolved"
            )));
        }
        record.decision = decision;
        record.resolved_at_ms = Some(now);
        record.resolved_by = Some(resolver.id.clone());
        drop(records);

        if let Some(senders) = self
            .waiters
            .lock()
            .expect("approval waiters lock")
            .remove(id)
        {
            for sender in senders {
                let _ = sender.send(decision);
            }
        }
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Option<ApprovalRecord> {
        self.snapshot_at(id, now_ms())
    }

    pub fn snapshot_at(&self, id: &str, now: i64) -> Option<ApprovalRecord> {
        let mut records = self.records.lock().expect("approval records lock");
        if records.get(id).is_some_and(|r| r.expired(now)) {
            records.remove(id);
            return None;
        }
        records.get(id).cloned()
    }

    /// Await a record's resolution. Returns the verdict, or an error on
    /// cancellation, expiry, or missing record.
    pub async fn wait(&self, id: &str, cancel: &CancellationToken) -> GateResult<ApprovalState> {
        let (rx, remaining_ms) = {
            let records = self.records.lock().expect("approval records lock");
            let Some(record) = records.get(id) else {
                return Err(GateError::Approval(format!("no approval record for {id}")));
            };
            if record.decision.is_resolved() {
                return Ok(record.decision);
            }
            let remaining_ms = record.expires_at_ms.saturating_sub(now_ms()).max(0);
            let (tx, rx) = oneshot::channel();
            self.waiters
                .lock()
                .expect("approval waiters lock")
                .entry(id.to_string())
                .or_default()
                .push(tx);
            (rx, remaining_ms)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(GateError::Approval("cancelled".to_string())),
            _ = tokio::time::sleep(std::time::Duration::from_millis(remaining_ms as u64)) => {
                Err(GateError::Approval(format!("approval record {id} expired")))
            }
            decision = rx => decision
                .map_err(|_| GateError::Approval("approval manager shut down".to_string())),
        }
    }

    /// Bridge between an approved decision and a later invocation.
    ///
    /// Verifies that (a) the incoming command is internally consistent,
    /// (b) an approval record with `id == runId` was resolved to allow by a
    /// holder of the operator scope, for the same requester, and (c) the
    /// command text of the incoming request equals the command text the
    /// operator saw. Only then does the request come back `approved=true`
    /// with the recorded decision.
    pub fn sanitize_for_forwarding(
        &self,
        params: &ExecRequest,
        requester: &Requester,
        now: i64,
    ) -> GateResult<SanitizedRequest> {
        let normalized = normalize_request(params)?;

        let run_id = params
            .run_id
            .as_deref()
            .ok_or_else(|| GateError::Approval("approved request carries no runId".to_string()))?;

        let record = self
            .snapshot_at(run_id, now)
            .ok_or_else(|| GateError::Approval(format!("no approval record for {run_id}")))?;

        if record.requester != requester.id {
            return Err(GateError::Approval(format!(
                "approval record {run_id} belongs to a different requester"
            )));
        }
        let decision = match record.decision {
            ApprovalState::AllowOnce => ApprovalDecision::AllowOnce,
            ApprovalState::AllowAlways => ApprovalDecision::AllowAlways,
            ApprovalState::Pending => {
                return Err(GateError::Approval(format!(
                    "approval record {run_id} is still pending"
                )));
            }
            ApprovalState::Deny => {
                return Err(GateError::Approval(format!(
                    "approval record {run_id} was denied"
                )));
            }
        };
        if record.resolved_by.is_none() {
            return Err(GateError::Approval(format!(
                "approval record {run_id} has no resolver"
            )));
        }

        if normalized.cmd_text != record.summary.cmd_text {
            return Err(GateError::Approval(format!(
                "command text does not match the approved command for {run_id}"
            )));
        }

        let mut request = params.clone();
        request.approved = true;
        request.approval_decision = Some(decision);
        Ok(SanitizedRequest { request, decision })
    }
}
