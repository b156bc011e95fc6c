//! Approval registry coordinating human approval requests between whoever
//! raised an `ask` verdict (requesters) and the approval UI (responders).

use crate::event::EngineEvent;
use crate::permission::{PermissionError, PermissionRequest, PermissionResponse, RuleScope};
use crate::rules::{Rule, RuleDecision};
use crate::sandbox_policy::EnhancedInspector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// A request waiting for a human decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub id: String,
    pub request: PermissionRequest,
    pub decided_by: String,
    pub message: String,
    pub requested_at: DateTime<Utc>,
}

/// What the requester receives once the approval is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub decision: RuleDecision,
    pub note: String,
    /// Rule synthesized from an `*_always` decision.
    pub rule: Option<Rule>,
}

#[derive(Debug)]
struct Slot {
    approval: PendingApproval,
    sender: oneshot::Sender<ApprovalOutcome>,
}

/// Registry of pending approvals. Cheap to clone.
///
/// Resolving with `allow_always` or `deny_always` records the decision
/// through the inspector, so later calls to the same tool are decided by a
/// persisted rule.
#[derive(Clone)]
pub struct ApprovalRegistry {
    inspector: Arc<EnhancedInspector>,
    pending: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ApprovalRegistry {
    pub fn new(inspector: Arc<EnhancedInspector>) -> Self {
        Self {
            inspector,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inspector(&self) -> &Arc<EnhancedInspector> {
        &self.inspector
    }

    /// Register an approval for an `ask` verdict. Stores the new ID in
    /// `response.approval_id` and returns a receiver for the decision.
    /// Dropping the receiver is fine; the approval stays resolvable.
    pub async fn request(
        &self,
        request: &PermissionRequest,
        response: &mut PermissionResponse,
    ) -> oneshot::Receiver<ApprovalOutcome> {
        let (sender, receiver) = oneshot::channel();
        let id = ulid::Ulid::new().to_string();
        let approval = PendingApproval {
            id: id.clone(),
            request: request.clone(),
            decided_by: response.decided_by.clone(),
            message: response.message.clone(),
            requested_at: Utc::now(),
        };
        self.pending
            .lock()
            .await
            .insert(id.clone(), Slot { approval, sender });
        response.approval_id = Some(id.clone());

        tracing::info!(approval_id = %id, tool = %request.tool_name, "approval requested");
        self.inspector.emit(EngineEvent::ApprovalRequested {
            approval_id: id,
            tool_name: request.tool_name.clone(),
            arguments: request.arguments.clone(),
            decided_by: response.decided_by.clone(),
            risk_level: response.risk_level,
            call_id: request.call_id.clone(),
        });
        receiver
    }

    /// Resolve a pending approval. Returns the resolved approval together
    /// with the outcome sent to the requester.
    pub async fn resolve(
        &self,
        id: &str,
        decision: RuleDecision,
        note: &str,
    ) -> Result<(PendingApproval, ApprovalOutcome), PermissionError> {
        let slot = self
            .pending
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| PermissionError::ApprovalNotFound(id.to_string()))?;
        let approval = slot.approval;

        let rule = if decision.is_permanent() {
            self.inspector
                .record_decision(&approval.request, decision, note, RuleScope::Persistent)
        } else {
            None
        };
        let outcome = ApprovalOutcome {
            decision,
            note: note.to_string(),
            rule,
        };
        let _ = slot.sender.send(outcome.clone());

        tracing::info!(approval_id = %id, ?decision, "approval resolved");
        self.inspector.emit(EngineEvent::ApprovalResolved {
            approval_id: id.to_string(),
            tool_name: approval.request.tool_name.clone(),
            decision,
        });
        Ok((approval, outcome))
    }

    pub async fn get(&self, id: &str) -> Option<PendingApproval> {
        self.pending
            .lock()
            .await
            .get(id)
            .map(|slot| slot.approval.clone())
    }

    /// Drop a pending approval without deciding it. The requester's
    /// receiver sees the channel close.
    pub async fn discard(&self, id: &str) -> Option<PendingApproval> {
        let slot = self.pending.lock().await.remove(id)?;
        tracing::debug!(approval_id = %id, tool = %slot.approval.request.tool_name, "approval discarded");
        Some(slot.approval)
    }

    /// Snapshot of pending approvals, oldest first.
    pub async fn pending_list(&self) -> Vec<PendingApproval> {
        let mut list: Vec<PendingApproval> = self
            .pending
            .lock()
            .await
            .values()
            .map(|slot| slot.approval.clone())
            .collect();
        list.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        list
    }

    pub async fn has_pending(&self) -> bool {
        !self.pending.lock().await.is_empty()
    }
}
