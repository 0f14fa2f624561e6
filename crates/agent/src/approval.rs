//! Tool call approval.
//!
//! An optional gate in front of dispatch. The host supplies a
//! [`ToolApprover`]; the gate bounds how long it may take and denies when
//! the wait runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use revloop_core::tool::ToolCall;
use tracing::warn;

/// Decides whether a tool call may run.
#[async_trait]
pub trait ToolApprover: Send + Sync {
    async fn approve(&self, call: &ToolCall) -> bool;
}

/// Outcome of an approval check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied,
    TimedOut,
}

impl ApprovalDecision {
    pub fn is_approved(self) -> bool {
        self == Self::Approved
    }
}

/// A [`ToolApprover`] with a bounded wait.
#[derive(Clone)]
pub struct ApprovalGate {
    approver: Arc<dyn ToolApprover>,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(approver: Arc<dyn ToolApprover>, timeout: Duration) -> Self {
        Self { approver, timeout }
    }

    pub async fn check(&self, call: &ToolCall) -> ApprovalDecision {
        match tokio::time::timeout(self.timeout, self.approver.approve(call)).await {
            Ok(true) => ApprovalDecision::Approved,
            Ok(false) => ApprovalDecision::Denied,
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = self.timeout.as_secs(), "Approval timed out, denying");
                ApprovalDecision::TimedOut
            }
        }
    }
}
