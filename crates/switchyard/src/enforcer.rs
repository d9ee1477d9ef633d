//! Fail-closed authorization of inbound calls.
//!
//! Every decision is written to the `switchyard::audit` tracing target.

use std::sync::Arc;

use serde_json::json;

use crate::bridge::protocol::Params;
use crate::capability::CapabilityTable;
use crate::error::IpcError;
use crate::process::ProcessRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    UnknownMethod,
    RoleNotAllowed,
    Constraint { arg: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{caller} may not call {method}: {}", describe(.reason))]
pub struct Denial {
    pub caller: String,
    pub method: String,
    pub reason: DenialReason,
}

fn describe(reason: &DenialReason) -> String {
    match reason {
        DenialReason::UnknownMethod => "method not granted".to_string(),
        DenialReason::RoleNotAllowed => "role not allowed".to_string(),
        DenialReason::Constraint { arg, reason } => format!("argument {arg}: {reason}"),
    }
}

impl From<Denial> for IpcError {
    fn from(denial: Denial) -> Self {
        let details = match &denial.reason {
            DenialReason::UnknownMethod => json!({"method": denial.method, "reason": "unknown_method"}),
            DenialReason::RoleNotAllowed => json!({"method": denial.method, "reason": "role_not_allowed"}),
            DenialReason::Constraint { arg, .. } => {
                json!({"method": denial.method, "reason": "constraint", "argument": arg})
            }
        };
        IpcError::Authorization {
            message: denial.to_string(),
            details: Some(details),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionEnforcer {
    table: Arc<CapabilityTable>,
}

impl PermissionEnforcer {
    pub fn new(table: Arc<CapabilityTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<CapabilityTable> {
        &self.table
    }

    pub fn authorize(&self, caller: &ProcessRef, method: &str, params: &Params) -> Result<(), Denial> {
        let result = self.decide(caller, method, params);
        match &result {
            Ok(()) => tracing::debug!(
                target: "switchyard::audit",
                caller = %caller.id,
                role = %caller.role,
                method,
                decision = "allow",
                "Authorization decision"
            ),
            Err(denial) => tracing::warn!(
                target: "switchyard::audit",
                caller = %caller.id,
                role = %caller.role,
                method,
                decision = "deny",
                reason = %describe(&denial.reason),
                "Authorization decision"
            ),
        }
        result
    }

    fn decide(&self, caller: &ProcessRef, method: &str, params: &Params) -> Result<(), Denial> {
        let deny = |reason| Denial {
            caller: caller.to_string(),
            method: method.to_string(),
            reason,
        };

        let Some(grant) = self.table.get(method) else {
            return Err(deny(DenialReason::UnknownMethod));
        };
        if !grant.allowed_roles.contains(&caller.role) {
            return Err(deny(DenialReason::RoleNotAllowed));
        }
        for (arg, constraint) in &grant.constraints {
            if let Err(reason) = constraint.check(params.get(arg)) {
                return Err(deny(DenialReason::Constraint {
                    arg: arg.clone(),
                    reason,
                }));
            }
        }
        Ok(())
    }
}
