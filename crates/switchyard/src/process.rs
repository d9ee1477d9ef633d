//! Process identity, roles and lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a supervised process.
///
/// Restricted to `[A-Za-z0-9._-]` because it is used verbatim as a socket
/// file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcessId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid process id {0:?}: expected non-empty [A-Za-z0-9._-]")]
pub struct InvalidProcessId(pub String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidProcessId> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(InvalidProcessId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProcessId {
    type Error = InvalidProcessId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProcessId> for String {
    fn from(id: ProcessId) -> Self {
        id.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed category assigned to a process at spawn, used for authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Controller,
    UiHost,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::UiHost => "ui-host",
            Self::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "controller" => Some(Self::Controller),
            "ui-host" => Some(Self::UiHost),
            "worker" => Some(Self::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-owning reference to a process: enough to address it and authorize it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessRef {
    pub id: ProcessId,
    pub role: Role,
}

impl ProcessRef {
    pub fn new(id: ProcessId, role: Role) -> Self {
        Self { id, role }
    }
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    /// Heartbeats overdue; still addressable.
    Degraded,
    Terminated,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Terminated => "terminated",
        }
    }
}

/// Why a process reached `Terminated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExitReason {
    Exited {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    HeartbeatTimeout,
    ChannelClosed,
    SpawnFailed {
        error: String,
    },
    Shutdown,
}

impl ExitReason {
    /// Clean exits and shutdowns are not failures and are never restarted.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Exited { code: Some(0) } | Self::Shutdown)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Exited { code: None } => f.write_str("killed by signal"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::ChannelClosed => f.write_str("channel closed"),
            Self::SpawnFailed { error } => write!(f, "spawn failed: {error}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_rejects_path_characters() {
        assert!(ProcessId::new("worker-1").is_ok());
        assert!(ProcessId::new("ui.host_2").is_ok());
        assert!(ProcessId::new("").is_err());
        assert!(ProcessId::new("..").is_err());
        assert!(ProcessId::new("a/b").is_err());
        assert!(ProcessId::new("worker 1").is_err());
    }

    #[test]
    fn process_id_deserialize_validates() {
        let ok: ProcessId = serde_json::from_str("\"worker-1\"").unwrap();
        assert_eq!(ok.as_str(), "worker-1");
        assert!(serde_json::from_str::<ProcessId>("\"../etc\"").is_err());
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::UiHost).unwrap(), "\"ui-host\"");
        for role in [Role::Controller, Role::UiHost, Role::Worker] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn exit_reason_failure_classification() {
        assert!(!ExitReason::Exited { code: Some(0) }.is_failure());
        assert!(!ExitReason::Shutdown.is_failure());
        assert!(ExitReason::Exited { code: Some(1) }.is_failure());
        assert!(ExitReason::Exited { code: None }.is_failure());
        assert!(ExitReason::HeartbeatTimeout.is_failure());
    }
}
