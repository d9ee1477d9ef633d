//! switchyard: multi-process IPC core for desktop applications.

mod enforcer;
mod runtime;
mod validation;

pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod router;
pub mod shm;
pub mod supervisor;

pub use capability::{CapabilityTable, Constraint, Grant};
pub use config::{Config, InputLimits, RateLimit, RestartPolicy, RouterConfig, SupervisorConfig};
pub use enforcer::{Denial, DenialReason, PermissionEnforcer};
pub use error::{ErrorKind, ErrorPayload, IpcError};
pub use logging::init_tracing;
pub use process::{ExitReason, ProcessId, ProcessRef, ProcessState, Role};
pub use router::{
    CallContext, CallOptions, HandlerRegistry, InboundPayload, PeerNotice, Reply, Router, Target,
};
pub use runtime::{Runtime, RuntimeError};
pub use shm::{BufferPool, BufferView, Payload};
pub use supervisor::{
    ProcessSnapshot, ProcessSpawner, ProcessSpec, SpawnError, Supervisor, SupervisorEvent,
};
pub use validation::LimitViolation;
