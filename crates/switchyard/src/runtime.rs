//! Per-process context: everything one process needs to take part in IPC,
//! built once at startup.

use std::sync::Arc;

use crate::bridge::channel::Channel;
use crate::bridge::transport::{ChildTransportInfo, TransportEnvError};
use crate::capability::CapabilityTable;
use crate::config::{Config, ConfigError};
use crate::error::IpcError;
use crate::process::{ProcessId, ProcessRef, Role};
use crate::router::{HandlerRegistry, RegistrationError, Router};
use crate::shm::BufferPool;
use crate::supervisor::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Environment(#[from] TransportEnvError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("failed to reach parent: {0}")]
    Connect(#[from] IpcError),
}

/// Owns the buffer pool, the router and, for controllers, the supervisor.
#[derive(Debug)]
pub struct Runtime {
    local: ProcessRef,
    grants: Arc<CapabilityTable>,
    router: Router,
    supervisor: Option<Supervisor>,
    parent: Option<Channel>,
}

impl Runtime {
    /// Build the root process of a tree. It spawns children through
    /// [`Runtime::supervisor`].
    pub fn controller(
        id: ProcessId,
        config: Config,
        grants: Arc<CapabilityTable>,
        handlers: HandlerRegistry,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let local = ProcessRef::new(id, Role::Controller);
        let buffers = BufferPool::new(local.id.clone());
        let router = Router::new(
            local.clone(),
            Arc::clone(&grants),
            buffers,
            config.router,
            handlers,
        )?;
        let supervisor = Supervisor::new(config.supervisor, router.clone());
        tracing::info!(process_id = %local.id, "Controller runtime started");
        Ok(Self {
            local,
            grants,
            router,
            supervisor: Some(supervisor),
            parent: None,
        })
    }

    /// Connect a supervised child to its parent using the coordinates the
    /// supervisor left in the environment.
    pub async fn connect_child(
        config: Config,
        grants: Arc<CapabilityTable>,
        handlers: HandlerRegistry,
    ) -> Result<Self, RuntimeError> {
        let info = ChildTransportInfo::from_env()?;
        Self::connect_child_with(info, config, grants, handlers).await
    }

    pub async fn connect_child_with(
        info: ChildTransportInfo,
        mut config: Config,
        grants: Arc<CapabilityTable>,
        handlers: HandlerRegistry,
    ) -> Result<Self, RuntimeError> {
        config.router.heartbeat_interval = Some(info.heartbeat_interval);
        config.validate()?;

        let local = ProcessRef::new(info.id.clone(), info.role);
        let parent = ProcessRef::new(info.parent.clone(), Role::Controller);
        let buffers = BufferPool::new(local.id.clone());
        let router = Router::new(
            local.clone(),
            Arc::clone(&grants),
            buffers,
            config.router.clone(),
            handlers,
        )?;

        let channel = Channel::with_limits(
            local.clone(),
            parent.clone(),
            config.router.max_frame_length,
            config.router.outbound_queue,
        );
        if let Err(e) = channel.open(&info.socket).await {
            router.shutdown();
            return Err(e.into());
        }
        router.attach(parent, channel.clone());
        tracing::info!(
            process_id = %local.id,
            role = %local.role,
            parent = %info.parent,
            "Connected to parent"
        );

        Ok(Self {
            local,
            grants,
            router,
            supervisor: None,
            parent: Some(channel),
        })
    }

    pub fn local(&self) -> &ProcessRef {
        &self.local
    }

    pub fn grants(&self) -> &Arc<CapabilityTable> {
        &self.grants
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        self.router.buffers()
    }

    /// Present on controllers only.
    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    /// Resolves once the connection to the parent is gone. Controllers have
    /// no parent and resolve immediately.
    pub async fn parent_closed(&self) {
        if let Some(parent) = &self.parent {
            parent.closed().await;
        }
    }

    /// Stop all children, then every peer connection.
    pub async fn shutdown(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
        self.router.shutdown();
        tracing::info!(process_id = %self.local.id, "Runtime shut down");
    }
}
