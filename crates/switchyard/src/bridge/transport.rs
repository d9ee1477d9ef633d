//! Socket addressing and connection setup.
//!
//! Each supervised process is reachable at `{runtime_dir}/{process_id}.sock`.
//! The supervisor binds the path before spawning and hands the child its
//! coordinates through environment variables; the child connects back.
//!
//! The runtime directory is created owner-only, and the supervisor only keeps
//! a connection whose peer credentials name the child it spawned. A spawned
//! program must therefore connect from its own process, exec'ing rather than
//! forking if it goes through a wrapper.

use std::fs::{DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};

use crate::process::{ProcessId, Role};

pub const ENV_SOCKET: &str = "SWITCHYARD_SOCKET";
pub const ENV_PROCESS_ID: &str = "SWITCHYARD_PROCESS_ID";
pub const ENV_ROLE: &str = "SWITCHYARD_ROLE";
pub const ENV_PARENT_ID: &str = "SWITCHYARD_PARENT_ID";
pub const ENV_HEARTBEAT_MS: &str = "SWITCHYARD_HEARTBEAT_MS";

pub fn socket_path(runtime_dir: &Path, id: &ProcessId) -> PathBuf {
    runtime_dir.join(format!("{id}.sock"))
}

/// Listening side of one process's socket. Removes the socket file on drop.
#[derive(Debug)]
pub struct Endpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl Endpoint {
    pub fn bind(runtime_dir: &Path, id: &ProcessId) -> io::Result<Self> {
        prepare_runtime_dir(runtime_dir)?;
        let path = socket_path(runtime_dir, id);

        // Stale file from a previous incarnation.
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(process_id = %id, path = %path.display(), "Bound process socket");
        Ok(Self { path, listener })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Accept the first connection made by process `pid`. Connections from
    /// anyone else are logged and closed.
    pub async fn accept_from(&self, pid: u32) -> io::Result<UnixStream> {
        loop {
            let stream = self.accept().await?;
            let cred = match stream.peer_cred() {
                Ok(cred) => cred,
                Err(e) => {
                    tracing::warn!(
                        target: "switchyard::audit",
                        path = %self.path.display(),
                        error = %e,
                        "Rejecting connection without peer credentials"
                    );
                    continue;
                }
            };
            if cred.pid().and_then(|p| u32::try_from(p).ok()) == Some(pid) {
                return Ok(stream);
            }
            tracing::warn!(
                target: "switchyard::audit",
                path = %self.path.display(),
                expected_pid = pid,
                peer_pid = ?cred.pid(),
                peer_uid = cred.uid(),
                "Rejecting connection from unexpected process"
            );
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path.display(), "Removed process socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove process socket"),
        }
    }
}

/// Create `dir` owner-only, or tighten an existing one this user owns.
fn prepare_runtime_dir(dir: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    let meta = std::fs::metadata(dir)?;
    let uid = nix::unistd::getuid().as_raw();
    if meta.uid() != uid {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "runtime directory {} belongs to uid {}, not {uid}",
                dir.display(),
                meta.uid()
            ),
        ));
    }
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        tracing::warn!(
            target: "switchyard::audit",
            path = %dir.display(),
            mode = format_args!("{mode:o}"),
            "Restricting runtime directory to its owner"
        );
        std::fs::set_permissions(dir, Permissions::from_mode(0o700))?;
    }
    Ok(())
}

pub async fn connect(path: &Path) -> io::Result<UnixStream> {
    tracing::trace!(path = %path.display(), "Connecting to socket");
    UnixStream::connect(path).await
}

#[derive(Debug, thiserror::Error)]
pub enum TransportEnvError {
    #[error("{0} is not set; was this process started by a supervisor?")]
    Missing(&'static str),
    #[error("{var} has an invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Coordinates handed from a supervisor to the child it spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTransportInfo {
    pub socket: PathBuf,
    pub id: ProcessId,
    pub role: Role,
    pub parent: ProcessId,
    pub heartbeat_interval: Duration,
}

impl ChildTransportInfo {
    pub fn from_env() -> Result<Self, TransportEnvError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, TransportEnvError> {
        let get = |var: &'static str| lookup(var).ok_or(TransportEnvError::Missing(var));
        let invalid = |var: &'static str, value: String| TransportEnvError::Invalid { var, value };

        let socket = PathBuf::from(get(ENV_SOCKET)?);

        let id = get(ENV_PROCESS_ID)?;
        let id = ProcessId::new(id).map_err(|e| invalid(ENV_PROCESS_ID, e.0))?;

        let role = get(ENV_ROLE)?;
        let role = Role::parse(&role).ok_or_else(|| invalid(ENV_ROLE, role.clone()))?;

        let parent = get(ENV_PARENT_ID)?;
        let parent = ProcessId::new(parent).map_err(|e| invalid(ENV_PARENT_ID, e.0))?;

        let heartbeat = get(ENV_HEARTBEAT_MS)?;
        let heartbeat_ms: u64 = heartbeat
            .parse()
            .map_err(|_| invalid(ENV_HEARTBEAT_MS, heartbeat.clone()))?;
        if heartbeat_ms == 0 {
            return Err(invalid(ENV_HEARTBEAT_MS, heartbeat));
        }

        Ok(Self {
            socket,
            id,
            role,
            parent,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
        })
    }

    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_SOCKET, self.socket.display().to_string()),
            (ENV_PROCESS_ID, self.id.to_string()),
            (ENV_ROLE, self.role.as_str().to_string()),
            (ENV_PARENT_ID, self.parent.to_string()),
            (
                ENV_HEARTBEAT_MS,
                self.heartbeat_interval.as_millis().to_string(),
            ),
        ]
    }
}
