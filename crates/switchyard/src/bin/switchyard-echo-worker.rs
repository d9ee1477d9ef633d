//! Reference worker: connects back to the supervisor that started it and
//! serves a handful of `worker.*` methods.
//!
//! Run through a `Supervisor`; it reads its coordinates from the
//! `SWITCHYARD_*` environment variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use switchyard::{
    CallContext, CapabilityTable, Config, HandlerRegistry, IpcError, Payload, Role, Runtime,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunTask {
    #[serde(default)]
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Hang {
    ms: u64,
}

#[derive(Debug, Deserialize)]
struct Upload {
    size: usize,
    #[serde(default = "default_content_type")]
    content_type: String,
}

#[derive(Debug, Deserialize)]
struct Exit {
    #[serde(default)]
    code: i32,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Digest {
    len: usize,
    crc32: u32,
    content_type: String,
    shared: bool,
}

fn grants() -> anyhow::Result<CapabilityTable> {
    if let Ok(path) = std::env::var("SWITCHYARD_GRANTS") {
        return CapabilityTable::from_path(&path)
            .with_context(|| format!("failed to load grants from {path}"));
    }
    Ok(CapabilityTable::new()
        .grant("worker.echo", [Role::Controller])
        .grant("worker.runTask", [Role::Controller])
        .grant("worker.digest", [Role::Controller])
        .grant("worker.hang", [Role::Controller])
        .grant("worker.upload", [Role::Controller])
        .grant("worker.exit", [Role::Controller]))
}

/// Deterministic bytes so the controller can check what it got.
fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .handle("worker.echo", |ctx: CallContext, params: Value| async move {
            if let Some(payload) = ctx.take_payload() {
                ctx.reply_with(payload.into_payload()?);
            }
            Ok::<_, anyhow::Error>(params)
        })
        .handle("worker.runTask", |ctx: CallContext, task: RunTask| async move {
            let cancelled = ctx.cancellation().clone();
            match task.duration_ms {
                Some(ms) => {
                    tokio::select! {
                        _ = cancelled.cancelled() => return Err(IpcError::Cancelled.into()),
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                }
                None => cancelled.cancelled().await,
            }
            tracing::info!(correlation_id = %ctx.id, "Task finished");
            Ok::<_, anyhow::Error>(serde_json::json!({ "completed": true }))
        })
        .handle("worker.digest", |ctx: CallContext, _params: Value| async move {
            let payload = ctx
                .take_payload()
                .ok_or_else(|| IpcError::protocol("worker.digest needs a payload"))?;
            let shared = payload.is_shared();
            let payload = payload.into_payload()?;
            Ok::<_, anyhow::Error>(Digest {
                len: payload.len(),
                crc32: crc32fast::hash(&payload.bytes),
                content_type: payload.content_type,
                shared,
            })
        })
        .handle("worker.hang", |_ctx: CallContext, hang: Hang| async move {
            tracing::warn!(ms = hang.ms, "Blocking the event loop");
            // Blocks the whole current-thread runtime, heartbeats included.
            std::thread::sleep(Duration::from_millis(hang.ms));
            Ok::<_, anyhow::Error>(serde_json::json!({ "sleptMs": hang.ms }))
        })
        .handle("worker.upload", |ctx: CallContext, upload: Upload| async move {
            let bytes = pattern(upload.size);
            let crc32 = crc32fast::hash(&bytes);
            ctx.reply_with(Payload::new(upload.content_type, bytes));
            Ok::<_, anyhow::Error>(serde_json::json!({ "size": upload.size, "crc32": crc32 }))
        })
        .handle("worker.exit", |_ctx: CallContext, exit: Exit| async move {
            tracing::info!(code = exit.code, "Exit requested");
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::process::exit(exit.code);
            });
            Ok::<_, anyhow::Error>(serde_json::json!({ "exiting": exit.code }))
        })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    switchyard::init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let runtime = Runtime::connect_child(config, Arc::new(grants()?), handlers())
        .await
        .context("failed to connect to parent")?;
    tracing::info!(process_id = %runtime.local().id, "Echo worker ready");

    runtime.parent_closed().await;
    tracing::info!("Parent went away; exiting");
    runtime.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_is_stable() {
        assert_eq!(&pattern(4), &[0, 1, 2, 3]);
        assert_eq!(pattern(300)[251], 0);
    }

    #[test]
    fn default_grants_only_admit_the_controller() {
        let table = grants().unwrap();
        let grant = table.get("worker.echo").unwrap();
        assert!(grant.allowed_roles.contains(&Role::Controller));
        assert!(!grant.allowed_roles.contains(&Role::UiHost));
        assert_eq!(table.len(), 6);
    }
}
