//! The command socket (spec §6, §10): a Unix domain socket line-protocol
//! server. One connection, one line in, one line out, newline-terminated —
//! grounded on the reference crate's CLI command dispatch, generalized from
//! one-shot argument parsing to a persistent accept loop. Every handler
//! takes the same `Scheduler` handle the main loop runs against; there is
//! no global mutable state here to race against it.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};
use zuul_types::event::ManagementEvent;
use zuul_types::TenantName;

use crate::scheduler::Scheduler;

const RECONFIGURE_WAIT: std::time::Duration = std::time::Duration::from_secs(300);

/// Binds the configured socket path and serves commands until
/// [`Scheduler::stop`] flips the stop flag. A stale socket file left behind
/// by a crashed prior process is removed before binding, matching the
/// reference crate's own "clean up our own leftover state before starting"
/// posture around its state directory.
pub async fn serve(scheduler: Arc<Scheduler>) -> Result<()> {
    let path = &scheduler.config.command_socket.path;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating command socket directory {}", parent.display()))?;
    }
    remove_stale_socket(path).await?;

    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding command socket at {}", path.display()))?;
    info!(path = %path.display(), "command socket listening");

    loop {
        if scheduler.should_stop() {
            return Ok(());
        }

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = scheduler.wake.notified() => continue,
        };

        match accepted {
            Ok((stream, _)) => {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(scheduler, stream).await {
                        warn!(error = %e, "command socket connection failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "command socket accept failed"),
        }
    }
}

async fn remove_stale_socket(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing stale command socket at {}", path.display())),
    }
}

async fn handle_connection(scheduler: Arc<Scheduler>, stream: UnixStream) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };

    let response = match dispatch(&scheduler, line.trim()).await {
        Ok(()) => "OK".to_string(),
        Err(e) => format!("ERROR: {e}"),
    };

    writer.write_all(response.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.shutdown().await?;
    Ok(())
}

/// Parses and executes one command line (spec §6: `full-reconfigure`,
/// `smart-reconfigure`, `tenant-reconfigure <name>`, `stop`, `repl`,
/// `norepl`). Reconfigure commands block until the scheduler's own
/// management-queue consumer has processed them, matching the source CLI's
/// "block until acknowledged" contract; `stop` does not wait on itself.
async fn dispatch(scheduler: &Arc<Scheduler>, line: &str) -> Result<()> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("");

    match command {
        "full-reconfigure" => {
            let traceback = scheduler
                .global_management_queue()
                .enqueue_and_wait(&ManagementEvent::FullReconfigure, RECONFIGURE_WAIT)
                .await?;
            scheduler.wake_main_loop();
            fail_on_traceback(traceback)
        }
        "smart-reconfigure" => {
            let traceback = scheduler
                .global_management_queue()
                .enqueue_and_wait(&ManagementEvent::SmartReconfigure, RECONFIGURE_WAIT)
                .await?;
            scheduler.wake_main_loop();
            fail_on_traceback(traceback)
        }
        "tenant-reconfigure" => {
            let tenant = parts
                .next()
                .context("tenant-reconfigure requires a tenant name")?;
            let traceback = scheduler
                .global_management_queue()
                .enqueue_and_wait(
                    &ManagementEvent::TenantReconfigure {
                        tenant: TenantName::from(tenant),
                        project_branches: Vec::new(),
                    },
                    RECONFIGURE_WAIT,
                )
                .await?;
            scheduler.wake_main_loop();
            fail_on_traceback(traceback)
        }
        "stop" => {
            scheduler.stop().await?;
            Ok(())
        }
        "repl" => {
            scheduler.repl_enabled.store(true, Ordering::SeqCst);
            Ok(())
        }
        "norepl" => {
            scheduler.repl_enabled.store(false, Ordering::SeqCst);
            Ok(())
        }
        "" => anyhow::bail!("empty command"),
        other => anyhow::bail!("unknown command: {other}"),
    }
}

fn fail_on_traceback(traceback: String) -> Result<()> {
    if traceback.is_empty() {
        Ok(())
    } else {
        anyhow::bail!(traceback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use zuul_manager::{AlwaysMergeable, MemoryExecutorClient};
    use zuul_zk::MemoryCoordinationClient;

    use crate::config::SchedulerConfig;
    use crate::loader::StaticTenantConfigLoader;

    async fn running_scheduler(path: std::path::PathBuf) -> Arc<Scheduler> {
        let client: Arc<dyn zuul_zk::CoordinationClient> = Arc::new(MemoryCoordinationClient::new());
        let mut config = SchedulerConfig::default();
        config.command_socket.path = path;
        let scheduler = Arc::new(Scheduler::new(
            client,
            config,
            Arc::new(MemoryExecutorClient::new()),
            Arc::new(AlwaysMergeable),
            Arc::new(StaticTenantConfigLoader::new()),
        ));
        scheduler.register_component().await.unwrap();
        scheduler.global_management_queue().ensure_root().await.unwrap();
        let s = scheduler.clone();
        tokio::spawn(async move {
            let _ = serve(s).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        scheduler
    }

    async fn send(path: &std::path::Path, line: &str) -> String {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        buf.trim().to_string()
    }

    #[tokio::test]
    async fn full_reconfigure_round_trips_ok() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("scheduler.socket");
        let scheduler = running_scheduler(socket_path.clone()).await;

        // Nothing drains the global management queue in this test, so the
        // wait would time out; drain it manually before asserting on the
        // response side by racing the send against a manual drain.
        let draining = scheduler.clone();
        tokio::spawn(async move {
            loop {
                if let Ok(events) = draining.global_management_queue().poll_merged().await {
                    for event in events {
                        draining.global_management_queue().respond(&event.ack_ref, "").await.ok();
                        draining.global_management_queue().ack(&event.ack_ref).await.ok();
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        let response = send(&socket_path, "full-reconfigure").await;
        assert_eq!(response, "OK");
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("scheduler.socket");
        running_scheduler(socket_path.clone()).await;

        let response = send(&socket_path, "not-a-real-command").await;
        assert!(response.starts_with("ERROR:"));
    }

    #[tokio::test]
    async fn tenant_reconfigure_without_name_is_an_error() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("scheduler.socket");
        running_scheduler(socket_path.clone()).await;

        let response = send(&socket_path, "tenant-reconfigure").await;
        assert!(response.starts_with("ERROR:"));
    }
}
