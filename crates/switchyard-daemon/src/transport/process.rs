//! OS-process transport over stdin/stdout.
//!
//! Spawns a worker with piped stdio, keeps a single writer task on stdin,
//! forwards stdout as raw chunks, logs stderr, and reports the exit status
//! once stdout has drained.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{Connection, ExitInfo, LaunchSpec, Launcher, Transport, TransportError, TransportEvent};

/// Bound on queued, not yet written frames per worker.
const STDIN_CHANNEL_CAPACITY: usize = 64;

/// Bound on undelivered output chunks per worker.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for stdout to drain after the process exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Launches workers as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    #[allow(clippy::too_many_lines)]
    async fn launch(&self, agent_id: &str, spec: &LaunchSpec) -> Result<Connection, TransportError> {
        if spec.command.trim().is_empty() {
            return Err(TransportError::SpawnFailed {
                reason: "empty command".to_string(),
            });
        }

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_directory {
            if !dir.is_dir() {
                return Err(TransportError::SpawnFailed {
                    reason: format!("working directory {} does not exist", dir.display()),
                });
            }
            cmd.current_dir(dir);
        }

        info!(
            agent_id,
            command = %spec.command,
            args = ?spec.args,
            "Spawning worker process"
        );
        let mut child = cmd.spawn().map_err(|e| TransportError::SpawnFailed {
            reason: format!("{}: {e}", spec.command),
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed {
                reason: "Failed to capture stdin".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        // Single writer: every frame for this worker goes through this task.
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(STDIN_CHANNEL_CAPACITY);
        let writer_id = agent_id.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(frame.as_bytes()).await {
                    error!(agent_id = %writer_id, "Failed to write to stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!(agent_id = %writer_id, "Failed to flush stdin: {}", e);
                    break;
                }
            }
            debug!(agent_id = %writer_id, "stdin writer finished");
        });

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader_id = agent_id.to_string();
        let reader_tx = event_tx.clone();
        let reader = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if reader_tx
                            .send(TransportEvent::Data(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            warn!(agent_id = %reader_id, "event channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(agent_id = %reader_id, error = %e, "stdout read failed");
                        break;
                    }
                }
            }
            debug!(agent_id = %reader_id, "stdout reader finished");
        });

        if let Some(stderr) = child.stderr.take() {
            let stderr_id = agent_id.to_string();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(agent_id = %stderr_id, "stderr: {}", line);
                }
                debug!(agent_id = %stderr_id, "stderr reader finished");
            });
        }

        // Exit watcher owns the child so it can both reap and kill it.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let watcher_id = agent_id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(agent_id = %watcher_id, error = %e, "Failed to kill worker");
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => exit_info(status),
                Err(e) => {
                    warn!(agent_id = %watcher_id, error = %e, "Error waiting for worker");
                    ExitInfo::default()
                }
            };

            if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err() {
                warn!(agent_id = %watcher_id, "stdout did not drain after exit");
            }

            info!(
                agent_id = %watcher_id,
                code = ?info.code,
                signal = ?info.signal,
                "Worker process exited"
            );
            let _ = exited_tx.send(true);
            let _ = event_tx.send(TransportEvent::Exited(info)).await;
        });

        let transport = ProcessTransport {
            agent_id: agent_id.to_string(),
            pid,
            stdin_tx,
            kill_tx: Mutex::new(Some(kill_tx)),
            exited: exited_rx,
        };

        Ok(Connection {
            transport: std::sync::Arc::new(transport),
            events: event_rx,
        })
    }
}

/// Handle to a spawned worker's stdin and lifecycle.
pub struct ProcessTransport {
    agent_id: String,
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl ProcessTransport {
    async fn wait_exit(&self, within: Duration) -> bool {
        let mut exited = self.exited.clone();
        matches!(
            tokio::time::timeout(within, exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }

    fn force_kill(&self) {
        let sender = self
            .kill_tx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    #[cfg(unix)]
    fn terminate_gracefully(&self) {
        if let Some(pid) = self.pid {
            let Ok(raw_pid) = i32::try_from(pid) else {
                return;
            };
            // SAFETY: pid is a valid process ID obtained from our own Child handle.
            // kill(2) with SIGTERM is safe to call on any owned subprocess.
            #[allow(unsafe_code)]
            let ret = unsafe { libc::kill(raw_pid, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(agent_id = %self.agent_id, pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate_gracefully(&self) {
        self.force_kill();
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.stdin_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn shutdown(&self, grace: Duration) {
        if *self.exited.borrow() {
            return;
        }

        debug!(agent_id = %self.agent_id, pid = ?self.pid, "Terminating worker");
        self.terminate_gracefully();

        if self.wait_exit(grace).await {
            info!(agent_id = %self.agent_id, "Worker exited gracefully");
            return;
        }

        warn!(agent_id = %self.agent_id, "Timeout waiting for graceful shutdown, killing");
        self.force_kill();
        if !self.wait_exit(grace).await {
            error!(agent_id = %self.agent_id, "Worker did not exit after kill");
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(unix)]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}
