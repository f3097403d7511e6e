//! Worker subprocess management.
//!
//! Spawns the worker binary, tails its stderr into a ring buffer so the
//! last real error survives for user-facing messages, and watches the
//! health endpoint with a stall timer that resets whenever load progress
//! advances.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::supervisor::LoadTransport;
use super::{HealthResponse, LoadError, LoadRequest, LoadResponse, WorkerStatus};

/// How many stderr lines to retain.
const STDERR_TAIL_LINES: usize = 64;

/// Health poll cadence while waiting for readiness.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    saw_unknown_model: bool,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if line.contains("unknown model") {
            self.saw_unknown_model = true;
        }
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn last_error(&self) -> String {
        self.lines
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "worker produced no output".to_string())
    }
}

/// A running worker subprocess and its loopback client.
pub struct WorkerProcess {
    child: Child,
    port: u16,
    client: reqwest::Client,
    stderr: Arc<Mutex<StderrTail>>,
}

impl WorkerProcess {
    /// Launch the worker binary serving `model_path` on a loopback port.
    pub fn spawn(binary: &str, model_path: &str, port: u16) -> Result<Self, LoadError> {
        let mut child = Command::new(binary)
            .arg("--model")
            .arg(model_path)
            .arg("--listen")
            .arg(format!("127.0.0.1:{port}"))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = Arc::new(Mutex::new(StderrTail::default()));
        if let Some(pipe) = child.stderr.take() {
            let tail = stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "worker", "{line}");
                    tail.lock().await.push(line);
                }
            });
        }

        info!(binary, model = model_path, port, "spawned worker");
        Ok(Self {
            child,
            port,
            client: reqwest::Client::new(),
            stderr,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    /// The most recent non-empty stderr line.
    pub async fn last_error(&self) -> String {
        self.stderr.lock().await.last_error()
    }

    /// Check the subprocess is still alive, classifying its death.
    pub async fn check_alive(&mut self) -> Result<(), LoadError> {
        match self.child.try_wait()? {
            None => Ok(()),
            Some(status) => {
                let tail = self.stderr.lock().await;
                if tail.saw_unknown_model {
                    return Err(LoadError::UnknownModel);
                }
                warn!(%status, "worker exited");
                Err(LoadError::WorkerTerminated(tail.last_error()))
            }
        }
    }

    pub async fn health(&self) -> Result<HealthResponse, LoadError> {
        let resp = self
            .client
            .get(self.url("/health"))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))
    }

    /// Block until the worker reports `ready`.
    ///
    /// The timeout is a stall timer, not a deadline: every time `progress`
    /// advances the clock restarts, so a slow disk never kills a load that
    /// is still moving.
    pub async fn wait_ready(&mut self, stall_timeout: Duration) -> Result<(), LoadError> {
        let mut last_progress = -1.0f32;
        let mut stalled_since = Instant::now();

        loop {
            self.check_alive().await?;

            match self.health().await {
                Ok(h) => {
                    if h.status == WorkerStatus::Ready {
                        return Ok(());
                    }
                    if h.status == WorkerStatus::Error {
                        return Err(LoadError::WorkerTerminated(self.last_error().await));
                    }
                    if h.progress > last_progress {
                        last_progress = h.progress;
                        stalled_since = Instant::now();
                    }
                }
                // Not listening yet counts against the stall timer.
                Err(_) => {}
            }

            if stalled_since.elapsed() > stall_timeout {
                return Err(LoadError::Stalled {
                    stalled_secs: stall_timeout.as_secs(),
                });
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Terminate the subprocess.
    pub async fn shutdown(mut self) {
        let _ = self.child.kill().await;
    }
}

#[async_trait]
impl LoadTransport for WorkerProcess {
    async fn load(&self, req: &LoadRequest) -> Result<LoadResponse, LoadError> {
        let resp = self
            .client
            .post(self.url("/load"))
            .json(req)
            .send()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))
    }
}
