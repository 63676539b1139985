//! Local-subprocess backend: a bounded pool of long-lived model processes.
//!
//! Each worker is one child running the configured command and speaking
//! line-delimited JSON: one `{"id","prompt","context"}` request line in, one
//! `{"id","completion"}` (or `{"id","error"}`) line out. Requests carry a
//! correlation id; stray lines with other ids are skipped. A worker that
//! breaches the per-call deadline is killed and replaced lazily — the pool
//! spawns a fresh child the next time a slot is empty.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::{BackendContext, BackendError, LlmBackend};

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    id: &'a str,
    prompt: &'a str,
    context: &'a BackendContext,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    #[serde(default)]
    completion: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    async fn spawn(command: &[String], environment: &[(String, String)]) -> Result<Self, BackendError> {
        let program = command
            .first()
            .ok_or_else(|| BackendError::Config("subprocess backend requires a command".into()))?;
        let mut builder = Command::new(program);
        builder
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in environment {
            builder.env(key, value);
        }
        let mut child = builder
            .spawn()
            .map_err(|err| BackendError::Unavailable(format!("spawn '{program}': {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Unavailable("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Unavailable("child stdout unavailable".into()))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// One request/response exchange. Skips lines for other correlation ids.
    async fn exchange(
        &mut self,
        id: &str,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError> {
        let mut line = serde_json::to_vec(&WireRequest { id, prompt, context })
            .map_err(|err| BackendError::Malformed(err.to_string()))?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .map_err(|err| BackendError::Unavailable(format!("child write: {err}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| BackendError::Unavailable(format!("child flush: {err}")))?;

        loop {
            let next = self
                .stdout
                .next_line()
                .await
                .map_err(|err| BackendError::Unavailable(format!("child read: {err}")))?;
            let Some(raw) = next else {
                return Err(BackendError::Unavailable("child closed stdout".into()));
            };
            let response: WireResponse = serde_json::from_str(&raw)
                .map_err(|err| BackendError::Malformed(format!("bad child line: {err}")))?;
            if response.id != id {
                continue;
            }
            if let Some(error) = response.error {
                return Err(BackendError::Unavailable(error));
            }
            return response.completion.ok_or_else(|| {
                BackendError::Malformed("child response missing 'completion'".into())
            });
        }
    }

    async fn kill(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

#[derive(Debug)]
pub struct SubprocessBackend {
    command: Vec<String>,
    environment: Vec<(String, String)>,
    timeout: Duration,
    /// Idle workers; capacity is enforced by `slots`.
    idle: Mutex<Vec<Worker>>,
    slots: Semaphore,
}

impl SubprocessBackend {
    pub fn new(
        command: Vec<String>,
        environment: Vec<(String, String)>,
        timeout: Duration,
        pool_size: usize,
    ) -> Result<Self, BackendError> {
        if command.is_empty() {
            return Err(BackendError::Config(
                "subprocess backend requires a command".to_string(),
            ));
        }
        Ok(Self {
            command,
            environment,
            timeout,
            idle: Mutex::new(Vec::new()),
            slots: Semaphore::new(pool_size.max(1)),
        })
    }

    async fn checkout(&self) -> Result<Worker, BackendError> {
        if let Some(worker) = self.idle.lock().await.pop() {
            return Ok(worker);
        }
        Worker::spawn(&self.command, &self.environment).await
    }
}

#[async_trait]
impl LlmBackend for SubprocessBackend {
    fn kind(&self) -> &'static str {
        "subprocess"
    }

    async fn complete(
        &self,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable("pool closed".into()))?;
        let mut worker = self.checkout().await?;
        let id = Uuid::new_v4().to_string();

        match tokio::time::timeout(self.timeout, worker.exchange(&id, prompt, context)).await {
            Ok(Ok(completion)) => {
                self.idle.lock().await.push(worker);
                Ok(completion)
            }
            Ok(Err(err)) => {
                // Protocol or transport fault: retire the worker.
                worker.kill().await;
                Err(err)
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "subprocess worker overran; replacing");
                worker.kill().await;
                Err(BackendError::Timeout(self.timeout))
            }
        }
    }
}
