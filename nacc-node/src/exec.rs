//! execute-command: allow-listed subprocess execution.
//!
//! The child sees an empty environment apart from the operator-configured
//! PATH and the request's overrides. Output capture is bounded at 1 MiB per
//! stream. Overruns get a terminate signal, a 5 second grace period, then a
//! kill; the child is always reaped. Non-zero exit codes are returned as
//! data, never as errors.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nacc_protocol::{
    CommandResult, ErrorKind, EXIT_CODE_SENTINEL, ExecuteCommandRequest, KILL_GRACE_SECS,
    MAX_COMMAND_TIMEOUT_SECS, OUTPUT_CAPTURE_LIMIT, ToolError, TRUNCATION_MARKER,
    DEFAULT_COMMAND_TIMEOUT_SECS,
};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::context::RootContext;
use crate::paths::resolve_within_root;

/// Check `argv[0]` against the allow-list. Exact basename match; a
/// fully-qualified path passes only when its basename is listed.
pub fn check_allowed(ctx: &RootContext, argv0: &str) -> Result<(), ToolError> {
    let basename = Path::new(argv0)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(argv0);
    if ctx.allowed_commands.iter().any(|cmd| cmd == basename) {
        Ok(())
    } else {
        Err(ToolError::new(
            ErrorKind::CommandNotAllowed,
            format!("command '{basename}' is not on this node's allow-list"),
        ))
    }
}

pub async fn execute_command(
    ctx: &RootContext,
    req: &ExecuteCommandRequest,
) -> Result<CommandResult, ToolError> {
    let argv0 = req
        .argv
        .first()
        .ok_or_else(|| ToolError::invalid("argv must be non-empty"))?;
    check_allowed(ctx, argv0)?;

    let cwd = match &req.cwd {
        Some(rel) => {
            let resolved = resolve_within_root(&ctx.root_dir, rel)?;
            if !resolved.is_dir() {
                return Err(ToolError::invalid(format!("cwd is not a directory: {rel}")));
            }
            resolved
        }
        None => ctx.root_dir.clone(),
    };

    let timeout = Duration::from_secs(
        req.timeout_seconds
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS)
            .clamp(1, MAX_COMMAND_TIMEOUT_SECS),
    );

    let mut command = Command::new(argv0);
    command
        .args(&req.argv[1..])
        .current_dir(&cwd)
        .env_clear()
        .env("PATH", &ctx.path_env)
        .envs(&req.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|err| ToolError::internal(format!("failed to spawn '{argv0}': {err}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(capture_stream(stdout));
    let stderr_task = tokio::spawn(capture_stream(stderr));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (exit_code_of(status), false),
        Ok(Err(err)) => {
            return Err(ToolError::internal(format!("wait failed: {err}")));
        }
        Err(_) => {
            terminate_then_kill(&mut child).await;
            (EXIT_CODE_SENTINEL, true)
        }
    };

    let duration = started.elapsed().as_secs_f64();
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(CommandResult {
        node_id: ctx.node_id.clone(),
        stdout,
        stderr,
        exit_code,
        duration_seconds: duration,
        error: timed_out.then(|| format!("command timed out after {}s", timeout.as_secs())),
    })
}

/// Read a child stream into a bounded buffer, marking truncation.
async fn capture_stream(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];
    let mut truncated = false;
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < OUTPUT_CAPTURE_LIMIT {
                    let room = OUTPUT_CAPTURE_LIMIT - buf.len();
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                    if n > room {
                        truncated = true;
                    }
                } else {
                    // Keep draining so the child never blocks on a full pipe.
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_CODE_SENTINEL)
}

/// Terminate, give the child `KILL_GRACE_SECS` to exit, then kill. Always
/// reaps.
async fn terminate_then_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid came from a child we own and have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let grace = Duration::from_secs(KILL_GRACE_SECS);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
