use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RuntimeError;

pub(crate) struct CommandOutput {
    pub exit_code: i32,
    pub log: String,
}

/// Run a runtime CLI command, capturing combined stdout+stderr line by line.
///
/// The subprocess is killed on timeout and on cancellation. Each output line
/// is mirrored to tracing so it shows up in the agent's own logs.
pub(crate) async fn run_command(
    binary: &str,
    args: &[String],
    envs: &HashMap<String, String>,
    cwd: Option<&Path>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<CommandOutput, RuntimeError> {
    debug!(binary, ?args, "running runtime command");

    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .envs(envs);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| RuntimeError::Spawn {
        binary: binary.to_string(),
        message: e.to_string(),
    })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    // Merge stdout and stderr by reading them concurrently into one buffer.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let tx1 = tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx1.send(line);
        }
    });

    let tx2 = tx.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx2.send(line);
        }
    });

    drop(tx); // close our own sender so rx finishes when both tasks finish

    let mut log = String::new();
    let collect = async {
        while let Some(line) = rx.recv().await {
            debug!(target: "outpost::runtime", "{}", line);
            log.push_str(&line);
            log.push('\n');
        }
    };

    let context = format!("{} {}", binary, args.first().map(String::as_str).unwrap_or(""));
    let timed_out = tokio::select! {
        res = tokio::time::timeout(timeout, collect) => res.is_err(),
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            stdout_task.await.ok();
            stderr_task.await.ok();
            return Err(RuntimeError::Cancelled);
        }
    };

    stdout_task.await.ok();
    stderr_task.await.ok();

    if timed_out {
        let _ = child.kill().await;
        return Err(RuntimeError::Timeout {
            context,
            seconds: timeout.as_secs(),
        });
    }

    let status = child.wait().await.map_err(|e| RuntimeError::Internal(format!(
        "wait {}: {}",
        binary, e
    )))?;

    let code = status.code().unwrap_or(-1);
    if code != 0 {
        warn!(binary, code, "runtime command exited non-zero");
    }
    Ok(CommandOutput { exit_code: code, log })
}
