//! Lead process lifecycle: spawn, liveness probe, signal escalation.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::errors::SupervisorError;
use crate::team::TeamConfig;

/// Polling interval while waiting for a signaled process to exit.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spawn one lead cycle.
///
/// The prompt goes in on stdin rather than argv to dodge argument length
/// limits; stdout carries stream-json, stderr is piped so the log store can
/// capture it.
pub async fn spawn_lead(
    claude_cmd: &str,
    team: &TeamConfig,
    cycle_turns: u32,
    prompt: &str,
) -> Result<Child, SupervisorError> {
    let mut command = Command::new(claude_cmd);
    command
        .arg("--print")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--dangerously-skip-permissions")
        .arg("--max-turns")
        .arg(cycle_turns.to_string());
    if let Some(model) = &team.model {
        command.arg("--model").arg(model);
    }

    let mut child = command
        .current_dir(&team.project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(SupervisorError::SpawnFailed)?;

    if let Some(mut stdin) = child.stdin.take() {
        // A lead that exits before consuming the prompt closes the pipe;
        // that surfaces through the exit path, not here.
        let _ = stdin.write_all(prompt.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    Ok(child)
}

/// The briefing delivered to each cycle. Points the agent at the board API
/// on the local port; everything else it discovers from the board itself.
pub fn build_cycle_prompt(team: &TeamConfig, port: u16) -> String {
    format!(
        "You are the lead agent for the \"{name}\" team working in {dir}.\n\
         The shared task board is served at http://127.0.0.1:{port}/api.\n\
         Fetch the board with GET /api/board, pick up the highest-priority\n\
         ready work, and keep the board current as you go: move tasks between\n\
         columns with PATCH /api/tasks/:id, leave progress notes with\n\
         POST /api/tasks/:id/comments, and attach files you touched with\n\
         POST /api/tasks/:id/context. Create follow-up tasks you discover\n\
         with POST /api/tasks. Stop when no ready work remains.",
        name = team.name,
        dir = team.project_dir.display(),
    )
}

/// Check whether a process with the given PID is alive.
pub fn pid_alive(pid: u32) -> bool {
    // Guard against PID values that would wrap negative when cast to i32.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) checks existence without sending a signal.
    signal::kill(Pid::from_raw(raw), None).is_ok()
}

/// SIGTERM, wait up to `grace`, then SIGKILL any survivor.
///
/// Works from a bare PID so it covers both the in-memory child and a lead
/// that survived a server hot-reload. PIDs 0 and 1 are never targeted.
pub async fn terminate_with_escalation(pid: u32, grace: Duration) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 1 {
        return;
    }
    let target = Pid::from_raw(raw);

    if signal::kill(target, Signal::SIGTERM).is_err() {
        // Already gone (or not ours).
        return;
    }
    tracing::debug!(pid, "sent SIGTERM to lead process");

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }

    if pid_alive(pid) {
        tracing::warn!(pid, "lead ignored SIGTERM, escalating to SIGKILL");
        let _ = signal::kill(target, Signal::SIGKILL);
    }
}
