//! Event-driven cycle supervisor.
//!
//! Couples board changes and a bounded turn budget to a finite state machine
//! around a single external lead process:
//!
//! | State | team active | child | meaning |
//! |-------|-------------|-------|---------|
//! | STOPPED | no | none | board events ignored |
//! | IDLE | yes | none | waiting for a board change |
//! | RUNNING | yes | alive | a cycle is in flight |
//! | PENDING | yes | alive | a change arrived mid-cycle; respawn on exit |
//!
//! All state lives in one tokio task fed by a command channel; HTTP handlers
//! and child monitors send on the channel, timers are select arms inside the
//! task. That serializes every mutation without locks.

pub mod process;
pub mod stream;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::delivery::{DeliveryConfig, EventDelivery};
use crate::errors::SupervisorError;
use crate::governor::{GovernorConfig, TurnGovernor};
use crate::logs::LogStore;
use crate::paths::ClambanPaths;
use crate::supervisor::stream::{ContentBlock, StreamEvent};
use crate::team::{TeamConfig, TeamState};

/// Per-cycle turn allocation cap.
pub const PER_CYCLE_TURN_CAP: u32 = 50;

/// Timing knobs for the FSM. Production values are the defaults; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    /// IDLE → RUNNING debounce after a board change.
    pub idle_debounce: Duration,
    /// Delay between a pending child exit and the respawn.
    pub respawn_debounce: Duration,
    /// A child exiting faster than this is treated as a crash; no respawn.
    pub crash_guard: Duration,
    /// Grace between SIGTERM and SIGKILL when stopping.
    pub kill_grace: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            idle_debounce: Duration::from_secs(3),
            respawn_debounce: Duration::from_secs(1),
            crash_guard: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Everything one session of cycles needs to spawn leads.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub team: TeamConfig,
    /// Port the board API listens on, advertised to the lead.
    pub port: u16,
    pub claude_cmd: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Stopped,
    Idle,
    Running,
    Pending,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Pending => "pending",
        }
    }
}

/// Snapshot of supervisor state for the status endpoint.
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: CycleState,
    pub team: Option<String>,
    pub turns_used: u32,
    pub child_pid: Option<u32>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: CycleState::Stopped,
            team: None,
            turns_used: 0,
            child_pid: None,
        }
    }
}

/// Fired after every child exit and on every terminal transition.
pub type ExitCallback = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Start {
        config: CycleConfig,
        done: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    BoardChanged,
    ChildTurns(u32),
    ChildExited {
        code: Option<i32>,
    },
}

/// Handle used by the HTTP layer. Cloneable; all clones feed the same task.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::UnboundedSender<Command>,
    status: Arc<Mutex<SupervisorStatus>>,
    paths: ClambanPaths,
}

impl Supervisor {
    /// Spawn the FSM task. `on_exit` is captured here and never replaced.
    pub fn spawn(
        paths: ClambanPaths,
        logs: LogStore,
        timings: SupervisorTimings,
        on_exit: ExitCallback,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(SupervisorStatus::default()));

        let task = SupervisorTask {
            rx,
            tx: tx.clone(),
            paths: paths.clone(),
            logs,
            timings,
            on_exit,
            status: Arc::clone(&status),
            state_delivery: EventDelivery::new(DeliveryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(50),
            }),
            governor: TurnGovernor::new(GovernorConfig::new(0)),
            config: None,
            team_active: false,
            pending_change: false,
            budget_exhausted: false,
            child_pid: None,
            last_spawn: None,
            debounce: None,
        };
        tokio::spawn(task.run());

        Self { tx, status, paths }
    }

    /// STOPPED → RUNNING: reset the budget, clear the log, spawn immediately.
    pub async fn start(&self, config: CycleConfig) -> Result<(), SupervisorError> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Start { config, done })
            .map_err(|_| SupervisorError::NotRunning)?;
        wait.await.map_err(|_| SupervisorError::NotRunning)?
    }

    /// Universal cancel. Resolves once the child (if any) has been signaled
    /// through the full escalation.
    pub async fn stop(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Stop { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Feed one board change into the FSM. Cheap; coalesced internally.
    pub fn notify_board_changed(&self) {
        let _ = self.tx.send(Command::BoardChanged);
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// A team is running if the in-memory child is alive OR the persisted
    /// lead PID still refers to a live process (hot-reload survivor).
    pub fn is_running(&self, team: &str) -> bool {
        let snapshot = self.status();
        if snapshot.child_pid.is_some() && snapshot.team.as_deref() == Some(team) {
            return true;
        }
        TeamState::load(&self.paths, team)
            .lead_pid
            .map(process::pid_alive)
            .unwrap_or(false)
    }
}

enum Tick {
    Cmd(Option<Command>),
    DebounceFired,
}

struct SupervisorTask {
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    paths: ClambanPaths,
    logs: LogStore,
    timings: SupervisorTimings,
    on_exit: ExitCallback,
    status: Arc<Mutex<SupervisorStatus>>,
    state_delivery: EventDelivery,

    governor: TurnGovernor,
    config: Option<CycleConfig>,
    team_active: bool,
    pending_change: bool,
    budget_exhausted: bool,
    child_pid: Option<u32>,
    last_spawn: Option<Instant>,
    debounce: Option<std::pin::Pin<Box<tokio::time::Sleep>>>,
}

impl SupervisorTask {
    async fn run(mut self) {
        loop {
            let tick = match self.debounce.as_mut() {
                Some(sleep) => tokio::select! {
                    cmd = self.rx.recv() => Tick::Cmd(cmd),
                    _ = sleep.as_mut() => Tick::DebounceFired,
                },
                None => Tick::Cmd(self.rx.recv().await),
            };

            match tick {
                Tick::Cmd(None) => break,
                Tick::Cmd(Some(command)) => self.handle_command(command).await,
                Tick::DebounceFired => {
                    self.debounce = None;
                    if self.team_active && self.child_pid.is_none() {
                        self.spawn_cycle().await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { config, done } => {
                if self.team_active {
                    let _ = done.send(Err(SupervisorError::AlreadyRunning));
                    return;
                }
                self.begin_session(config).await;
                let _ = done.send(Ok(()));
                self.spawn_cycle().await;
            }
            Command::Stop { done } => {
                self.do_stop().await;
                let _ = done.send(());
            }
            Command::BoardChanged => self.handle_board_changed(),
            Command::ChildTurns(n) => {
                if !self.governor.record_turns(n) {
                    self.budget_exhausted = true;
                }
                self.publish_status();
            }
            Command::ChildExited { code } => self.handle_child_exit(code).await,
        }
    }

    async fn begin_session(&mut self, config: CycleConfig) {
        let team = config.team.name.clone();
        let logs = self.logs.clone();
        let warn_team = team.clone();
        let warn_logs = logs.clone();
        let exhaust_team = team.clone();

        self.governor = TurnGovernor::new(GovernorConfig::new(config.team.max_turns))
            .with_on_warning(move |used, max| {
                tracing::warn!(team = %warn_team, used, max, "turn budget running low");
                let _ = warn_logs.append(
                    &warn_team,
                    &format!("[governor] budget warning: {used}/{max} turns used"),
                );
            })
            .with_on_exhausted(move |used, max| {
                tracing::warn!(team = %exhaust_team, used, max, "turn budget exhausted");
                let _ = logs.append(
                    &exhaust_team,
                    &format!("[governor] budget exhausted: {used}/{max} turns used"),
                );
            });

        let _ = self.logs.clear(&team);
        self.config = Some(config);
        self.team_active = true;
        self.pending_change = false;
        self.budget_exhausted = false;
        self.debounce = None;

        self.persist_team_state(&team, |state| {
            state.started_at = Some(Utc::now());
            state.stopped_at = None;
        })
        .await;
        self.publish_status();
    }

    fn handle_board_changed(&mut self) {
        if !self.team_active {
            return;
        }
        if self.child_pid.is_some() {
            // Coalesce: only the fact that something changed matters.
            self.pending_change = true;
        } else {
            // IDLE: (re)arm the debounce; rapid changes keep pushing it out.
            self.arm_debounce(self.timings.idle_debounce);
        }
        self.publish_status();
    }

    fn arm_debounce(&mut self, delay: Duration) {
        self.debounce = Some(Box::pin(tokio::time::sleep(delay)));
    }

    async fn spawn_cycle(&mut self) {
        let Some(config) = self.config.clone() else {
            return;
        };
        if !self.team_active {
            return;
        }
        let team = &config.team;

        let cycle_turns = self.governor.allocate_cycle_budget(PER_CYCLE_TURN_CAP);
        if cycle_turns == 0 {
            let _ = self
                .logs
                .append(&team.name, "[supervisor] no turn budget left, stopping");
            self.transition_stopped("budget exhausted").await;
            (self.on_exit)();
            return;
        }

        let _ = self.logs.append(
            &team.name,
            &format!(
                "=== cycle start {} | turns used {}/{} | cycle budget {} ===",
                Utc::now().to_rfc3339(),
                self.governor.used(),
                team.max_turns,
                cycle_turns
            ),
        );

        self.pending_change = false;
        self.last_spawn = Some(Instant::now());

        let prompt = process::build_cycle_prompt(team, config.port);
        match process::spawn_lead(&config.claude_cmd, team, cycle_turns, &prompt).await {
            Ok(child) => {
                let pid = child.id();
                self.child_pid = pid;
                self.persist_team_state(&team.name, |state| state.lead_pid = pid).await;
                tokio::spawn(monitor_child(
                    child,
                    self.logs.clone(),
                    team.name.clone(),
                    self.tx.clone(),
                ));
                self.publish_status();
            }
            Err(err) => {
                tracing::error!(team = %team.name, error = %err, "failed to spawn lead");
                let _ = self
                    .logs
                    .append(&team.name, &format!("[supervisor] spawn failed: {err}"));
                self.transition_stopped("spawn failed").await;
                (self.on_exit)();
            }
        }
    }

    async fn handle_child_exit(&mut self, code: Option<i32>) {
        let elapsed = self.last_spawn.map(|t| t.elapsed()).unwrap_or_default();
        self.child_pid = None;

        let Some(config) = self.config.clone() else {
            self.publish_status();
            (self.on_exit)();
            return;
        };
        let team = config.team.name.clone();

        let _ = self.logs.append(
            &team,
            &format!(
                "[supervisor] cycle exited with code {} after {:.1}s",
                code.map_or_else(|| "?".to_string(), |c| c.to_string()),
                elapsed.as_secs_f64()
            ),
        );
        self.persist_team_state(&team, |state| state.lead_pid = None).await;

        if !self.team_active {
            // Stop already cleared the session; nothing to decide.
            self.publish_status();
            (self.on_exit)();
            return;
        }

        if elapsed < self.timings.crash_guard {
            // Respawning a crash-looping lead would spin.
            let _ = self.logs.append(
                &team,
                "[supervisor] lead exited inside the crash guard window, stopping",
            );
            self.transition_stopped("crash guard").await;
            (self.on_exit)();
            return;
        }

        if self.budget_exhausted || !self.governor.can_spawn() {
            self.transition_stopped("budget exhausted").await;
            (self.on_exit)();
            return;
        }

        if self.pending_change {
            self.arm_debounce(self.timings.respawn_debounce);
        }
        // else: IDLE, waiting for the next board change.
        self.publish_status();
        (self.on_exit)();
    }

    async fn do_stop(&mut self) {
        self.team_active = false;
        self.pending_change = false;
        self.debounce = None;

        let team = self.config.as_ref().map(|c| c.team.name.clone());
        let Some(team) = team else {
            self.publish_status();
            return;
        };

        // In-memory child first; fall back to the persisted PID so a lead
        // that survived a hot-reload still gets stopped.
        let pid = self
            .child_pid
            .or_else(|| TeamState::load(&self.paths, &team).lead_pid);
        if let Some(pid) = pid
            && process::pid_alive(pid)
        {
            process::terminate_with_escalation(pid, self.timings.kill_grace).await;
        }
        self.child_pid = None;

        self.persist_team_state(&team, |state| {
            state.lead_pid = None;
            state.stopped_at = Some(Utc::now());
        })
        .await;
        let _ = self.logs.append(&team, "[supervisor] stopped");
        self.publish_status();
    }

    async fn transition_stopped(&mut self, reason: &str) {
        self.team_active = false;
        self.pending_change = false;
        self.debounce = None;
        if let Some(config) = &self.config {
            let team = config.team.name.clone();
            let _ = self
                .logs
                .append(&team, &format!("[supervisor] stopped: {reason}"));
            self.persist_team_state(&team, |state| {
                state.lead_pid = None;
                state.stopped_at = Some(Utc::now());
            })
            .await;
        }
        self.publish_status();
    }

    /// Team-state writes go through the retrying delivery primitive; a
    /// transiently failing disk must not lose the lead PID.
    async fn persist_team_state<F>(&self, team: &str, mutate: F)
    where
        F: FnOnce(&mut TeamState),
    {
        let mut state = TeamState::load(&self.paths, team);
        mutate(&mut state);

        let paths = self.paths.clone();
        let team_name = team.to_string();
        let delivered = self
            .state_delivery
            .deliver(|| {
                let state = state.clone();
                let paths = paths.clone();
                let team_name = team_name.clone();
                async move {
                    state.save(&paths, &team_name)?;
                    Ok(())
                }
            })
            .await;
        if !delivered {
            tracing::warn!(team = %team_name, "failed to persist team state");
        }
    }

    fn current_state(&self) -> CycleState {
        if !self.team_active {
            CycleState::Stopped
        } else if self.child_pid.is_some() {
            if self.pending_change {
                CycleState::Pending
            } else {
                CycleState::Running
            }
        } else {
            CycleState::Idle
        }
    }

    fn publish_status(&self) {
        if let Ok(mut status) = self.status.lock() {
            status.state = self.current_state();
            status.team = self.config.as_ref().map(|c| c.team.name.clone());
            status.turns_used = self.governor.used();
            status.child_pid = self.child_pid;
        }
    }
}

/// Owns the child for one cycle: logs its stream-json stdout and raw stderr,
/// reports consumed turns, and announces the exit.
async fn monitor_child(
    mut child: tokio::process::Child,
    logs: LogStore,
    team: String,
    tx: mpsc::UnboundedSender<Command>,
) {
    if let Some(stderr) = child.stderr.take() {
        let logs = logs.clone();
        let team = team.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = logs.append(&team, &format!("[stderr] {line}"));
            }
        });
    }

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::System {
                    subtype,
                    session_id,
                    model,
                }) => {
                    if subtype == "init" {
                        let _ = logs.append(
                            &team,
                            &format!(
                                "[lead] session {} model {}",
                                session_id,
                                model.as_deref().unwrap_or("default")
                            ),
                        );
                    }
                }
                Ok(StreamEvent::Assistant { message }) => {
                    for block in message.content {
                        match block {
                            ContentBlock::Text { text } => {
                                let snippet = stream::truncate(&text, 200);
                                if !snippet.is_empty() {
                                    let _ = logs.append(&team, &format!("[lead] {snippet}"));
                                }
                            }
                            ContentBlock::ToolUse { name, input } => {
                                let desc = stream::describe_tool_use(&name, &input);
                                let _ = logs.append(&team, &format!("[lead] {desc}"));
                            }
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    subtype,
                    num_turns,
                    total_cost_usd,
                    ..
                }) => {
                    if let Some(turns) = num_turns {
                        let _ = tx.send(Command::ChildTurns(turns));
                    }
                    let _ = logs.append(
                        &team,
                        &format!(
                            "[lead] result {} turns={} cost=${:.4}",
                            subtype,
                            num_turns.map_or_else(|| "?".to_string(), |n| n.to_string()),
                            total_cost_usd.unwrap_or(0.0)
                        ),
                    );
                }
                Ok(StreamEvent::User {}) => {}
                Err(_) => {
                    // Not stream-json; keep it anyway.
                    let _ = logs.append(&team, &line);
                }
            }
        }
    }

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::warn!(team = %team, error = %err, "error waiting for lead process");
            None
        }
    };
    let _ = tx.send(Command::ChildExited { code });
}
