//! Resilient directory watcher.
//!
//! The team directory this server watches is owned by an external tool and
//! may be deleted and re-created under our feet. A plain OS subscription
//! binds to an inode and silently goes dead when that inode is replaced, so
//! this watcher carries a heartbeat: if no event arrives within the timeout
//! it tears down the subscription, re-creates the directories, and
//! re-subscribes. `reinit_count` exposes how often that has happened.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Invoked for every filesystem event; panics are caught and dropped.
pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub directories: Vec<PathBuf>,
    /// Zero disables the heartbeat (and with it, self-healing).
    pub heartbeat_timeout: Duration,
    pub recursive: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            heartbeat_timeout: Duration::from_secs(30),
            recursive: true,
        }
    }
}

enum Control {
    Heartbeat,
    Stop,
}

pub struct ResilientWatcher {
    config: WatcherConfig,
    on_change: ChangeCallback,
    reinit_count: Arc<AtomicU32>,
    control_tx: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
}

impl ResilientWatcher {
    pub fn new(config: WatcherConfig, on_change: ChangeCallback) -> Self {
        Self {
            config,
            on_change,
            reinit_count: Arc::new(AtomicU32::new(0)),
            control_tx: None,
            task: None,
        }
    }

    /// Ensure every watched directory exists, subscribe, and spawn the
    /// monitor task. Starting an already-started watcher is a no-op.
    pub fn start(&mut self) -> Result<(), notify::Error> {
        if self.control_tx.is_some() {
            return Ok(());
        }

        ensure_directories(&self.config.directories)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watcher = subscribe(&self.config, event_tx.clone())?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(monitor_loop(
            watcher,
            self.config.clone(),
            Arc::clone(&self.on_change),
            Arc::clone(&self.reinit_count),
            event_tx,
            event_rx,
            control_rx,
        ));

        self.control_tx = Some(control_tx);
        self.task = Some(task);
        Ok(())
    }

    /// Manually reset the heartbeat timer.
    pub fn heartbeat(&self) {
        if let Some(tx) = &self.control_tx {
            let _ = tx.send(Control::Heartbeat);
        }
    }

    /// Tear everything down. Idempotent; no heartbeat can fire afterwards.
    pub fn stop(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Stop);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// How many times the heartbeat has re-created the subscription.
    pub fn reinit_count(&self) -> u32 {
        self.reinit_count.load(Ordering::Relaxed)
    }
}

impl Drop for ResilientWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ensure_directories(directories: &[PathBuf]) -> std::io::Result<()> {
    for dir in directories {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Build a notify watcher forwarding event paths into `event_tx`.
fn subscribe(
    config: &WatcherConfig,
    event_tx: mpsc::UnboundedSender<PathBuf>,
) -> Result<RecommendedWatcher, notify::Error> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                if event.paths.is_empty() {
                    // Still counts as activity for the heartbeat.
                    let _ = event_tx.send(PathBuf::new());
                }
                for path in event.paths {
                    let _ = event_tx.send(path);
                }
            }
        },
        NotifyConfig::default(),
    )?;

    let mode = if config.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    for dir in &config.directories {
        watcher.watch(dir, mode)?;
    }
    Ok(watcher)
}

#[allow(clippy::too_many_arguments)]
async fn monitor_loop(
    watcher: RecommendedWatcher,
    config: WatcherConfig,
    on_change: ChangeCallback,
    reinit_count: Arc<AtomicU32>,
    event_tx: mpsc::UnboundedSender<PathBuf>,
    mut event_rx: mpsc::UnboundedReceiver<PathBuf>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let heartbeat_enabled = config.heartbeat_timeout > Duration::ZERO;
    let mut watcher = Some(watcher);
    let mut deadline = Instant::now() + heartbeat_or_forever(&config);

    loop {
        tokio::select! {
            ctrl = control_rx.recv() => match ctrl {
                Some(Control::Heartbeat) => {
                    deadline = Instant::now() + heartbeat_or_forever(&config);
                }
                Some(Control::Stop) | None => break,
            },
            event = event_rx.recv() => match event {
                Some(path) => {
                    deadline = Instant::now() + heartbeat_or_forever(&config);
                    invoke(&on_change, &path);
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if heartbeat_enabled => {
                // No events within the timeout: the subscription may be bound
                // to a deleted inode. Rebuild from scratch.
                watcher.take();
                if let Err(err) = ensure_directories(&config.directories) {
                    tracing::warn!(error = %err, "watcher could not re-create directories");
                }
                match subscribe(&config, event_tx.clone()) {
                    Ok(fresh) => {
                        watcher = Some(fresh);
                        reinit_count.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            reinit = reinit_count.load(Ordering::Relaxed),
                            "watcher re-initialized after heartbeat expiry"
                        );
                    }
                    Err(err) => {
                        // Run bare until the next expiry retries.
                        tracing::warn!(error = %err, "watcher re-subscription failed, will retry");
                    }
                }
                deadline = Instant::now() + heartbeat_or_forever(&config);
            }
        }
    }
}

fn heartbeat_or_forever(config: &WatcherConfig) -> Duration {
    if config.heartbeat_timeout > Duration::ZERO {
        config.heartbeat_timeout
    } else {
        // Never polled when the heartbeat is disabled; any value works.
        Duration::from_secs(3600)
    }
}

fn invoke(on_change: &ChangeCallback, path: &Path) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| on_change(path)));
    if result.is_err() {
        tracing::warn!(path = %path.display(), "change callback panicked; dropped");
    }
}
