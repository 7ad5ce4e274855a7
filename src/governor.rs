//! Per-session turn budget enforcement.
//!
//! The governor counts turns the lead agent reports consuming and gates
//! further cycle spawns. It emits a one-shot warning when the budget runs
//! low and a one-shot exhaustion signal when it runs out; both re-arm on
//! `reset`.

/// Fraction of the budget remaining at which the warning fires.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.1;

/// Default per-cycle allocation cap.
pub const DEFAULT_PER_CYCLE_CAP: u32 = 50;

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub max_turns: u32,
    pub warning_threshold: f64,
}

impl GovernorConfig {
    pub fn new(max_turns: u32) -> Self {
        Self {
            max_turns,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }

    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold;
        self
    }
}

/// Callback invoked with `(used, max)`.
pub type BudgetCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

pub struct TurnGovernor {
    config: GovernorConfig,
    used: u32,
    warning_fired: bool,
    exhausted_fired: bool,
    on_warning: Option<BudgetCallback>,
    on_exhausted: Option<BudgetCallback>,
}

impl TurnGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            used: 0,
            warning_fired: false,
            exhausted_fired: false,
            on_warning: None,
            on_exhausted: None,
        }
    }

    pub fn with_on_warning(mut self, callback: impl Fn(u32, u32) + Send + Sync + 'static) -> Self {
        self.on_warning = Some(Box::new(callback));
        self
    }

    pub fn with_on_exhausted(mut self, callback: impl Fn(u32, u32) + Send + Sync + 'static) -> Self {
        self.on_exhausted = Some(Box::new(callback));
        self
    }

    /// Record `n` consumed turns. Returns `false` once `used >= max`.
    ///
    /// `n` may overshoot the remaining budget. On the transition into
    /// exhaustion the exhaustion callback fires exactly once; the low-budget
    /// warning fires exactly once, and only on a non-exhausting call.
    pub fn record_turns(&mut self, n: u32) -> bool {
        self.used = self.used.saturating_add(n);
        let max = self.config.max_turns;

        if self.used >= max {
            if !self.exhausted_fired {
                self.exhausted_fired = true;
                if let Some(callback) = &self.on_exhausted {
                    callback(self.used, max);
                }
            }
            return false;
        }

        if !self.warning_fired && max > 0 {
            let remaining = (max - self.used) as f64 / max as f64;
            if remaining <= self.config.warning_threshold {
                self.warning_fired = true;
                if let Some(callback) = &self.on_warning {
                    callback(self.used, max);
                }
            }
        }
        true
    }

    /// Turn allowance for the next cycle: `min(per_cycle_cap, max - used)`,
    /// zero once the budget is spent.
    pub fn allocate_cycle_budget(&self, per_cycle_cap: u32) -> u32 {
        self.config.max_turns.saturating_sub(self.used).min(per_cycle_cap)
    }

    pub fn can_spawn(&self) -> bool {
        self.used < self.config.max_turns
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.config.max_turns.saturating_sub(self.used)
    }

    /// Zero the counter and re-arm both one-shot callbacks.
    pub fn reset(&mut self) {
        self.used = 0;
        self.warning_fired = false;
        self.exhausted_fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(counter: &Arc<AtomicU32>) -> impl Fn(u32, u32) + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn records_until_exhausted() {
        let exhausted = Arc::new(AtomicU32::new(0));
        let mut governor =
            TurnGovernor::new(GovernorConfig::new(10)).with_on_exhausted(counting(&exhausted));

        assert!(governor.record_turns(4));
        assert!(!governor.record_turns(6));
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(governor.allocate_cycle_budget(50), 0);
        assert!(!governor.can_spawn());
    }

    #[test]
    fn exhaustion_fires_once_per_epoch() {
        let exhausted = Arc::new(AtomicU32::new(0));
        let mut governor =
            TurnGovernor::new(GovernorConfig::new(5)).with_on_exhausted(counting(&exhausted));

        assert!(!governor.record_turns(9));
        assert!(!governor.record_turns(1));
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);

        governor.reset();
        assert!(governor.can_spawn());
        assert!(!governor.record_turns(5));
        assert_eq!(exhausted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn allocation_respects_cap_and_remaining() {
        let mut governor = TurnGovernor::new(GovernorConfig::new(120));
        assert_eq!(governor.allocate_cycle_budget(50), 50);
        assert!(governor.record_turns(100));
        assert_eq!(governor.allocate_cycle_budget(50), 20);
        assert_eq!(governor.allocate_cycle_budget(10), 10);
    }

    #[test]
    fn warning_fires_once_below_threshold() {
        let warned = Arc::new(AtomicU32::new(0));
        let mut governor =
            TurnGovernor::new(GovernorConfig::new(100)).with_on_warning(counting(&warned));

        assert!(governor.record_turns(80));
        assert_eq!(warned.load(Ordering::SeqCst), 0);
        assert!(governor.record_turns(12));
        assert_eq!(warned.load(Ordering::SeqCst), 1);
        assert!(governor.record_turns(5));
        assert_eq!(warned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn warning_skipped_when_a_call_exhausts_outright() {
        let warned = Arc::new(AtomicU32::new(0));
        let exhausted = Arc::new(AtomicU32::new(0));
        let mut governor = TurnGovernor::new(GovernorConfig::new(10))
            .with_on_warning(counting(&warned))
            .with_on_exhausted(counting(&exhausted));

        assert!(!governor.record_turns(10));
        assert_eq!(warned.load(Ordering::SeqCst), 0);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_threshold() {
        let warned = Arc::new(AtomicU32::new(0));
        let mut governor =
            TurnGovernor::new(GovernorConfig::new(10).with_warning_threshold(0.5))
                .with_on_warning(counting(&warned));

        assert!(governor.record_turns(5));
        assert_eq!(warned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_rearms_warning() {
        let warned = Arc::new(AtomicU32::new(0));
        let mut governor =
            TurnGovernor::new(GovernorConfig::new(100)).with_on_warning(counting(&warned));

        assert!(governor.record_turns(95));
        governor.reset();
        assert_eq!(governor.used(), 0);
        assert_eq!(governor.remaining(), 100);
        assert!(governor.record_turns(95));
        assert_eq!(warned.load(Ordering::SeqCst), 2);
    }
}
