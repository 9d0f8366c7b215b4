use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ResourceLimitsConfig;

/// Sliding window of `(timestamp, amount)` pairs with fixed retention.
/// Entries older than the window are pruned on every read and write.
#[derive(Debug)]
pub struct SlidingWindow {
    window:  Duration,
    entries: VecDeque<(Instant, u64)>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    pub fn minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    fn prune(&mut self, now: Instant) {
        while let Some((ts, _)) = self.entries.front() {
            if now.duration_since(*ts) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn push(&mut self, amount: u64) {
        let now = Instant::now();
        self.prune(now);
        self.entries.push_back((now, amount));
    }

    pub fn sum(&mut self) -> u64 {
        self.prune(Instant::now());
        self.entries.iter().map(|(_, amount)| amount).sum()
    }

    pub fn len(&mut self) -> usize {
        self.prune(Instant::now());
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time view of an agent's resource consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub active_tasks:          usize,
    pub tokens_last_minute:    u64,
    pub tool_calls_last_minute: u64,
}

/// Availability verdict; `reason` names the first exhausted budget.
#[derive(Debug, Clone)]
pub struct ResourceAvailability {
    pub available: bool,
    pub reason:    Option<String>,
}

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-agent resource governor: concurrent-task count plus token and
/// tool-call budgets over sliding 60-second windows.
pub struct ResourceMonitor {
    config:       ResourceLimitsConfig,
    active_tasks: AtomicUsize,
    tokens:       Mutex<SlidingWindow>,
    tool_calls:   Mutex<SlidingWindow>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceLimitsConfig) -> Self {
        Self {
            config,
            active_tasks: AtomicUsize::new(0),
            tokens:       Mutex::new(SlidingWindow::minute()),
            tool_calls:   Mutex::new(SlidingWindow::minute()),
        }
    }

    pub fn config(&self) -> &ResourceLimitsConfig {
        &self.config
    }

    pub fn record_tokens(&self, amount: u64) {
        self.tokens.lock().expect("token window lock poisoned").push(amount);
    }

    pub fn record_tool_call(&self) {
        self.tool_calls
            .lock()
            .expect("tool call window lock poisoned")
            .push(1);
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Reserve one concurrent-task slot; the permit releases it on drop.
    pub fn acquire_task_permit(monitor: &Arc<ResourceMonitor>) -> TaskPermit {
        monitor.active_tasks.fetch_add(1, Ordering::SeqCst);
        TaskPermit {
            monitor: Arc::clone(monitor),
        }
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            active_tasks:           self.active_tasks(),
            tokens_last_minute:     self
                .tokens
                .lock()
                .expect("token window lock poisoned")
                .sum(),
            tool_calls_last_minute: self
                .tool_calls
                .lock()
                .expect("tool call window lock poisoned")
                .sum(),
        }
    }

    pub fn check_availability(&self) -> ResourceAvailability {
        if !self.config.enforce_limits {
            return ResourceAvailability { available: true, reason: None };
        }
        let usage = self.usage();
        if usage.active_tasks >= self.config.max_concurrent_tasks {
            return ResourceAvailability {
                available: false,
                reason:    Some(format!(
                    "active tasks at limit ({}/{})",
                    usage.active_tasks, self.config.max_concurrent_tasks
                )),
            };
        }
        if usage.tokens_last_minute >= self.config.max_tokens_per_minute {
            return ResourceAvailability {
                available: false,
                reason:    Some(format!(
                    "token budget exhausted ({}/{} per minute)",
                    usage.tokens_last_minute, self.config.max_tokens_per_minute
                )),
            };
        }
        if usage.tool_calls_last_minute >= self.config.max_tool_calls_per_minute {
            return ResourceAvailability {
                available: false,
                reason:    Some(format!(
                    "tool call budget exhausted ({}/{} per minute)",
                    usage.tool_calls_last_minute, self.config.max_tool_calls_per_minute
                )),
            };
        }
        ResourceAvailability { available: true, reason: None }
    }

    /// Poll until resources free up or the timeout elapses. Returns whether
    /// resources became available; never errors on timeout.
    /// `wait_for_resources(0)` equals `check_availability().available`.
    pub async fn wait_for_resources(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check_availability().available {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// RAII permit for one concurrent task slot.
pub struct TaskPermit {
    monitor: Arc<ResourceMonitor>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.monitor.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(tasks: usize, tokens: u64, calls: u64) -> ResourceLimitsConfig {
        ResourceLimitsConfig {
            enforce_limits:            true,
            max_concurrent_tasks:      tasks,
            max_tokens_per_minute:     tokens,
            max_tool_calls_per_minute: calls,
        }
    }

    #[test]
    fn window_sums_recent_entries() {
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        window.push(10);
        window.push(5);
        assert_eq!(window.sum(), 15);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn window_prunes_old_entries() {
        let mut window = SlidingWindow::new(Duration::from_millis(10));
        window.push(10);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(window.sum(), 0);
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn task_permits_gate_concurrency() {
        let monitor = Arc::new(ResourceMonitor::new(limits(1, 1000, 1000)));
        let permit = ResourceMonitor::acquire_task_permit(&monitor);
        assert!(!monitor.check_availability().available);
        drop(permit);
        assert!(monitor.check_availability().available);
    }

    #[tokio::test]
    async fn token_budget_blocks_when_spent() {
        let monitor = ResourceMonitor::new(limits(5, 100, 1000));
        monitor.record_tokens(100);
        let availability = monitor.check_availability();
        assert!(!availability.available);
        assert!(availability.reason.unwrap().contains("token budget"));
    }

    #[tokio::test]
    async fn wait_zero_equals_check() {
        let monitor = Arc::new(ResourceMonitor::new(limits(1, 1000, 1000)));
        assert_eq!(
            monitor.wait_for_resources(Duration::ZERO).await,
            monitor.check_availability().available
        );
        let _permit = ResourceMonitor::acquire_task_permit(&monitor);
        assert_eq!(
            monitor.wait_for_resources(Duration::ZERO).await,
            monitor.check_availability().available
        );
    }

    #[tokio::test]
    async fn wait_returns_true_when_slot_frees() {
        let monitor = Arc::new(ResourceMonitor::new(limits(1, 1000, 1000)));
        let permit = ResourceMonitor::acquire_task_permit(&monitor);
        let waiter = Arc::clone(&monitor);
        let handle =
            tokio::spawn(async move { waiter.wait_for_resources(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        drop(permit);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn unenforced_limits_always_available() {
        let monitor = ResourceMonitor::new(ResourceLimitsConfig {
            enforce_limits: false,
            ..limits(0, 0, 0)
        });
        assert!(monitor.check_availability().available);
    }
}
