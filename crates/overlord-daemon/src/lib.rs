//! Persistent background process: signal-handled run loop, a cron-driven
//! scheduler for ecosystem sweeps, and periodic proposal expiry. Ported from
//! `overlord_daemon.py`'s `OverlordDaemon`.
//!
//! The chat transport itself (socket connection, inbound message loop) is
//! the caller's concern — this crate only needs somewhere to post a sweep
//! summary, which is what [`overlord_channels::ChatMedium`] already gives
//! us.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use overlord_channels::ChatMedium;
use overlord_config::OverlordConfig;
use overlord_dispatch::scanner::{scan_ecosystem, ProjectStatus};
use overlord_proposals::ProposalManager;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

pub mod pidlock;

/// How long a proposal may sit `pending` before the cleanup loop expires it.
const PROPOSAL_TTL_MINUTES: i64 = 30;
/// How often the cleanup loop checks for expired proposals.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Wires the scheduler and cleanup loops together and owns the shutdown
/// signal. Holds no queue/dispatcher of its own — scheduled sweeps are
/// read-only ecosystem scans, not task dispatch.
pub struct OverlordDaemon<'a> {
    config: &'a OverlordConfig,
    proposals: &'a ProposalManager<'a>,
    chat: Option<&'a dyn ChatMedium>,
}

impl<'a> OverlordDaemon<'a> {
    pub fn new(config: &'a OverlordConfig, proposals: &'a ProposalManager<'a>, chat: Option<&'a dyn ChatMedium>) -> Self {
        Self { config, proposals, chat }
    }

    /// Installs SIGINT/SIGTERM handlers, runs the scheduler and cleanup
    /// loops to completion, and returns once both have observed shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!("overlord daemon starting");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sigterm = signal(SignalKind::terminate())?;

        let scheduler = self.scheduler_loop(shutdown_rx.clone());
        let cleanup = self.cleanup_loop(shutdown_rx.clone());
        tokio::pin!(scheduler);
        tokio::pin!(cleanup);

        let mut scheduler_done = false;
        let mut cleanup_done = false;

        while !(scheduler_done && cleanup_done) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    let _ = shutdown_tx.send(true);
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    let _ = shutdown_tx.send(true);
                }
                _ = &mut scheduler, if !scheduler_done => {
                    scheduler_done = true;
                }
                _ = &mut cleanup, if !cleanup_done => {
                    cleanup_done = true;
                }
            }
        }

        tracing::info!("overlord daemon stopped");
        Ok(())
    }

    /// Maintains one cron iterator per enabled scheduled task and, on each
    /// tick, sleeps until the soonest next-fire across all of them (or until
    /// shutdown), then executes that task.
    async fn scheduler_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut schedules = Vec::new();
        for (name, task) in &self.config.schedule.tasks {
            if !task.enabled {
                continue;
            }
            match parse_cron(&task.cron) {
                Ok(schedule) => schedules.push((name.clone(), schedule)),
                Err(e) => tracing::error!(task = %name, cron = %task.cron, error = %e, "invalid cron expression, skipping"),
            }
        }

        if schedules.is_empty() {
            tracing::info!("no scheduled tasks configured, scheduler idle");
            let _ = shutdown_rx.changed().await;
            return;
        }

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let now = Utc::now();
            let next = schedules
                .iter()
                .filter_map(|(name, schedule)| schedule.after(&now).next().map(|fire_at| (fire_at, name.clone())))
                .min_by_key(|(fire_at, _)| *fire_at);

            let Some((fire_at, task_name)) = next else {
                tracing::warn!("no upcoming fire time for any scheduled task, scheduler idle");
                let _ = shutdown_rx.changed().await;
                return;
            };

            let sleep_for = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(task = %task_name, seconds = sleep_for.as_secs(), "next scheduled task");

            if !wait_or_timeout(&mut shutdown_rx, sleep_for).await {
                return;
            }

            self.execute_scheduled_task(&task_name).await;
        }
    }

    /// Runs a scheduled task by name, posts a summary through the chat
    /// medium if one was found and configured, and always records a memory
    /// entry afterward.
    async fn execute_scheduled_task(&self, name: &str) {
        tracing::info!(task = name, "executing scheduled task");

        let summary = match name {
            "scan" => self.run_scan_sweep().await,
            "test-all" => self.run_test_all_sweep().await,
            "clean-stale-branches" => self.run_stale_branch_sweep().await,
            other => {
                tracing::warn!(task = other, "unknown scheduled task");
                None
            }
        };

        if let (Some(medium), Some(message)) = (self.chat, &summary) {
            if let Err(e) = medium.post_message(message).await {
                tracing::warn!(error = %e, "failed to post scheduled sweep summary");
            }
        }

        overlord_observability::emit_memory_entry("pattern", None, &format!("Scheduled task '{name}' executed"));
    }

    async fn run_scan_sweep(&self) -> Option<String> {
        let results = scan_ecosystem(self.config).await;
        let issues: Vec<&ProjectStatus> = results.iter().filter(|r| !r.issues.is_empty()).collect();
        tracing::info!(healthy = results.len() - issues.len(), total = results.len(), "scan complete");

        if issues.is_empty() {
            return None;
        }
        let summary = issues.iter().map(|r| format!("{}: {} issues", r.name, r.issues.len())).collect::<Vec<_>>().join(", ");
        Some(format!("Scheduled scan: {summary}"))
    }

    async fn run_test_all_sweep(&self) -> Option<String> {
        let results = scan_ecosystem(self.config).await;
        let no_tests: Vec<&ProjectStatus> = results.iter().filter(|r| !r.tests.has_tests).collect();
        tracing::info!("test-all sweep complete");

        if no_tests.is_empty() {
            return None;
        }
        let names = no_tests.iter().map(|r| r.name.clone()).collect::<Vec<_>>().join(", ");
        Some(format!("Test sweep: {names} have no tests detected"))
    }

    async fn run_stale_branch_sweep(&self) -> Option<String> {
        let results = scan_ecosystem(self.config).await;
        let stale: Vec<&ProjectStatus> = results.iter().filter(|r| !r.git.stale_branches.is_empty()).collect();
        tracing::info!(projects = stale.len(), "stale branch check complete");

        if stale.is_empty() {
            return None;
        }
        let mut lines = vec!["Stale branches detected:".to_string()];
        for r in &stale {
            lines.push(format!("  {}: {}", r.name, r.git.stale_branches.join(", ")));
        }
        Some(lines.join("\n"))
    }

    /// Calls `ProposalManager::cleanup_expired` every [`CLEANUP_INTERVAL`]
    /// until shutdown.
    async fn cleanup_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if !wait_or_timeout(&mut shutdown_rx, CLEANUP_INTERVAL).await {
                return;
            }
            match self.proposals.cleanup_expired(PROPOSAL_TTL_MINUTES).await {
                Ok(n) if n > 0 => tracing::info!(count = n, "expired stale proposals"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "proposal cleanup failed"),
            }
        }
    }
}

/// Sleeps for `dur` unless shutdown fires first. Returns `false` if
/// shutdown won the race.
async fn wait_or_timeout(shutdown_rx: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = shutdown_rx.changed() => false,
    }
}

/// `cron` expects a leading seconds field; the config's schedule strings are
/// standard 5-field unix-cron, so a bare 5-field expression gets `"0 "`
/// prepended before parsing.
fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let normalized = if expr.split_whitespace().count() == 5 { format!("0 {expr}") } else { expr.to_string() };
    Schedule::from_str(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cron_accepts_five_field_unix_cron() {
        let schedule = parse_cron("0 * * * *").unwrap();
        let now = Utc::now();
        assert!(schedule.after(&now).next().is_some());
    }

    #[test]
    fn parse_cron_rejects_garbage() {
        assert!(parse_cron("not a cron expression").is_err());
    }

    #[tokio::test]
    async fn wait_or_timeout_returns_false_when_shutdown_fires_first() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });
        let fired = wait_or_timeout(&mut rx, Duration::from_secs(5)).await;
        assert!(!fired);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_or_timeout_returns_true_on_timeout() {
        let (_tx, mut rx) = watch::channel(false);
        let fired = wait_or_timeout(&mut rx, Duration::from_millis(5)).await;
        assert!(fired);
    }
}
