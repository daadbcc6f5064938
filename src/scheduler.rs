use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{clamp_interval, DEFAULT_REFRESH_MINUTES};
use crate::models::Account;
use crate::reconcile::Reconciler;

/// Accounts refreshed at once by [`refresh_all`].
pub const BULK_CONCURRENCY: usize = 5;

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// `(username, message)` for each failed account.
    pub errors: Vec<(String, String)>,
}

impl RefreshReport {
    fn record(&mut self, account: &Account, result: Result<(), String>) {
        match result {
            Ok(()) => self.refreshed += 1,
            Err(message) => {
                self.failed += 1;
                self.errors.push((account.username.clone(), message));
            }
        }
    }
}

/// Owns the single recurring auto-refresh task.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    task: Mutex<Option<JoinHandle<()>>>,
    interval_minutes: AtomicU32,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            task: Mutex::new(None),
            interval_minutes: AtomicU32::new(DEFAULT_REFRESH_MINUTES),
        }
    }

    /// Replace any running timer with one firing every `minutes` (clamped to
    /// 1..=1440). The first tick fires one interval from now.
    pub fn start_auto_refresh(&self, minutes: u32) -> u32 {
        let minutes = clamp_interval(minutes);
        let period = Duration::from_secs(u64::from(minutes) * 60);
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let reconciler = Arc::clone(&self.reconciler);
        *task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = run_tick(&reconciler).await;
                tracing::info!(
                    refreshed = report.refreshed,
                    failed = report.failed,
                    "scheduled refresh finished"
                );
            }
        }));
        self.interval_minutes.store(minutes, Ordering::Relaxed);
        tracing::info!(minutes, "auto-refresh scheduled");
        minutes
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn active_accounts(reconciler: &Reconciler) -> Vec<Account> {
    match reconciler.store().list_active_accounts() {
        Ok(accounts) => accounts,
        Err(e) => {
            tracing::warn!(error = %e, "could not list accounts");
            Vec::new()
        }
    }
}

/// One scheduled pass: every non-paused account, one at a time.
pub async fn run_tick(reconciler: &Reconciler) -> RefreshReport {
    let mut report = RefreshReport::default();
    for account in active_accounts(reconciler) {
        let result = reconciler
            .refresh_account(account.id)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string());
        report.record(&account, result);
    }
    report
}

/// Refresh every non-paused account with at most [`BULK_CONCURRENCY`] in flight.
pub async fn refresh_all(reconciler: &Reconciler) -> RefreshReport {
    let results: Vec<(Account, Result<(), String>)> = stream::iter(active_accounts(reconciler))
        .map(|account| async move {
            let result = reconciler
                .refresh_account(account.id)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string());
            (account, result)
        })
        .buffer_unordered(BULK_CONCURRENCY)
        .collect()
        .await;

    let mut report = RefreshReport::default();
    for (account, result) in results {
        report.record(&account, result);
    }
    tracing::info!(
        refreshed = report.refreshed,
        failed = report.failed,
        "bulk refresh finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Vault;
    use crate::models::{AccountKind, CopilotPlan, NewAccount};
    use crate::providers::copilot::{BillingSource, SourceOutcome};
    use crate::reconcile::Providers;
    use crate::store::Store;
    use crate::testing::{
        copilot_usage, MockClaudeAdmin, MockClaudeWeb, MockCopilot, MockRefresher,
    };

    fn setup(copilot: MockCopilot) -> (Arc<Reconciler>, Arc<MockCopilot>) {
        let copilot = Arc::new(copilot);
        let providers = Providers {
            copilot: copilot.clone(),
            claude_admin: Arc::new(MockClaudeAdmin::default()),
            claude_web: Arc::new(MockClaudeWeb::default()),
            tokens: Arc::new(MockRefresher::invalid_grant()),
        };
        let reconciler = Reconciler::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(Vault::from_secret(b"scheduler-test").unwrap()),
            providers,
        );
        (Arc::new(reconciler), copilot)
    }

    fn add(reconciler: &Reconciler, username: &str, token: &str) -> i64 {
        reconciler
            .add_account(NewAccount {
                username: username.to_string(),
                display_name: None,
                kind: AccountKind::Copilot {
                    pat_token: token.to_string(),
                    plan: Some(CopilotPlan::Pro),
                    billing_org: None,
                },
            })
            .unwrap()
    }

    fn answering() -> MockCopilot {
        MockCopilot::new("octocat").with(
            BillingSource::UserPremium,
            SourceOutcome::Data(copilot_usage(3.0)),
        )
    }

    #[tokio::test]
    async fn tick_skips_paused_accounts() {
        let (reconciler, copilot) = setup(answering());
        let alice = add(&reconciler, "alice", "tok-alice");
        add(&reconciler, "bob", "tok-bob");
        reconciler.store().set_paused(alice, true).unwrap();

        let report = run_tick(&reconciler).await;
        assert_eq!(report.refreshed, 1);
        assert_eq!(copilot.tokens_seen(), vec!["tok-bob"]);
        assert!(reconciler.store().usage_history(alice).unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_tick() {
        let (reconciler, copilot) = setup(answering());
        let broken = reconciler
            .store()
            .insert_account(&NewAccount {
                username: "broken".into(),
                display_name: None,
                kind: AccountKind::Copilot {
                    pat_token: "not-ciphertext".into(),
                    plan: None,
                    billing_org: None,
                },
            })
            .unwrap();
        add(&reconciler, "zed", "tok-zed");

        let report = run_tick(&reconciler).await;
        assert_eq!(report.refreshed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].0, "broken");
        assert_eq!(copilot.tokens_seen(), vec!["tok-zed"]);
        let account = reconciler.store().get_account(broken).unwrap().unwrap();
        assert_eq!(account.last_error.as_deref(), Some("no credential stored"));
    }

    #[tokio::test]
    async fn refresh_all_covers_every_active_account() {
        let (reconciler, copilot) = setup(answering());
        for i in 0..12 {
            add(&reconciler, &format!("user{i}"), &format!("tok-{i}"));
        }
        let paused = add(&reconciler, "paused", "tok-paused");
        reconciler.store().set_paused(paused, true).unwrap();

        let report = refresh_all(&reconciler).await;
        assert_eq!(report.refreshed, 12);
        assert_eq!(report.failed, 0);
        let seen = copilot.tokens_seen();
        assert_eq!(seen.len(), 12);
        assert!(!seen.contains(&"tok-paused".to_string()));
    }

    #[tokio::test]
    async fn refresh_all_bounds_accounts_in_flight() {
        let (reconciler, copilot) = setup(answering());
        for i in 0..12 {
            add(&reconciler, &format!("user{i}"), &format!("tok-{i}"));
        }

        let report = refresh_all(&reconciler).await;
        assert_eq!(report.refreshed, 12);
        let peak = copilot.peak_user_calls();
        assert!(peak > 1, "bulk refresh ran sequentially");
        assert!(peak <= BULK_CONCURRENCY, "{peak} accounts in flight");
    }

    #[tokio::test]
    async fn tick_refreshes_one_account_at_a_time() {
        let (reconciler, copilot) = setup(answering());
        for i in 0..4 {
            add(&reconciler, &format!("user{i}"), &format!("tok-{i}"));
        }

        run_tick(&reconciler).await;
        assert_eq!(copilot.peak_user_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_interval_and_skips_paused() {
        let (reconciler, copilot) = setup(answering());
        let alice = add(&reconciler, "alice", "tok-alice");
        add(&reconciler, "bob", "tok-bob");
        reconciler.store().set_paused(alice, true).unwrap();

        let scheduler = Scheduler::new(Arc::clone(&reconciler));
        assert_eq!(scheduler.start_auto_refresh(1), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(copilot.tokens_seen().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(copilot.tokens_seen(), vec!["tok-bob"]);
        assert!(scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_replaces_the_timer() {
        let (reconciler, copilot) = setup(answering());
        add(&reconciler, "bob", "tok-bob");

        let scheduler = Scheduler::new(Arc::clone(&reconciler));
        scheduler.start_auto_refresh(1);
        scheduler.start_auto_refresh(5);
        assert_eq!(scheduler.interval_minutes(), 5);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(copilot.tokens_seen().is_empty());

        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(copilot.tokens_seen().len(), 1);

        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn interval_is_clamped() {
        let (reconciler, _) = setup(answering());
        let scheduler = Scheduler::new(reconciler);
        assert_eq!(scheduler.start_auto_refresh(0), 1);
        assert_eq!(scheduler.start_auto_refresh(10_000), 1440);
    }
}
