//! Finds messages that were shown live but whose side effects never all
//! landed, and finishes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chatline_db::{Store, StoreError};
use chatline_types::api::{FixSummary, PhantomCategories, PhantomReport, PhantomStats, ReconcilerStatus};
use chatline_types::models::DeliveryState;

use crate::pipeline::Pipeline;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Entries younger than this are left to the workers.
    pub grace: Duration,
    pub lookback: Duration,
    /// Most entries looked at per pass.
    pub batch_limit: usize,
    /// Completed status documents older than this are purged.
    pub retention: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(30),
            lookback: Duration::from_secs(24 * 60 * 60),
            batch_limit: 500,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    store: Store,
    pipeline: Pipeline,
    config: ReconcilerConfig,
    /// Held for the length of a pass so two passes never overlap.
    pass: tokio::sync::Mutex<()>,
    running: AtomicBool,
    last: Mutex<Option<(DateTime<Utc>, FixSummary)>>,
}

fn ago(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Reconciler {
    pub fn new(store: Store, pipeline: Pipeline, config: ReconcilerConfig) -> Self {
        Self {
            inner: Arc::new(ReconcilerInner {
                store,
                pipeline,
                config,
                pass: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
                last: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.inner.config
    }

    /// Incomplete entries broadcast within `window`, grouped by what is
    /// still missing.
    pub async fn scan(&self, window: Duration, limit: usize) -> Result<PhantomReport, StoreError> {
        let now = Utc::now();
        let cutoff = ago(now, window);
        let entries = self.inner.store.incomplete_statuses(cutoff, limit).await?;

        let mut categories = PhantomCategories::default();
        let phantom_messages: Vec<_> = entries
            .into_iter()
            .map(|(status, _)| {
                categories.db_not_saved += usize::from(!status.saved_to_store);
                categories.cache_not_saved += usize::from(!status.saved_to_cache);
                categories.notification_not_sent += usize::from(!status.notified);
                status
            })
            .collect();

        Ok(PhantomReport {
            statistics: PhantomStats {
                total_phantoms: phantom_messages.len(),
                time_range: humantime::format_duration(window).to_string(),
                cutoff_time: cutoff,
                check_timestamp: now,
            },
            categories,
            phantom_messages,
        })
    }

    /// Re-drives the missing steps of every incomplete entry older than the
    /// grace period. Entries that are already complete are left alone.
    pub async fn fix(&self) -> Result<FixSummary, StoreError> {
        let _pass = self.inner.pass.lock().await;
        self.inner.running.store(true, Ordering::SeqCst);
        let result = self.fix_pass().await;
        self.inner.running.store(false, Ordering::SeqCst);

        let summary = result?;
        *self
            .inner
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((Utc::now(), summary.clone()));
        Ok(summary)
    }

    async fn fix_pass(&self) -> Result<FixSummary, StoreError> {
        let config = &self.inner.config;
        let now = Utc::now();
        let settled_before = ago(now, config.grace);
        let entries = self
            .inner
            .store
            .incomplete_statuses(ago(now, config.lookback), config.batch_limit)
            .await?;

        let mut summary = FixSummary {
            scanned: entries.len(),
            ..FixSummary::default()
        };
        for (listed, msg) in entries {
            if listed.broadcast_at > settled_before {
                summary.skipped += 1;
                continue;
            }
            // a worker may have finished it since the listing
            let status = match self.inner.store.status(listed.message_id).await? {
                Some(status) if status.status != DeliveryState::Completed => status,
                _ => {
                    summary.skipped += 1;
                    continue;
                }
            };

            let missing = status.missing();
            debug!(message_id = %status.message_id, ?missing, "reconciler: re-driving");
            let mut all_ok = true;
            for step in missing {
                all_ok &= self.inner.pipeline.redrive(step, &msg).await;
            }

            let done = all_ok
                && self
                    .inner
                    .store
                    .status(status.message_id)
                    .await?
                    .is_some_and(|s| s.status == DeliveryState::Completed);
            if done {
                summary.repaired += 1;
            } else {
                summary.still_pending += 1;
            }
        }

        if summary.repaired > 0 || summary.still_pending > 0 {
            info!(
                scanned = summary.scanned,
                repaired = summary.repaired,
                still_pending = summary.still_pending,
                "reconciler: pass finished"
            );
        }
        Ok(summary)
    }

    pub fn status(&self) -> ReconcilerStatus {
        let config = &self.inner.config;
        let last = self
            .inner
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        ReconcilerStatus {
            enabled: config.enabled,
            check_interval: humantime::format_duration(config.interval).to_string(),
            grace: humantime::format_duration(config.grace).to_string(),
            lookback: humantime::format_duration(config.lookback).to_string(),
            running: self.inner.running.load(Ordering::SeqCst),
            last_run: last.as_ref().map(|(at, _)| *at),
            last_summary: last.map(|(_, summary)| summary),
        }
    }

    /// Periodic fix and retention purge until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        if !self.inner.config.enabled {
            info!("reconciler: disabled");
            return;
        }
        info!(
            "reconciler: running every {}",
            humantime::format_duration(self.inner.config.interval)
        );

        let mut tick = tokio::time::interval(self.inner.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler: stopped");
                    return;
                }
                _ = tick.tick() => {}
            }

            if let Err(e) = self.fix().await {
                error!("reconciler: pass failed: {}", e);
            }
            let before = ago(Utc::now(), self.inner.config.retention);
            match self.inner.store.purge_completed_statuses(before).await {
                Ok(0) => {}
                Ok(n) => debug!("reconciler: purged {} completed status documents", n),
                Err(e) => warn!("reconciler: purge failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Accepted;
    use crate::testing::Fixture;
    use chatline_types::models::RoomType;

    fn reconciler(fx: &Fixture, grace: Duration) -> Reconciler {
        Reconciler::new(
            fx.store.clone(),
            fx.pipeline.clone(),
            ReconcilerConfig {
                grace,
                ..ReconcilerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn lost_store_write_is_found_and_repaired() {
        let fx = Fixture::new().await;
        let room = fx.room(RoomType::Open);
        let alice = fx.user("alice");
        let _a = fx.connect(room, alice).await;
        let reconciler = reconciler(&fx, Duration::ZERO);

        fx.messages.fail_saves(true);
        let Accepted::Message(msg) = fx.say(room, alice, "lost").await.unwrap() else {
            panic!("expected a message");
        };
        fx.wait_for(msg.id, |s| s.status == DeliveryState::Failed && s.saved_to_cache && s.notified)
            .await;

        let report = reconciler.scan(Duration::from_secs(3600), 100).await.unwrap();
        assert_eq!(report.statistics.total_phantoms, 1);
        assert_eq!(report.statistics.time_range, "1h");
        assert_eq!(
            report.categories,
            PhantomCategories {
                db_not_saved: 1,
                cache_not_saved: 0,
                notification_not_sent: 0,
            }
        );
        assert!(!report.phantom_messages[0].saved_to_store);

        fx.messages.fail_saves(false);
        let summary = reconciler.fix().await.unwrap();
        assert_eq!(summary.repaired, 1);
        assert_eq!(summary.still_pending, 0);

        let status = fx.store.status(msg.id).await.unwrap().unwrap();
        assert_eq!(status.status, DeliveryState::Completed);
        assert_eq!(fx.db.message_count(room).unwrap(), 1);
        assert_eq!(reconciler.scan(Duration::from_secs(3600), 100).await.unwrap().statistics.total_phantoms, 0);
    }

    #[tokio::test]
    async fn fix_does_not_touch_completed_entries() {
        let fx = Fixture::new().await;
        let room = fx.room(RoomType::Open);
        let alice = fx.user("alice");
        let _a = fx.connect(room, alice).await;
        let reconciler = reconciler(&fx, Duration::ZERO);

        let Accepted::Message(msg) = fx.say(room, alice, "fine").await.unwrap() else {
            panic!("expected a message");
        };
        fx.wait_completed(msg.id).await;
        let saves = fx.messages.saves();

        for _ in 0..2 {
            let summary = reconciler.fix().await.unwrap();
            assert_eq!(summary, FixSummary::default());
        }
        assert_eq!(fx.messages.saves(), saves);
        assert_eq!(fx.cache.len(room), 1);
    }

    #[tokio::test]
    async fn young_entries_are_left_to_the_workers() {
        let fx = Fixture::new().await;
        let room = fx.room(RoomType::Open);
        let alice = fx.user("alice");
        let _a = fx.connect(room, alice).await;
        let reconciler = reconciler(&fx, Duration::from_secs(3600));

        fx.messages.fail_saves(true);
        let Accepted::Message(msg) = fx.say(room, alice, "too fresh").await.unwrap() else {
            panic!("expected a message");
        };
        fx.wait_for(msg.id, |s| s.status == DeliveryState::Failed).await;
        fx.messages.fail_saves(false);

        let summary = reconciler.fix().await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(fx.messages.saves(), 0);

        let status = reconciler.status();
        assert!(status.enabled && !status.running);
        assert_eq!(status.check_interval, "1m");
        assert_eq!(status.last_summary, Some(summary));
    }

    #[tokio::test]
    async fn concurrent_fixes_write_once() {
        let fx = Fixture::new().await;
        let room = fx.room(RoomType::Open);
        let alice = fx.user("alice");
        let _a = fx.connect(room, alice).await;
        let reconciler = reconciler(&fx, Duration::ZERO);

        fx.messages.fail_saves(true);
        let Accepted::Message(msg) = fx.say(room, alice, "once").await.unwrap() else {
            panic!("expected a message");
        };
        fx.wait_for(msg.id, |s| s.status == DeliveryState::Failed && s.saved_to_cache && s.notified)
            .await;
        fx.messages.fail_saves(false);

        let (a, b) = tokio::join!(reconciler.fix(), reconciler.fix());
        assert_eq!(a.unwrap().repaired + b.unwrap().repaired, 1);
        assert_eq!(fx.messages.saves(), 1);
    }
}
