use crate::{
    chat::ChatStatus,
    error::{Error, Result},
    lifecycle::ChatLifecycle,
    store::ChatStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: Vec<String>,
    pub failed: Vec<String>,
}

/// Force-closes engaged chats nobody has written to for longer than the threshold.
pub struct IdleReaper {
    chats: Arc<dyn ChatStore>,
    lifecycle: Arc<ChatLifecycle>,
    settings: ReaperSettings,
}

impl IdleReaper {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        lifecycle: Arc<ChatLifecycle>,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            chats,
            lifecycle,
            settings,
        }
    }

    /// One pass. A failure on one chat is logged and the pass moves on.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let threshold = chrono::Duration::from_std(self.settings.idle_threshold)
            .map_err(|e| Error::validation("idle threshold", e.to_string()))?;
        let cutoff = now - threshold;

        let idle = self
            .chats
            .find_idle(&ChatStatus::ENGAGED, cutoff)
            .await?;

        let mut report = SweepReport::default();
        for chat in idle {
            match self.lifecycle.close(&chat.id).await {
                Ok(_) => report.closed.push(chat.id),
                Err(e) => {
                    warn!(chat_id = %chat.id, error = %e, "Failed to close idle chat");
                    report.failed.push(chat.id);
                }
            }
        }

        if !report.closed.is_empty() || !report.failed.is_empty() {
            info!(
                closed = report.closed.len(),
                failed = report.failed.len(),
                "Idle sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep on a fixed interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.settings.interval.as_secs(),
            idle_secs = self.settings.idle_threshold.as_secs(),
            "Idle reaper started"
        );

        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "Idle sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Idle reaper stopped");
                        return;
                    }
                }
            }
        }
    }
}
