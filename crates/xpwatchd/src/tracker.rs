//! Precise tracker: a bounded, high-frequency scan across an id family.
//!
//! Some base ids name combat instances whose last three decimal digits
//! enumerate related shard records; the one that actually accrues XP is
//! unknown in advance. The tracker round-robins suffixes 001..999 at a fast
//! tick for a fixed window and reports only upward movement.
//!
//! `TrackerScan` is the deterministic core; `TrackerSession` is the thin
//! async shell around it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};
use xpwatch_common::CharacterInfo;

use crate::fetch::CharacterSource;
use crate::notify::{DispatcherClosed, Notifier, TrackerEvent};
use crate::registry::TrackerRegistry;

/// Derived probe id: same prefix, suffix zero-padded to 3 digits. Bases
/// shorter than 3 digits are probed unmodified.
pub fn probe_id(base: &str, suffix: u16) -> String {
    if base.len() < 3 {
        base.to_string()
    } else {
        format!("{}{:03}", &base[..base.len() - 3], suffix)
    }
}

/// Rotating scan state for one session.
pub struct TrackerScan {
    base_id: String,
    counter: u16,
    last_xp: Option<i64>,
    last_increase_at: Option<Instant>,
    name: Option<String>,
    increases: u32,
}

impl TrackerScan {
    pub fn new(base_id: &str) -> Self {
        Self {
            base_id: base_id.to_string(),
            counter: 1,
            last_xp: None,
            last_increase_at: None,
            name: None,
            increases: 0,
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    pub fn increases(&self) -> u32 {
        self.increases
    }

    /// First non-empty name seen wins permanently; family members may vary
    /// in name and the display must stay stable.
    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "Unknown".to_string())
    }

    /// Next probe id; the counter advances 1 -> ... -> 999 -> 1 regardless
    /// of fetch outcomes.
    pub fn next_probe_id(&mut self) -> String {
        let id = probe_id(&self.base_id, self.counter);
        self.counter = self.counter % 999 + 1;
        id
    }

    /// Feed one probe result into the scan.
    ///
    /// Baseline on the first value ever seen; an increase against the last
    /// observed value reports the delta with elapsed time since the previous
    /// increase (or the baseline); decreases and absences are silent.
    pub fn observe(
        &mut self,
        probe_id: &str,
        result: Option<&CharacterInfo>,
        now: Instant,
    ) -> Option<TrackerEvent> {
        let info = result?;

        if self.name.is_none() && !info.name.is_empty() {
            self.name = Some(info.name.clone());
        }

        match self.last_xp {
            None => {
                self.last_xp = Some(info.experience);
                self.last_increase_at = Some(now);
                Some(TrackerEvent::Baseline {
                    probe_id: probe_id.to_string(),
                    name: self.display_name(),
                    experience: info.experience,
                })
            }
            Some(last) if info.experience > last => {
                let since = self.last_increase_at.unwrap_or(now);
                let delta = info.experience - last;
                self.last_xp = Some(info.experience);
                self.last_increase_at = Some(now);
                self.increases += 1;
                Some(TrackerEvent::Increase {
                    probe_id: probe_id.to_string(),
                    name: self.display_name(),
                    delta,
                    total: info.experience,
                    elapsed: now - since,
                })
            }
            // Lower value: a different shard or stale data, not a regression
            // of the tracked total.
            Some(_) => None,
        }
    }
}

enum Outcome {
    Expired,
    Cancelled,
    Failed(String),
}

/// One running tracker session. Owns its scan state exclusively; nothing is
/// shared with other sessions or the reconciliation loop.
pub struct TrackerSession<F: CharacterSource> {
    context: u64,
    scan: TrackerScan,
    client: Arc<F>,
    notifier: Notifier,
    tick: Duration,
    deadline: Instant,
    cancel: watch::Receiver<bool>,
    registry: Arc<TrackerRegistry>,
}

impl<F: CharacterSource> TrackerSession<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: u64,
        base_id: &str,
        client: Arc<F>,
        notifier: Notifier,
        tick: Duration,
        duration: Duration,
        cancel: watch::Receiver<bool>,
        registry: Arc<TrackerRegistry>,
    ) -> Self {
        Self {
            context,
            scan: TrackerScan::new(base_id),
            client,
            notifier,
            tick,
            deadline: Instant::now() + duration,
            cancel,
            registry,
        }
    }

    /// Run to completion. Exactly one `Completed` event is emitted on every
    /// exit path, and the registry slot is vacated last.
    pub async fn run(mut self) {
        info!(
            "Precise tracker started: context={} base={}",
            self.context,
            self.scan.base_id()
        );
        let _ = self.notifier.tracker(
            self.context,
            TrackerEvent::Started {
                base_id: self.scan.base_id().to_string(),
            },
        );

        match self.scan_loop().await {
            Outcome::Expired => {
                info!("Precise tracker expired: context={}", self.context);
            }
            Outcome::Cancelled => {
                info!("Precise tracker cancelled: context={}", self.context);
                let _ = self
                    .notifier
                    .tracker(self.context, TrackerEvent::Interrupted);
            }
            Outcome::Failed(message) => {
                error!(
                    "Precise tracker failed: context={}: {}",
                    self.context, message
                );
                let _ = self
                    .notifier
                    .tracker(self.context, TrackerEvent::Error { message });
            }
        }

        let _ = self.notifier.tracker(
            self.context,
            TrackerEvent::Completed {
                increases: self.scan.increases(),
            },
        );
        self.registry.vacate(self.context).await;
    }

    async fn scan_loop(&mut self) -> Outcome {
        loop {
            if Instant::now() >= self.deadline {
                return Outcome::Expired;
            }
            if *self.cancel.borrow() {
                return Outcome::Cancelled;
            }

            if let Err(e) = self.tick_once().await {
                return Outcome::Failed(e.to_string());
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                // A dropped sender means the slot is gone; stop as if
                // cancelled rather than scanning unsupervised.
                _ = self.cancel.changed() => return Outcome::Cancelled,
            }
        }
    }

    async fn tick_once(&mut self) -> Result<(), DispatcherClosed> {
        let probe = self.scan.next_probe_id();
        let result = self.client.fetch(&probe).await;
        if let Some(event) = self.scan.observe(&probe, result.as_ref(), Instant::now()) {
            self.notifier.tracker(self.context, event)?;
        }
        Ok(())
    }
}
