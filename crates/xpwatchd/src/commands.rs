//! Typed command surface consumed by the HTTP routes.
//!
//! These are the daemon-side halves of the user commands: subscription
//! management, watchlist listings, and tracker start/stop. Input validation
//! happens here, synchronously, before any state is touched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use xpwatch_common::store::Unsubscribe;

use crate::fetch::CharacterSource;
use crate::notify::Notifier;
use crate::registry::{CancelError, StartError, TrackerRegistry};
use crate::tracker::TrackerSession;
use crate::SharedStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("character id must be numeric")]
    InvalidId,
    #[error("unknown id or API unavailable")]
    SubjectUnavailable,
    #[error(transparent)]
    TrackerStart(#[from] StartError),
    #[error(transparent)]
    TrackerCancel(#[from] CancelError),
}

/// Result of a subscribe command.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeOutcome {
    pub name: String,
    pub level: u32,
    pub already_following: bool,
}

/// One row of a watchlist listing.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectSummary {
    pub id: String,
    pub name: Option<String>,
    pub level: u32,
    pub experience: i64,
    pub last_update: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub subscribers: Vec<u64>,
}

fn validate_id(id: &str) -> Result<(), CommandError> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CommandError::InvalidId);
    }
    Ok(())
}

/// Command executor shared by all routes.
pub struct Commands<F: CharacterSource> {
    store: SharedStore,
    client: Arc<F>,
    notifier: Notifier,
    registry: Arc<TrackerRegistry>,
    tracker_tick: Duration,
    tracker_duration: Duration,
}

impl<F: CharacterSource> Commands<F> {
    pub fn new(
        store: SharedStore,
        client: Arc<F>,
        notifier: Notifier,
        registry: Arc<TrackerRegistry>,
        tracker_tick: Duration,
        tracker_duration: Duration,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            registry,
            tracker_tick,
            tracker_duration,
        }
    }

    /// Start following an id. The id is validated against the remote API and
    /// the cache is seeded/refreshed from the fetch. With `notify = false`
    /// the id is polled but the caller is not added as a subscriber.
    pub async fn subscribe(
        &self,
        id: &str,
        user_id: u64,
        note: Option<String>,
        notify: bool,
    ) -> Result<SubscribeOutcome, CommandError> {
        validate_id(id)?;

        let info = self
            .client
            .fetch(id)
            .await
            .ok_or(CommandError::SubjectUnavailable)?;

        let mut store = self.store.write().await;
        let already_following = if notify {
            !store.add_subscriber(id, user_id)
        } else {
            store.ensure_watched(id);
            false
        };
        store.record_change(id, &info, Utc::now());
        if note.is_some() {
            store.set_note(id, note);
        }
        if let Err(e) = store.save_all() {
            warn!("Failed to persist subscription for {}: {}", id, e);
        }

        let name = if info.name.is_empty() {
            "Unknown".to_string()
        } else {
            info.name.clone()
        };
        info!(
            "User {} now follows {} ({}), notify={}",
            user_id, name, id, notify
        );

        Ok(SubscribeOutcome {
            name,
            level: info.level,
            already_following,
        })
    }

    /// Stop following an id. All outcomes (including "wasn't following") are
    /// reported to the caller; only actual removals are persisted.
    pub async fn unsubscribe(&self, id: &str, user_id: u64) -> Unsubscribe {
        let mut store = self.store.write().await;
        let outcome = store.unsubscribe(id, user_id);

        match outcome {
            Unsubscribe::Purged | Unsubscribe::Removed | Unsubscribe::RemovedLast => {
                if let Err(e) = store.save_all() {
                    warn!("Failed to persist unsubscribe for {}: {}", id, e);
                }
                info!("User {} unsubscribed from {}: {:?}", user_id, id, outcome);
            }
            Unsubscribe::NotSubscribed | Unsubscribe::NotWatched => {}
        }

        outcome
    }

    /// Subjects the given user follows.
    pub async fn list_mine(&self, user_id: u64) -> Vec<SubjectSummary> {
        let ids = self.store.read().await.ids_for_user(user_id);
        self.summaries(ids).await
    }

    /// Every watched subject.
    pub async fn list_all(&self) -> Vec<SubjectSummary> {
        let ids = self.store.read().await.watched_ids();
        self.summaries(ids).await
    }

    /// Build listing rows, resolving unknown names via the API. Resolution
    /// is a read-only lookup and must not advance `last_update`.
    async fn summaries(&self, ids: Vec<String>) -> Vec<SubjectSummary> {
        let mut resolved_any = false;
        for id in &ids {
            let name_known = self
                .store
                .read()
                .await
                .subject(id)
                .map(|s| s.name.is_some())
                .unwrap_or(false);
            if name_known {
                continue;
            }
            if let Some(info) = self.client.fetch(id).await {
                self.store.write().await.resolve_name(id, &info);
                resolved_any = true;
            }
        }

        let store = self.store.read().await;
        if resolved_any {
            if let Err(e) = store.save_subjects() {
                warn!("Failed to persist resolved names: {}", e);
            }
        }

        ids.into_iter()
            .map(|id| {
                let subject = store.subject(&id);
                SubjectSummary {
                    subscribers: store.subscribers(&id),
                    name: subject.and_then(|s| s.name.clone()),
                    level: subject.map(|s| s.level).unwrap_or(0),
                    experience: subject.map(|s| s.experience).unwrap_or(0),
                    last_update: subject.and_then(|s| s.last_update),
                    note: subject.and_then(|s| s.note.clone()),
                    id,
                }
            })
            .collect()
    }

    /// Start a precise tracker for a context. At most one per context; the
    /// slot is claimed before the session task is spawned.
    pub async fn start_tracker(&self, context: u64, base_id: &str) -> Result<(), CommandError> {
        validate_id(base_id)?;

        let cancel = self.registry.claim(context).await?;
        let session = TrackerSession::new(
            context,
            base_id,
            self.client.clone(),
            self.notifier.clone(),
            self.tracker_tick,
            self.tracker_duration,
            cancel,
            self.registry.clone(),
        );
        tokio::spawn(session.run());
        Ok(())
    }

    /// Request cooperative cancellation of the context's tracker.
    pub async fn stop_tracker(&self, context: u64) -> Result<(), CommandError> {
        self.registry.cancel(context).await?;
        Ok(())
    }

    pub async fn watched_count(&self) -> usize {
        self.store.read().await.watched_ids().len()
    }

    pub async fn active_trackers(&self) -> usize {
        self.registry.active_count().await
    }
}
