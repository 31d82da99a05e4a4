//! Reconciliation loop: poll every watched id, diff against the cached
//! subject, and emit change events.
//!
//! The comparison itself is a pure function (`plan`) so the change policy
//! can be tested without a runtime; the loop is a thin shell around it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use xpwatch_common::{CharacterInfo, Subject};

use crate::fetch::CharacterSource;
use crate::notify::{Notification, Notifier, WebhookDispatcher};
use crate::SharedStore;

/// Lifecycle of the loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingForReady,
    Running,
    Stopped,
}

/// What one fetched value means for the cached subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// First sight: cache as baseline, no notification.
    Seed,
    /// Experience moved in either direction.
    XpChange { before: i64 },
    /// Experience held still but the level moved.
    LevelUp { prev_level: u32 },
    None,
}

/// Decide what a freshly fetched value means for the cached subject.
pub fn plan(current: Option<&Subject>, info: &CharacterInfo) -> Action {
    let Some(subject) = current else {
        return Action::Seed;
    };

    if info.experience != subject.experience {
        return Action::XpChange {
            before: subject.experience,
        };
    }

    if info.level != subject.level {
        return Action::LevelUp {
            prev_level: subject.level,
        };
    }

    Action::None
}

/// Display name for notifications: the fetched name, falling back to the
/// cached one when the API returns an empty string.
fn display_name(info: &CharacterInfo, current: Option<&Subject>) -> String {
    if !info.name.is_empty() {
        return info.name.clone();
    }
    current
        .and_then(|s| s.name.clone())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// The continuous polling engine.
pub struct ReconcileLoop<F: CharacterSource> {
    store: SharedStore,
    client: Arc<F>,
    notifier: Notifier,
    dispatcher: WebhookDispatcher,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
    state: LoopState,
}

impl<F: CharacterSource> ReconcileLoop<F> {
    pub fn new(
        store: SharedStore,
        client: Arc<F>,
        notifier: Notifier,
        dispatcher: WebhookDispatcher,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            dispatcher,
            poll_interval,
            shutdown,
            state: LoopState::WaitingForReady,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Resolve the delivery channel, then poll until shutdown. An
    /// unresolvable channel is fatal: logged once, never retried.
    pub async fn run(mut self) {
        if let Err(e) = self.dispatcher.resolve().await {
            error!("Notification channel unresolvable: {}; reconciliation loop will not start", e);
            self.state = LoopState::Stopped;
            return;
        }

        self.state = LoopState::Running;
        info!(
            "Reconciliation loop running (poll interval {:?})",
            self.poll_interval
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.run_pass().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.state = LoopState::Stopped;
        info!("Reconciliation loop stopped");
    }

    /// One pass over a stable snapshot of the watched ids. Failures are
    /// isolated per id; every snapshotted id is visited.
    pub async fn run_pass(&self) {
        let ids = self.store.read().await.watched_ids();

        for id in ids {
            self.reconcile_one(&id).await;
        }
    }

    async fn reconcile_one(&self, id: &str) {
        let Some(info) = self.client.fetch(id).await else {
            // Absent this cycle; the next pass retries.
            return;
        };

        let mut store = self.store.write().await;
        match plan(store.subject(id), &info) {
            Action::Seed => {
                store.seed(id, &info);
                if let Err(e) = store.save_subjects() {
                    warn!("Failed to persist state for {}: {}", id, e);
                }
                debug!("Seeded {} at {} XP", id, info.experience);
            }
            Action::XpChange { before } => {
                let name = display_name(&info, store.subject(id));
                store.record_change(id, &info, Utc::now());
                if let Err(e) = store.save_subjects() {
                    warn!("Failed to persist state for {}: {}", id, e);
                }
                let subscribers = store.subscribers(id);
                drop(store);

                info!(
                    "XP change for {} ({}): {} -> {}",
                    name, id, before, info.experience
                );
                if self
                    .notifier
                    .send(Notification::XpChange {
                        subject_id: id.to_string(),
                        before,
                        after: info.experience,
                        name,
                        level: info.level,
                        subscribers,
                    })
                    .is_err()
                {
                    warn!("Dispatcher gone, XP change for {} not delivered", id);
                }
            }
            Action::LevelUp { prev_level } => {
                let name = display_name(&info, store.subject(id));
                store.record_level(id, info.level, Utc::now());
                if let Err(e) = store.save_subjects() {
                    warn!("Failed to persist state for {}: {}", id, e);
                }
                let subscribers = store.subscribers(id);
                drop(store);

                info!(
                    "Level up for {} ({}): {} -> {}",
                    name, id, prev_level, info.level
                );
                if self
                    .notifier
                    .send(Notification::LevelUp {
                        subject_id: id.to_string(),
                        name,
                        prev_level,
                        new_level: info.level,
                        subscribers,
                    })
                    .is_err()
                {
                    warn!("Dispatcher gone, level up for {} not delivered", id);
                }
            }
            Action::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::RwLock;
    use xpwatch_common::SubjectStore;

    fn info(name: &str, level: u32, experience: i64) -> CharacterInfo {
        CharacterInfo {
            name: name.to_string(),
            level,
            experience,
        }
    }

    fn subject(level: u32, experience: i64) -> Subject {
        Subject {
            experience,
            name: Some("Ryn".to_string()),
            level,
            last_update: None,
            note: None,
        }
    }

    #[test]
    fn first_sight_seeds_without_change() {
        assert_eq!(plan(None, &info("Ryn", 3, 100)), Action::Seed);
    }

    #[test]
    fn xp_gain_and_loss_both_trigger() {
        let cached = subject(3, 100);
        assert_eq!(
            plan(Some(&cached), &info("Ryn", 3, 150)),
            Action::XpChange { before: 100 }
        );
        assert_eq!(
            plan(Some(&cached), &info("Ryn", 3, 50)),
            Action::XpChange { before: 100 }
        );
    }

    #[test]
    fn level_change_without_xp_change_is_level_up() {
        let cached = subject(3, 100);
        assert_eq!(
            plan(Some(&cached), &info("Ryn", 4, 100)),
            Action::LevelUp { prev_level: 3 }
        );
    }

    #[test]
    fn xp_change_wins_over_level_change() {
        let cached = subject(3, 100);
        assert_eq!(
            plan(Some(&cached), &info("Ryn", 4, 200)),
            Action::XpChange { before: 100 }
        );
    }

    #[test]
    fn unchanged_state_is_a_no_op() {
        let cached = subject(3, 100);
        assert_eq!(plan(Some(&cached), &info("Ryn", 3, 100)), Action::None);
    }

    #[test]
    fn display_name_falls_back_to_cached() {
        let cached = subject(3, 100);
        assert_eq!(display_name(&info("", 3, 100), Some(&cached)), "Ryn");
        assert_eq!(display_name(&info("", 3, 100), None), "Unknown");
        assert_eq!(display_name(&info("Zel", 3, 100), Some(&cached)), "Zel");
    }

    /// Scripted source: per-id queue of responses, then absent forever.
    struct SeqSource {
        responses: Mutex<HashMap<String, VecDeque<Option<CharacterInfo>>>>,
    }

    impl SeqSource {
        fn new(script: Vec<(&str, Vec<Option<CharacterInfo>>)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    script
                        .into_iter()
                        .map(|(id, seq)| (id.to_string(), seq.into_iter().collect()))
                        .collect(),
                ),
            })
        }
    }

    impl CharacterSource for SeqSource {
        fn fetch(&self, id: &str) -> impl std::future::Future<Output = Option<CharacterInfo>> + Send {
            let next = self
                .responses
                .lock()
                .unwrap()
                .get_mut(id)
                .and_then(|q| q.pop_front())
                .flatten();
            async move { next }
        }
    }

    fn make_loop<F: CharacterSource>(
        store: SharedStore,
        source: Arc<F>,
    ) -> (
        ReconcileLoop<F>,
        tokio::sync::mpsc::UnboundedReceiver<Notification>,
    ) {
        let (notifier, rx) = notify::channel();
        let dispatcher = WebhookDispatcher::new("").unwrap();
        let (_tx, shutdown) = watch::channel(false);
        let engine = ReconcileLoop::new(
            store,
            source,
            notifier,
            dispatcher,
            Duration::from_millis(1),
            shutdown,
        );
        (engine, rx)
    }

    #[tokio::test]
    async fn pass_seeds_then_notifies_on_change() {
        let mut store = SubjectStore::in_memory();
        store.add_subscriber("123", 42);
        let store: SharedStore = Arc::new(RwLock::new(store));

        let source = SeqSource::new(vec![(
            "123",
            vec![Some(info("Ryn", 3, 100)), Some(info("Ryn", 3, 160))],
        )]);
        let (engine, mut rx) = make_loop(store.clone(), source);

        engine.run_pass().await;
        assert!(rx.try_recv().is_err(), "first sight must not notify");
        assert_eq!(store.read().await.subject("123").unwrap().experience, 100);

        engine.run_pass().await;
        match rx.try_recv().unwrap() {
            Notification::XpChange {
                before,
                after,
                subscribers,
                ..
            } => {
                assert_eq!(before, 100);
                assert_eq!(after, 160);
                assert_eq!(subscribers, vec![42]);
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "exactly one event per change");
    }

    #[tokio::test]
    async fn absent_fetch_skips_without_state_change() {
        let mut store = SubjectStore::in_memory();
        store.add_subscriber("123", 42);
        store.seed("123", &info("Ryn", 3, 100));
        let store: SharedStore = Arc::new(RwLock::new(store));

        let source = SeqSource::new(vec![("123", vec![None])]);
        let (engine, mut rx) = make_loop(store.clone(), source);

        engine.run_pass().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(store.read().await.subject("123").unwrap().experience, 100);
    }

    #[tokio::test]
    async fn one_bad_id_does_not_block_the_rest() {
        let mut store = SubjectStore::in_memory();
        store.add_subscriber("111", 1);
        store.add_subscriber("222", 2);
        store.seed("111", &info("A", 1, 10));
        store.seed("222", &info("B", 1, 20));
        let store: SharedStore = Arc::new(RwLock::new(store));

        let source = SeqSource::new(vec![
            ("111", vec![None]),
            ("222", vec![Some(info("B", 1, 25))]),
        ]);
        let (engine, mut rx) = make_loop(store.clone(), source);

        engine.run_pass().await;
        match rx.try_recv().unwrap() {
            Notification::XpChange { subject_id, .. } => assert_eq!(subject_id, "222"),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn level_up_emits_distinct_event() {
        let mut store = SubjectStore::in_memory();
        store.add_subscriber("123", 42);
        store.seed("123", &info("Ryn", 3, 100));
        let store: SharedStore = Arc::new(RwLock::new(store));

        let source = SeqSource::new(vec![("123", vec![Some(info("Ryn", 4, 100))])]);
        let (engine, mut rx) = make_loop(store.clone(), source);

        engine.run_pass().await;
        match rx.try_recv().unwrap() {
            Notification::LevelUp {
                prev_level,
                new_level,
                ..
            } => {
                assert_eq!(prev_level, 3);
                assert_eq!(new_level, 4);
            }
            other => panic!("unexpected notification: {:?}", other),
        }

        let guard = store.read().await;
        let subject = guard.subject("123").unwrap();
        assert_eq!(subject.level, 4);
        assert!(subject.last_update.is_some());
    }
}
