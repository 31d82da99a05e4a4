//! Watched-subject store and its on-disk persistence.
//!
//! One store owns both halves of the tracked state:
//! - subjects: id -> last known {experience, level, name, last_update, note}
//! - watchlist: id -> set of subscriber ids
//!
//! The reconciliation loop owns the {experience, level, name, last_update}
//! fields (seed/record/resolve); subscription commands own the subscriber
//! sets and whole-subject insert/remove. The API is deliberately narrow so
//! neither side can clobber the other's fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::character::CharacterInfo;

/// Cached last-known state for one watched character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// Last known experience value. Kept as `last_xp` on disk for
    /// compatibility with existing state files.
    #[serde(rename = "last_xp")]
    pub experience: i64,

    /// Last known display name, unresolved until first seen.
    #[serde(default)]
    pub name: Option<String>,

    /// Last known level.
    #[serde(default)]
    pub level: u32,

    /// Stamp of the last value-changing reconciliation. Read-only name
    /// resolution never advances this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,

    /// Subscriber-supplied annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Subject {
    fn from_info(info: &CharacterInfo) -> Self {
        Self {
            experience: info.experience,
            name: if info.name.is_empty() {
                None
            } else {
                Some(info.name.clone())
            },
            level: info.level,
            last_update: None,
            note: None,
        }
    }
}

/// Outcome of removing a subscriber from a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsubscribe {
    /// The subject had no subscribers at all and was removed outright.
    Purged,
    /// The caller was removed; other subscribers remain.
    Removed,
    /// The caller was the last subscriber; subject and watch entry deleted.
    RemovedLast,
    /// The caller was not subscribed to this subject.
    NotSubscribed,
    /// The id is not known to the store.
    NotWatched,
}

/// The single owned store for subjects and subscriptions.
#[derive(Debug)]
pub struct SubjectStore {
    subjects: HashMap<String, Subject>,
    watchlist: HashMap<String, BTreeSet<u64>>,
    state_file: PathBuf,
    watch_file: PathBuf,
}

impl SubjectStore {
    /// Load both files, migrating the legacy watchlist shape (a bare array
    /// of ids) to id -> empty subscriber set.
    pub fn open(state_file: impl Into<PathBuf>, watch_file: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();
        let watch_file = watch_file.into();

        let subjects: HashMap<String, Subject> = load_json_or_default(&state_file);
        let watchlist = load_watchlist(&watch_file);

        info!(
            "Subject store loaded: {} subjects, {} watched ids",
            subjects.len(),
            watchlist.len()
        );

        Self {
            subjects,
            watchlist,
            state_file,
            watch_file,
        }
    }

    /// In-memory store for tests and dry runs; saves go nowhere useful.
    pub fn in_memory() -> Self {
        Self {
            subjects: HashMap::new(),
            watchlist: HashMap::new(),
            state_file: PathBuf::from("/dev/null"),
            watch_file: PathBuf::from("/dev/null"),
        }
    }

    // ---- reads -------------------------------------------------------------

    /// Ids currently on the watchlist, sorted for a stable iteration order.
    pub fn watched_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.watchlist.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.get(id)
    }

    /// Subscriber ids for a subject; empty when nobody opted into pings.
    pub fn subscribers(&self, id: &str) -> Vec<u64> {
        self.watchlist
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_watched(&self, id: &str) -> bool {
        self.watchlist.contains_key(id)
    }

    /// Ids the given user is subscribed to, sorted.
    pub fn ids_for_user(&self, user_id: u64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .watchlist
            .iter()
            .filter(|(_, users)| users.contains(&user_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ---- loop-owned mutations ---------------------------------------------

    /// First sight of an id: cache the fetched state with `last_update`
    /// unset so the next pass has a baseline to diff against.
    pub fn seed(&mut self, id: &str, info: &CharacterInfo) {
        self.subjects.insert(id.to_string(), Subject::from_info(info));
    }

    /// A value change was detected: overwrite the cached state and stamp it.
    pub fn record_change(&mut self, id: &str, info: &CharacterInfo, now: DateTime<Utc>) {
        let note = self.subjects.get(id).and_then(|s| s.note.clone());
        let mut subject = Subject::from_info(info);
        subject.last_update = Some(now);
        subject.note = note;
        self.subjects.insert(id.to_string(), subject);
    }

    /// Level moved while experience held still.
    pub fn record_level(&mut self, id: &str, level: u32, now: DateTime<Utc>) {
        if let Some(subject) = self.subjects.get_mut(id) {
            subject.level = level;
            subject.last_update = Some(now);
        }
    }

    /// Fill in name/level/experience from a read-only lookup without
    /// advancing `last_update`.
    pub fn resolve_name(&mut self, id: &str, info: &CharacterInfo) {
        let previous = self.subjects.get(id);
        let last_update = previous.and_then(|s| s.last_update);
        let note = previous.and_then(|s| s.note.clone());
        let mut subject = Subject::from_info(info);
        subject.last_update = last_update;
        subject.note = note;
        self.subjects.insert(id.to_string(), subject);
    }

    // ---- command-owned mutations ------------------------------------------

    /// Put an id on the watchlist without subscribing anyone (polled but
    /// never pinged).
    pub fn ensure_watched(&mut self, id: &str) {
        self.watchlist.entry(id.to_string()).or_default();
    }

    /// Add a subscriber; returns false if they were already following.
    pub fn add_subscriber(&mut self, id: &str, user_id: u64) -> bool {
        self.watchlist
            .entry(id.to_string())
            .or_default()
            .insert(user_id)
    }

    pub fn set_note(&mut self, id: &str, note: Option<String>) {
        if let Some(subject) = self.subjects.get_mut(id) {
            subject.note = note;
        }
    }

    /// Remove a subscriber, applying the deletion policy: a subject with no
    /// subscribers is purged outright, and removing the last subscriber
    /// deletes the subject and its watch entry entirely.
    pub fn unsubscribe(&mut self, id: &str, user_id: u64) -> Unsubscribe {
        if let Some(set) = self.watchlist.get_mut(id) {
            if !set.is_empty() {
                if !set.remove(&user_id) {
                    return Unsubscribe::NotSubscribed;
                }
                if !set.is_empty() {
                    return Unsubscribe::Removed;
                }
                self.watchlist.remove(id);
                self.subjects.remove(id);
                return Unsubscribe::RemovedLast;
            }
        }

        // No entry, or an entry nobody subscribed to: purge whatever exists.
        let removed_watch = self.watchlist.remove(id).is_some();
        let removed_state = self.subjects.remove(id).is_some();
        if removed_watch || removed_state {
            Unsubscribe::Purged
        } else {
            Unsubscribe::NotWatched
        }
    }

    // ---- persistence -------------------------------------------------------

    pub fn save_subjects(&self) -> std::io::Result<()> {
        save_json(&self.state_file, &self.subjects)
    }

    pub fn save_watchlist(&self) -> std::io::Result<()> {
        save_json(&self.watch_file, &self.watchlist)
    }

    pub fn save_all(&self) -> std::io::Result<()> {
        self.save_subjects()?;
        self.save_watchlist()
    }
}

fn load_json_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Failed to parse {}: {}, starting empty", path.display(), e);
            T::default()
        }),
        Err(e) => {
            warn!("Failed to read {}: {}, starting empty", path.display(), e);
            T::default()
        }
    }
}

/// Load the watchlist, accepting the legacy shape (a JSON array of id
/// strings) by mapping each id to an empty subscriber set.
fn load_watchlist(path: &Path) -> HashMap<String, BTreeSet<u64>> {
    if !path.exists() {
        return HashMap::new();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {}: {}, starting empty", path.display(), e);
            return HashMap::new();
        }
    };

    if let Ok(map) = serde_json::from_str::<HashMap<String, BTreeSet<u64>>>(&content) {
        return map;
    }

    match serde_json::from_str::<Vec<String>>(&content) {
        Ok(ids) => {
            info!(
                "Migrating legacy watchlist ({} ids, no subscribers)",
                ids.len()
            );
            ids.into_iter().map(|id| (id, BTreeSet::new())).collect()
        }
        Err(e) => {
            warn!("Failed to parse {}: {}, starting empty", path.display(), e);
            HashMap::new()
        }
    }
}

fn save_json<T: Serialize>(path: &Path, data: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(data)?;
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, level: u32, experience: i64) -> CharacterInfo {
        CharacterInfo {
            name: name.to_string(),
            level,
            experience,
        }
    }

    #[test]
    fn seed_leaves_last_update_unset() {
        let mut store = SubjectStore::in_memory();
        store.seed("123", &info("Ryn", 10, 1000));
        let subject = store.subject("123").unwrap();
        assert_eq!(subject.experience, 1000);
        assert!(subject.last_update.is_none());
    }

    #[test]
    fn record_change_stamps_and_keeps_note() {
        let mut store = SubjectStore::in_memory();
        store.seed("123", &info("Ryn", 10, 1000));
        store.set_note("123", Some("main char".to_string()));

        let now = Utc::now();
        store.record_change("123", &info("Ryn", 11, 1500), now);

        let subject = store.subject("123").unwrap();
        assert_eq!(subject.experience, 1500);
        assert_eq!(subject.level, 11);
        assert_eq!(subject.last_update, Some(now));
        assert_eq!(subject.note.as_deref(), Some("main char"));
    }

    #[test]
    fn resolve_name_preserves_last_update() {
        let mut store = SubjectStore::in_memory();
        let stamp = Utc::now();
        store.seed("123", &info("", 0, 500));
        store.record_change("123", &info("", 5, 600), stamp);

        store.resolve_name("123", &info("Ryn", 6, 700));

        let subject = store.subject("123").unwrap();
        assert_eq!(subject.name.as_deref(), Some("Ryn"));
        assert_eq!(subject.experience, 700);
        assert_eq!(subject.last_update, Some(stamp));
    }

    #[test]
    fn add_subscriber_deduplicates() {
        let mut store = SubjectStore::in_memory();
        assert!(store.add_subscriber("123", 42));
        assert!(!store.add_subscriber("123", 42));
        assert_eq!(store.subscribers("123"), vec![42]);
    }

    #[test]
    fn unsubscribe_last_removes_everything() {
        let mut store = SubjectStore::in_memory();
        store.seed("123", &info("Ryn", 1, 10));
        store.add_subscriber("123", 42);

        assert_eq!(store.unsubscribe("123", 42), Unsubscribe::RemovedLast);
        assert!(store.subject("123").is_none());
        assert!(!store.is_watched("123"));
    }

    #[test]
    fn unsubscribe_keeps_remaining_subscribers() {
        let mut store = SubjectStore::in_memory();
        store.add_subscriber("123", 1);
        store.add_subscriber("123", 2);

        assert_eq!(store.unsubscribe("123", 1), Unsubscribe::Removed);
        assert_eq!(store.subscribers("123"), vec![2]);
    }

    #[test]
    fn unsubscribe_purges_zero_subscriber_subject() {
        let mut store = SubjectStore::in_memory();
        store.ensure_watched("123");
        store.seed("123", &info("Ryn", 1, 10));

        assert_eq!(store.unsubscribe("123", 999), Unsubscribe::Purged);
        assert!(!store.is_watched("123"));
        assert!(store.subject("123").is_none());
    }

    #[test]
    fn unsubscribe_unknown_id() {
        let mut store = SubjectStore::in_memory();
        assert_eq!(store.unsubscribe("nope", 1), Unsubscribe::NotWatched);
    }

    #[test]
    fn unsubscribe_not_following() {
        let mut store = SubjectStore::in_memory();
        store.add_subscriber("123", 1);
        assert_eq!(store.unsubscribe("123", 2), Unsubscribe::NotSubscribed);
        assert_eq!(store.subscribers("123"), vec![1]);
    }

    #[test]
    fn watched_ids_are_sorted() {
        let mut store = SubjectStore::in_memory();
        store.ensure_watched("30");
        store.ensure_watched("1");
        store.ensure_watched("200");
        assert_eq!(store.watched_ids(), vec!["1", "200", "30"]);
    }

    #[test]
    fn legacy_watchlist_array_migrates_to_empty_sets() {
        let dir = tempfile::tempdir().unwrap();
        let watch_file = dir.path().join("xp_targets.json");
        std::fs::write(&watch_file, r#"["111", "222"]"#).unwrap();

        let store = SubjectStore::open(dir.path().join("xp_state.json"), &watch_file);
        assert_eq!(store.watched_ids(), vec!["111", "222"]);
        assert!(store.subscribers("111").is_empty());
        assert!(store.subscribers("222").is_empty());
    }

    #[test]
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("xp_state.json");
        let watch_file = dir.path().join("xp_targets.json");

        {
            let mut store = SubjectStore::open(&state_file, &watch_file);
            store.add_subscriber("123", 42);
            store.seed("123", &info("Ryn", 7, 900));
            store.record_change("123", &info("Ryn", 7, 950), Utc::now());
            store.save_all().unwrap();
        }

        let store = SubjectStore::open(&state_file, &watch_file);
        let subject = store.subject("123").unwrap();
        assert_eq!(subject.experience, 950);
        assert_eq!(subject.name.as_deref(), Some("Ryn"));
        assert!(subject.last_update.is_some());
        assert_eq!(store.subscribers("123"), vec![42]);
    }

    #[test]
    fn on_disk_experience_field_is_last_xp() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("xp_state.json");
        let mut store = SubjectStore::open(&state_file, dir.path().join("w.json"));
        store.seed("123", &info("Ryn", 1, 77));
        store.save_subjects().unwrap();

        let raw = std::fs::read_to_string(&state_file).unwrap();
        assert!(raw.contains("\"last_xp\": 77"));
    }
}
