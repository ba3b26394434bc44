//! Concurrency-safe store of live feedback sessions.
//!
//! Removal from the store is the only way a session gets resolved, so
//! whichever caller removes a session first is the one that resolves it.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::log::SessionLog;
use super::types::{generate_session_id, Resolution, SessionId, SessionInfo, SessionView};
use crate::error::SessionError;
use crate::shell::{ShellSlot, ShellState};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// State of one feedback session.
#[derive(Debug)]
pub struct Session {
    /// Unique session ID.
    pub id: SessionId,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Prompt shown above the form.
    pub prompt: Option<String>,
    /// Page title.
    pub title: Option<String>,
    /// Terminal log.
    pub log: SessionLog,
    pub(crate) shell: ShellSlot,
}

/// Session shared between the store, request handlers and its shell's pump thread.
pub type SharedSession = Arc<Mutex<Session>>;

impl Session {
    pub fn new(id: SessionId, prompt: Option<String>, title: Option<String>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            prompt,
            title,
            log: SessionLog::new(),
            shell: ShellSlot::default(),
        }
    }

    pub fn shell_state(&self) -> ShellState {
        self.shell.state()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            prompt: self.prompt.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            logs: self.log.snapshot(),
            shell: self.shell_state(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            shell: self.shell_state(),
            log_len: self.log.len(),
        }
    }

    /// Terminate the attached shell, if any.
    pub fn terminate_shell(&mut self) {
        if let Some(process) = self.shell.take() {
            process.terminate();
        }
    }
}

struct StoreEntry {
    session: SharedSession,
    resolver: SyncSender<Resolution>,
    started: Instant,
}

/// All live sessions, keyed by ID.
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Clone, Default)]
pub struct SessionStore {
    entries: Arc<Mutex<HashMap<SessionId, StoreEntry>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its ID plus the receiver of its single resolution.
    pub fn create(
        &self,
        prompt: Option<String>,
        title: Option<String>,
    ) -> (SessionId, Receiver<Resolution>) {
        let (resolver, receiver) = mpsc::sync_channel(1);
        let mut entries = lock(&self.entries);

        let mut session_id = generate_session_id();
        while entries.contains_key(&session_id) {
            session_id = generate_session_id();
        }

        let session = Session::new(session_id.clone(), prompt, title);
        entries.insert(
            session_id.clone(),
            StoreEntry {
                session: Arc::new(Mutex::new(session)),
                resolver,
                started: Instant::now(),
            },
        );
        debug!(session_id = %session_id, live = entries.len(), "Created session");

        (session_id, receiver)
    }

    pub fn get(&self, session_id: &str) -> Option<SharedSession> {
        lock(&self.entries)
            .get(session_id)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub fn has(&self, session_id: &str) -> bool {
        lock(&self.entries).contains_key(session_id)
    }

    /// Remove a session without resolving it.
    ///
    /// Terminates its shell. The waiter, if any, sees the channel close.
    /// Returns true if the session existed.
    pub fn remove(&self, session_id: &str) -> bool {
        let Some(entry) = lock(&self.entries).remove(session_id) else {
            return false;
        };
        lock(&entry.session).terminate_shell();
        debug!(session_id, "Removed session");
        true
    }

    /// Resolve a session exactly once.
    ///
    /// Fails with `NotFound` if the session was already resolved or never
    /// existed; nothing is delivered in that case.
    pub fn resolve(&self, session_id: &str, resolution: Resolution) -> Result<(), SessionError> {
        let entry = lock(&self.entries)
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        Self::finish(session_id, entry, resolution);
        Ok(())
    }

    /// Resolve a session with a result built from its final state.
    ///
    /// `build` runs after the session has left the store, so no other caller
    /// can resolve it concurrently.
    pub fn resolve_with<F>(&self, session_id: &str, build: F) -> Result<(), SessionError>
    where
        F: FnOnce(&Session) -> Resolution,
    {
        let entry = lock(&self.entries)
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let resolution = build(&lock(&entry.session));
        Self::finish(session_id, entry, resolution);
        Ok(())
    }

    fn finish(session_id: &str, entry: StoreEntry, resolution: Resolution) {
        lock(&entry.session).terminate_shell();
        let outcome = match &resolution {
            Ok(_) => "submitted",
            Err(_) => "failed",
        };
        // Capacity one and a single send per entry, so this never blocks.
        if entry.resolver.try_send(resolution).is_err() {
            debug!(session_id, "Resolution dropped, nobody waiting");
        }
        info!(session_id, outcome, "Resolved session");
    }

    /// Resolve every session older than `expiry` at `now` with a timeout.
    ///
    /// Returns the IDs that were expired.
    pub fn reap_expired(&self, now: Instant, expiry: Duration) -> Vec<SessionId> {
        let expired: Vec<(SessionId, StoreEntry)> = {
            let mut entries = lock(&self.entries);
            let ids: Vec<SessionId> = entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.started) > expiry)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(session_id, entry)| {
                info!(session_id = %session_id, ?expiry, "Session expired");
                Self::finish(&session_id, entry, Err(SessionError::Timeout(expiry)));
                session_id
            })
            .collect()
    }

    /// Resolve every live session as cancelled.
    pub fn resolve_all_cancelled(&self) -> usize {
        let drained: Vec<(SessionId, StoreEntry)> = lock(&self.entries).drain().collect();
        let count = drained.len();
        for (session_id, entry) in drained {
            Self::finish(&session_id, entry, Err(SessionError::Cancelled));
        }
        count
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<SharedSession> = lock(&self.entries)
            .values()
            .map(|entry| Arc::clone(&entry.session))
            .collect();
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|session| lock(session).info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{FeedbackResult, Submission};
    use std::thread;

    fn submitted(text: &str) -> Resolution {
        Ok(FeedbackResult::from_submission(
            Submission::text(text),
            String::new(),
        ))
    }

    #[test]
    fn test_create_yields_unique_ids() {
        let store = SessionStore::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..200 {
            let (id, _rx) = store.create(Some("test".into()), None);
            assert!(ids.insert(id));
        }
        assert_eq!(store.len(), 200);
    }

    #[test]
    fn test_get_has_remove() {
        let store = SessionStore::new();
        let (id, _rx) = store.create(Some("p".into()), Some("t".into()));
        assert!(store.has(&id));
        let session = store.get(&id).unwrap();
        assert_eq!(lock(&session).title.as_deref(), Some("t"));

        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_remove_closes_receiver() {
        let store = SessionStore::new();
        let (id, rx) = store.create(None, None);
        store.remove(&id);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_resolve_exactly_once() {
        let store = SessionStore::new();
        let (id, rx) = store.create(None, None);

        store.resolve(&id, submitted("looks good")).unwrap();
        let second = store.resolve(&id, Err(SessionError::Timeout(Duration::from_secs(1))));
        assert!(matches!(second, Err(SessionError::NotFound(_))));

        let result = rx.recv().unwrap().unwrap();
        assert_eq!(result.input, "looks good");
        assert!(rx.try_recv().is_err());
        assert!(!store.has(&id));
    }

    #[test]
    fn test_resolve_without_waiter_is_ok() {
        let store = SessionStore::new();
        let (id, rx) = store.create(None, None);
        drop(rx);
        assert!(store.resolve(&id, submitted("x")).is_ok());
    }

    #[test]
    fn test_resolve_with_sees_final_log() {
        let store = SessionStore::new();
        let (id, rx) = store.create(None, None);
        lock(&store.get(&id).unwrap()).log.push_output("$ ls\n");

        store
            .resolve_with(&id, |session| {
                Ok(FeedbackResult::from_submission(
                    Submission::text("done"),
                    session.log.joined(),
                ))
            })
            .unwrap();
        assert_eq!(rx.recv().unwrap().unwrap().command_logs, "$ ls\n");
    }

    #[test]
    fn test_reap_expired_with_injected_clock() {
        let store = SessionStore::new();
        let (old, old_rx) = store.create(None, None);
        let expiry = Duration::from_secs(300);

        // Nothing is old enough yet.
        assert!(store.reap_expired(Instant::now(), expiry).is_empty());

        let later = Instant::now() + expiry + Duration::from_secs(1);
        let (fresh, _fresh_rx) = store.create(None, None);
        let reaped = store.reap_expired(later, expiry);

        assert!(reaped.contains(&old));
        assert!(!store.has(&old));
        assert!(matches!(
            old_rx.recv().unwrap(),
            Err(SessionError::Timeout(d)) if d == expiry
        ));
        // `fresh` was created before `later` too, so it is also past expiry.
        assert!(reaped.contains(&fresh));
    }

    #[test]
    fn test_reap_keeps_young_sessions() {
        let store = SessionStore::new();
        let (id, _rx) = store.create(None, None);
        let soon = Instant::now() + Duration::from_secs(10);
        let reaped = store.reap_expired(soon, Duration::from_secs(60));
        assert!(reaped.is_empty());
        assert!(store.has(&id));
    }

    #[test]
    fn test_submit_and_reap_race_resolves_once() {
        for _ in 0..50 {
            let store = SessionStore::new();
            let (id, rx) = store.create(None, None);
            let later = Instant::now() + Duration::from_secs(600);

            let reaper_store = store.clone();
            let reaper = thread::spawn(move || {
                reaper_store
                    .reap_expired(later, Duration::from_secs(1))
                    .len()
            });
            let submit = store.resolve(&id, submitted("x")).is_ok();
            let reaped = reaper.join().unwrap();

            assert_eq!(usize::from(submit) + reaped, 1);
            assert!(rx.recv().is_ok());
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_resolve_all_cancelled() {
        let store = SessionStore::new();
        let (_a, rx_a) = store.create(None, None);
        let (_b, rx_b) = store.create(None, None);
        assert_eq!(store.resolve_all_cancelled(), 2);
        assert!(store.is_empty());
        assert!(matches!(rx_a.recv().unwrap(), Err(SessionError::Cancelled)));
        assert!(matches!(rx_b.recv().unwrap(), Err(SessionError::Cancelled)));
    }

    #[test]
    fn test_list_reports_sessions() {
        let store = SessionStore::new();
        let (id, _rx) = store.create(None, Some("Review".into()));
        let infos = store.list();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].session_id, id);
        assert_eq!(infos[0].shell, ShellState::Absent);
    }
}
