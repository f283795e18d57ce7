//! StateStore: the authoritative client-side view of the catalog.
//!
//! Readers take snapshots; every write goes through [`StateStore::update`] or
//! [`StateStore::try_update`]. Each committed write bumps `rev` and publishes
//! it on a watch channel.

use crate::protocol::{Notification, Podcast, PodcastEpisode, ServerConfig};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

/// Outcome of a bulk OPML import, one entry per imported feed.
///
/// Both sequences are append-only for the lifetime of a session; the only
/// way to shrink them is [`ImportProgress::restart`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportProgress {
    progress: Vec<bool>,
    messages: Vec<String>,
}

impl ImportProgress {
    pub fn record_added(&mut self) {
        self.progress.push(true);
    }

    pub fn record_errored(&mut self, message: String) {
        self.progress.push(false);
        self.messages.push(message);
    }

    pub fn restart(&mut self) {
        self.progress.clear();
        self.messages.clear();
    }

    pub fn progress(&self) -> &[bool] {
        &self.progress
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn failures(&self) -> usize {
        self.progress.iter().filter(|ok| !**ok).count()
    }

    /// One message per failed entry.
    pub fn is_consistent(&self) -> bool {
        self.messages.len() == self.failures()
    }
}

/// Merge a downloaded episode into the selected-episode list.
///
/// Unknown episodes are appended verbatim; a known one only takes over the
/// download fields, in place. Applying the same episode twice leaves the list
/// as applying it once.
pub fn merge_episode(selected: &mut Vec<PodcastEpisode>, downloaded: PodcastEpisode) {
    match selected.iter().position(|ep| ep.id == downloaded.id) {
        Some(idx) => selected[idx].absorb_download(&downloaded),
        None => selected.push(downloaded),
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreState {
    /// Monotonic revision counter, incremented on every committed write.
    pub rev: u64,
    pub podcasts: Vec<Podcast>,
    /// Episodes of the podcast open in the detail view.
    pub selected_episodes: Vec<PodcastEpisode>,
    /// Podcast currently open in the detail view.
    pub detail_podcast_id: Option<i32>,
    pub notifications: Vec<Notification>,
    pub import: ImportProgress,
    pub server_config: Option<Arc<ServerConfig>>,
}

impl StoreState {
    pub fn unread_notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.iter().filter(|n| n.is_unread())
    }

    pub fn podcast(&self, id: i32) -> Option<&Podcast> {
        self.podcasts.iter().find(|p| p.id == id)
    }
}

struct Shared {
    state: RwLock<StoreState>,
    rev_tx: watch::Sender<u64>,
    config_tx: watch::Sender<Option<Arc<ServerConfig>>>,
}

/// Cheap-to-clone handle to the process-wide store.
#[derive(Clone)]
pub struct StateStore {
    shared: Arc<Shared>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_state(StoreState::default())
    }

    pub fn with_state(state: StoreState) -> Self {
        let (rev_tx, _) = watch::channel(state.rev);
        let (config_tx, _) = watch::channel(state.server_config.clone());
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                rev_tx,
                config_tx,
            }),
        }
    }

    pub fn snapshot(&self) -> StoreState {
        self.read(StoreState::clone)
    }

    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let guard = self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&*guard)
    }

    /// Run `f` against the live state under the write lock and commit.
    pub fn update<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let (out, rev) = {
            let mut guard = self
                .shared
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let out = f(&mut *guard);
            guard.rev += 1;
            (out, guard.rev)
        };
        self.shared.rev_tx.send_replace(rev);
        out
    }

    /// Like [`update`](Self::update), but `f` may decline by returning
    /// `None`, in which case nothing is committed and `rev` stays put.
    /// `f` must not mutate the state before declining.
    pub fn try_update<R>(&self, f: impl FnOnce(&mut StoreState) -> Option<R>) -> Option<R> {
        let (out, rev) = {
            let mut guard = self
                .shared
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let out = f(&mut *guard)?;
            guard.rev += 1;
            (out, guard.rev)
        };
        self.shared.rev_tx.send_replace(rev);
        Some(out)
    }

    pub fn rev(&self) -> u64 {
        self.read(|s| s.rev)
    }

    /// Watch the revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.rev_tx.subscribe()
    }

    /// Watch the server configuration. A new `Arc` is a new configuration,
    /// whatever its contents.
    pub fn config_watch(&self) -> watch::Receiver<Option<Arc<ServerConfig>>> {
        self.shared.config_tx.subscribe()
    }

    /// The watch is published under the write lock, so the stored value and
    /// the watched value always agree.
    pub fn set_server_config(&self, config: Option<Arc<ServerConfig>>) {
        let rev = {
            let mut guard = self
                .shared
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            guard.server_config = config.clone();
            guard.rev += 1;
            self.shared.config_tx.send_replace(config);
            guard.rev
        };
        self.shared.rev_tx.send_replace(rev);
    }

    pub fn set_podcasts(&self, podcasts: Vec<Podcast>) {
        self.update(|s| s.podcasts = podcasts);
    }

    pub fn set_detail_podcast(&self, id: Option<i32>) {
        self.update(|s| s.detail_podcast_id = id);
    }

    pub fn set_selected_episodes(&self, episodes: Vec<PodcastEpisode>) {
        self.update(|s| s.selected_episodes = episodes);
    }

    pub fn set_notifications(&self, notifications: Vec<Notification>) {
        self.update(|s| s.notifications = notifications);
    }

    /// Start a new import session, discarding the previous one's progress.
    pub fn begin_import(&self) {
        self.update(|s| s.import.restart());
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EpisodeStatus;

    fn downloaded(id: i32) -> PodcastEpisode {
        let mut ep = PodcastEpisode::new(id, 10, "fresh name");
        ep.status = EpisodeStatus::Other("ignored".into());
        ep.url = "u".into();
        ep.local_url = "lu".into();
        ep.image_url = "iu".into();
        ep.local_image_url = "liu".into();
        ep
    }

    #[test]
    fn test_import_progress_stays_consistent() {
        let mut import = ImportProgress::default();
        let outcomes = [true, false, true, true, false, false];
        for (i, ok) in outcomes.iter().enumerate() {
            if *ok {
                import.record_added();
            } else {
                import.record_errored(format!("feed {} failed", i));
            }
            assert_eq!(import.progress().len(), i + 1);
            assert!(import.is_consistent());
        }
        assert_eq!(import.failures(), 3);
        assert_eq!(import.messages()[0], "feed 1 failed");

        import.restart();
        assert!(import.progress().is_empty());
        assert!(import.messages().is_empty());
    }

    #[test]
    fn test_merge_appends_unknown_episode() {
        let mut selected = vec![PodcastEpisode::new(1, 10, "one")];
        merge_episode(&mut selected, downloaded(2));
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[1], downloaded(2));
    }

    #[test]
    fn test_merge_replaces_download_fields_only() {
        let mut existing = PodcastEpisode::new(1, 10, "old name");
        existing.extra.insert("total_time".into(), 42.into());
        let mut selected = vec![existing, PodcastEpisode::new(2, 10, "two")];

        merge_episode(&mut selected, downloaded(1));

        let merged = &selected[0];
        assert_eq!(merged.status, EpisodeStatus::Downloaded);
        assert_eq!(merged.url, "u");
        assert_eq!(merged.local_url, "lu");
        assert_eq!(merged.image_url, "iu");
        assert_eq!(merged.local_image_url, "liu");
        assert_eq!(merged.name, "old name");
        assert_eq!(merged.extra.get("total_time"), Some(&42.into()));
        assert_eq!(selected[1].id, 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut once = vec![PodcastEpisode::new(1, 10, "one")];
        merge_episode(&mut once, downloaded(1));
        let mut twice = once.clone();
        merge_episode(&mut twice, downloaded(1));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_update_bumps_rev_and_publishes() {
        let store = StateStore::new();
        let rx = store.subscribe();
        store.set_detail_podcast(Some(3));
        store.update(|s| s.podcasts.push(Podcast::new(1, "a")));
        assert_eq!(store.rev(), 2);
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(store.snapshot().detail_podcast_id, Some(3));
    }

    #[test]
    fn test_declined_update_commits_nothing() {
        let store = StateStore::new();
        let out: Option<()> = store.try_update(|_| None);
        assert!(out.is_none());
        assert_eq!(store.rev(), 0);
    }

    #[test]
    fn test_config_watch_sees_new_reference() {
        let store = StateStore::new();
        let mut rx = store.config_watch();
        assert!(rx.borrow_and_update().is_none());

        let cfg = Arc::new(ServerConfig {
            server_url: "http://localhost:8000/".into(),
            oidc_configured: false,
            oidc_config: None,
        });
        store.set_server_config(Some(cfg.clone()));
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone().unwrap();
        assert!(Arc::ptr_eq(&seen, &cfg));
        assert!(store.read(|s| s.server_config.is_some()));
    }

    #[test]
    fn test_concurrent_config_setters_agree_with_watch() {
        let store = StateStore::new();
        let rx = store.config_watch();
        let writers: Vec<_> = (0..4)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        store.set_server_config(Some(Arc::new(ServerConfig {
                            server_url: format!("http://host-{}:{}/", n, i),
                            oidc_configured: false,
                            oidc_config: None,
                        })));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stored = store.read(|s| s.server_config.clone()).unwrap();
        let watched = rx.borrow().clone().unwrap();
        assert!(Arc::ptr_eq(&stored, &watched));
        assert_eq!(store.rev(), 800);
    }
}
