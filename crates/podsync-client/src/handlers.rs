//! Event handlers: turn classified push events into store mutations and
//! acknowledgements.

use podsync_proto::protocol::{Podcast, PodcastEpisode, PodcastSummary, PushEvent};
use podsync_proto::state::{merge_episode, StateStore};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::ConnectionHandler;
use crate::toast::{Acknowledgement, Notifier};

/// Apply one event to the store. Returns the acknowledgement to show, if any.
pub fn apply(event: PushEvent, store: &StateStore) -> Option<Acknowledgement> {
    match event {
        PushEvent::PodcastAdded { podcast } => Some(podcast_added(podcast, store)),
        PushEvent::PodcastEpisodeAdded { podcast_episode } => {
            podcast_episode_added(podcast_episode, store)
        }
        PushEvent::PodcastRefreshed { podcast } => Some(podcast_refreshed(&podcast)),
        PushEvent::OpmlAdded => {
            store.update(|s| s.import.record_added());
            None
        }
        PushEvent::OpmlErrored { message } => {
            store.update(|s| s.import.record_errored(message));
            None
        }
    }
}

/// Appends unconditionally: a redelivered event yields a second entry.
fn podcast_added(podcast: Podcast, store: &StateStore) -> Acknowledgement {
    let ack = Acknowledgement::success(format!("New podcast added: {}", podcast.name));
    store.update(|s| s.podcasts.push(podcast));
    ack
}

/// Only relevant while the episode's podcast is open in the detail view.
fn podcast_episode_added(episode: PodcastEpisode, store: &StateStore) -> Option<Acknowledgement> {
    let name = episode.name.clone();
    let podcast_id = episode.podcast_id;
    store
        .try_update(|s| {
            if s.detail_podcast_id != Some(podcast_id) {
                return None;
            }
            merge_episode(&mut s.selected_episodes, episode);
            Some(())
        })
        .map(|()| Acknowledgement::success(format!("New episode downloaded: {}", name)))
        .or_else(|| {
            debug!("push: episode for podcast {} not in detail view, ignoring", podcast_id);
            None
        })
}

fn podcast_refreshed(podcast: &PodcastSummary) -> Acknowledgement {
    Acknowledgement::info(format!("Podcast refreshed: {}", podcast.name))
}

/// The callback set attached to the live push connection.
pub struct PushHandler {
    store: StateStore,
    notifier: Notifier,
}

impl PushHandler {
    pub fn new(store: StateStore, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }
}

impl ConnectionHandler for PushHandler {
    fn on_open(&mut self, endpoint: &Url) {
        info!("push: connected to {}", endpoint);
    }

    fn on_message(&mut self, frame: String) {
        let event = match PushEvent::classify(&frame) {
            Ok(event) => event,
            Err(e) if e.is_malformed() => {
                warn!("push: dropping malformed frame: {}", e);
                return;
            }
            Err(e) => {
                debug!("push: dropping unrecognised frame: {}", e);
                return;
            }
        };
        debug!("push: {} event", event.label());
        if let Some(ack) = apply(event, &self.store) {
            self.notifier.notify(ack);
        }
    }

    fn on_error(&mut self, error: &str) {
        warn!("push: connection error: {}", error);
    }

    fn on_close(&mut self) {
        info!("push: connection closed");
    }
}
