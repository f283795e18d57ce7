use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field carrying the event discriminator on every push frame.
pub const KIND_FIELD: &str = "type_of";

/// Server-side `type_of` values this client understands.
pub const KNOWN_KINDS: &[&str] = &[
    "AddPodcast",
    "AddPodcastEpisode",
    "RefreshPodcast",
    "OpmlAdded",
    "OpmlErrored",
];

/// Events pushed by the server over the push connection.
///
/// Decoded once at the boundary by [`PushEvent::classify`]; the kinds are
/// disjoint by discriminator, so there is no evaluation order between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type_of")]
pub enum PushEvent {
    #[serde(rename = "AddPodcast")]
    PodcastAdded { podcast: Podcast },
    #[serde(rename = "AddPodcastEpisode")]
    PodcastEpisodeAdded { podcast_episode: PodcastEpisode },
    #[serde(rename = "RefreshPodcast")]
    PodcastRefreshed { podcast: PodcastSummary },
    OpmlAdded,
    OpmlErrored { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("frame is JSON but not an object")]
    NotAnObject,
    #[error("frame has no `type_of` discriminator")]
    MissingKind,
    #[error("unknown event kind {0:?}")]
    UnknownKind(String),
    #[error("{kind} frame does not match its shape: {source}")]
    Shape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClassifyError {
    /// True for frames that are not structured data at all, as opposed to
    /// well-formed frames this client has no handler for.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ClassifyError::NotJson(_) | ClassifyError::NotAnObject)
    }
}

impl PushEvent {
    /// Classify one raw inbound frame.
    ///
    /// `type_of` decides when present. Untagged frames are matched against
    /// the payload shapes instead, see [`infer_kind`].
    pub fn classify(raw: &str) -> Result<Self, ClassifyError> {
        let mut value: Value = serde_json::from_str(raw).map_err(ClassifyError::NotJson)?;
        let Value::Object(obj) = &mut value else {
            return Err(ClassifyError::NotAnObject);
        };
        let tagged = match obj.get(KIND_FIELD) {
            Some(Value::String(kind)) => Some(kind.clone()),
            Some(_) => return Err(ClassifyError::MissingKind),
            None => None,
        };
        let kind = match tagged {
            Some(kind) => kind,
            None => {
                let kind = infer_kind(obj).ok_or(ClassifyError::MissingKind)?;
                obj.insert(KIND_FIELD.to_string(), Value::from(kind));
                kind.to_string()
            }
        };
        if !KNOWN_KINDS.contains(&kind.as_str()) {
            return Err(ClassifyError::UnknownKind(kind));
        }
        serde_json::from_value(value).map_err(|source| ClassifyError::Shape { kind, source })
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            PushEvent::PodcastAdded { .. } => "podcast-added",
            PushEvent::PodcastEpisodeAdded { .. } => "episode-added",
            PushEvent::PodcastRefreshed { .. } => "podcast-refreshed",
            PushEvent::OpmlAdded => "opml-added",
            PushEvent::OpmlErrored { .. } => "opml-errored",
        }
    }
}

/// Kind of an untagged frame, by the first matching shape:
/// a `podcast` with `id` and `name`, a `podcast_episode` object, a `podcast`
/// with a `name`, a string `message`. `OpmlAdded` carries no payload and is
/// only recognised by its tag.
pub fn infer_kind(frame: &Map<String, Value>) -> Option<&'static str> {
    let podcast = frame.get("podcast").and_then(Value::as_object);
    if podcast.is_some_and(|p| p.contains_key("id") && p.contains_key("name")) {
        Some("AddPodcast")
    } else if frame.get("podcast_episode").is_some_and(Value::is_object) {
        Some("AddPodcastEpisode")
    } else if podcast.is_some_and(|p| p.contains_key("name")) {
        Some("RefreshPodcast")
    } else if frame.get("message").is_some_and(Value::is_string) {
        Some("OpmlErrored")
    } else {
        None
    }
}

// ── Catalog ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Podcast {
    pub id: i32,
    pub name: String,
    /// Artwork reference.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Everything else the server sends, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Podcast {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            image_url: None,
            extra: Map::new(),
        }
    }
}

/// Refresh frames only promise a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastSummary {
    #[serde(default)]
    pub id: Option<i32>,
    pub name: String,
}

/// Download status of an episode. Wire codes are single letters; unknown
/// codes are preserved so they survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EpisodeStatus {
    #[default]
    NotDownloaded,
    Downloading,
    Downloaded,
    Other(String),
}

impl EpisodeStatus {
    pub fn code(&self) -> &str {
        match self {
            EpisodeStatus::NotDownloaded => "N",
            EpisodeStatus::Downloading => "P",
            EpisodeStatus::Downloaded => "D",
            EpisodeStatus::Other(code) => code,
        }
    }
}

impl From<String> for EpisodeStatus {
    fn from(code: String) -> Self {
        match code.as_str() {
            "N" => EpisodeStatus::NotDownloaded,
            "P" => EpisodeStatus::Downloading,
            "D" => EpisodeStatus::Downloaded,
            _ => EpisodeStatus::Other(code),
        }
    }
}

impl From<EpisodeStatus> for String {
    fn from(status: EpisodeStatus) -> Self {
        status.code().to_string()
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastEpisode {
    pub id: i32,
    pub podcast_id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: EpisodeStatus,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub local_url: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub local_image_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PodcastEpisode {
    pub fn new(id: i32, podcast_id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            podcast_id,
            name: name.into(),
            status: EpisodeStatus::NotDownloaded,
            url: String::new(),
            local_url: String::new(),
            image_url: String::new(),
            local_image_url: String::new(),
            extra: Map::new(),
        }
    }

    /// Take over the download-related fields of `downloaded` and mark this
    /// entry as downloaded. Identity, name and every other field stay as they
    /// are.
    pub fn absorb_download(&mut self, downloaded: &PodcastEpisode) {
        self.status = EpisodeStatus::Downloaded;
        self.url = downloaded.url.clone();
        self.local_url = downloaded.local_url.clone();
        self.image_url = downloaded.image_url.clone();
        self.local_image_url = downloaded.local_image_url.clone();
    }
}

// ── Notifications ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i32,
    pub message: String,
    /// `"unread"` or `"dismissed"`.
    pub status: String,
    #[serde(default)]
    pub type_of_message: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Notification {
    pub fn is_unread(&self) -> bool {
        self.status == "unread"
    }
}

// ── Server configuration (`GET {api}/sys/config`) ─────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub server_url: String,
    #[serde(default)]
    pub oidc_configured: bool,
    #[serde(default)]
    pub oidc_config: Option<OidcConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    pub client_id: String,
    pub authority: String,
    pub scope: String,
    pub redirect_uri: String,
}
