use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::model::ids::ModuleId;

const EMBED_VIDEO_ID_LEN: usize = 11;
const EMBED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
    "youtu.be",
];

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModuleError {
    #[error("module title cannot be empty")]
    EmptyTitle,

    #[error("sequence numbers start at 1")]
    InvalidSequenceNumber,

    #[error("media locator cannot be empty")]
    EmptyLocator,

    #[error("media locator is not a valid URL: {0}")]
    InvalidLocator(String),

    #[error("unknown media kind: {0}")]
    UnknownMediaKind(String),
}

//
// ─── MEDIA ─────────────────────────────────────────────────────────────────────
//

/// Which playback backend renders a module's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Locally rendered player with direct property access.
    NativeStream,
    /// Third-party embed controlled through asynchronous messages.
    EmbeddedThirdParty,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::NativeStream => "native_stream",
            MediaKind::EmbeddedThirdParty => "embedded_third_party",
        }
    }

    /// Parse the storage representation produced by [`MediaKind::as_str`].
    ///
    /// # Errors
    ///
    /// Returns `ModuleError::UnknownMediaKind` for any other input.
    pub fn parse(raw: &str) -> Result<Self, ModuleError> {
        match raw {
            "native_stream" => Ok(MediaKind::NativeStream),
            "embedded_third_party" => Ok(MediaKind::EmbeddedThirdParty),
            other => Err(ModuleError::UnknownMediaKind(other.to_owned())),
        }
    }

    /// Picks the backend for a locator: known embed hosts are embedded,
    /// everything else (files, plain streams) plays natively.
    #[must_use]
    pub fn infer(locator: &MediaLocator) -> Self {
        match locator.as_url().and_then(Url::host_str) {
            Some(host) if EMBED_HOSTS.contains(&host) => MediaKind::EmbeddedThirdParty,
            _ => MediaKind::NativeStream,
        }
    }
}

/// Where a module's media lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaLocator {
    FilePath(PathBuf),
    Url(Url),
}

impl MediaLocator {
    /// # Errors
    ///
    /// Returns `ModuleError::EmptyLocator` if the path is empty.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ModuleError> {
        let p = path.into();
        if p.as_os_str().is_empty() {
            return Err(ModuleError::EmptyLocator);
        }
        Ok(MediaLocator::FilePath(p))
    }

    /// # Errors
    ///
    /// Returns `ModuleError::EmptyLocator` for blank input and
    /// `ModuleError::InvalidLocator` if it does not parse as a URL.
    pub fn from_url(url: impl AsRef<str>) -> Result<Self, ModuleError> {
        let s = url.as_ref().trim();
        if s.is_empty() {
            return Err(ModuleError::EmptyLocator);
        }
        let u = Url::parse(s).map_err(|e| ModuleError::InvalidLocator(e.to_string()))?;
        Ok(MediaLocator::Url(u))
    }

    /// Parses the persisted string form: URLs when they carry a scheme,
    /// file paths otherwise.
    ///
    /// # Errors
    ///
    /// Returns `ModuleError` if the input is empty or a malformed URL.
    pub fn parse(raw: &str) -> Result<Self, ModuleError> {
        let s = raw.trim();
        if s.contains("://") {
            Self::from_url(s)
        } else {
            Self::from_file(s)
        }
    }

    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            MediaLocator::FilePath(p) => Some(p.as_path()),
            MediaLocator::Url(_) => None,
        }
    }

    #[must_use]
    pub fn as_url(&self) -> Option<&Url> {
        match self {
            MediaLocator::Url(u) => Some(u),
            MediaLocator::FilePath(_) => None,
        }
    }

    /// String form used for persistence.
    #[must_use]
    pub fn to_persisted(&self) -> String {
        match self {
            MediaLocator::FilePath(p) => p.to_string_lossy().into_owned(),
            MediaLocator::Url(u) => u.as_str().to_owned(),
        }
    }

    /// Extracts the embed's video id from the common link shapes
    /// (`watch?v=`, `youtu.be/<id>`, `/embed/<id>`, `/v/<id>`).
    ///
    /// Returns `None` unless the candidate is exactly eleven id characters.
    #[must_use]
    pub fn embed_video_id(&self) -> Option<String> {
        let url = self.as_url()?;
        let host = url.host_str()?;
        if !EMBED_HOSTS.contains(&host) {
            return None;
        }

        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let candidate = if host == "youtu.be" {
            segments.next().map(str::to_owned)
        } else {
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("embed" | "v") => segments.next().map(str::to_owned),
                _ => None,
            }
        }?;

        let valid = candidate.len() == EMBED_VIDEO_ID_LEN
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then_some(candidate)
    }
}

//
// ─── MODULE ────────────────────────────────────────────────────────────────────
//

/// One sequenced unit of training content. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    id: ModuleId,
    sequence_number: u32,
    title: String,
    media_locator: MediaLocator,
    media_kind: MediaKind,
}

impl Module {
    /// # Errors
    ///
    /// Returns `ModuleError::InvalidSequenceNumber` for sequence 0 and
    /// `ModuleError::EmptyTitle` for a blank title.
    pub fn new(
        id: ModuleId,
        sequence_number: u32,
        title: impl Into<String>,
        media_locator: MediaLocator,
        media_kind: MediaKind,
    ) -> Result<Self, ModuleError> {
        if sequence_number == 0 {
            return Err(ModuleError::InvalidSequenceNumber);
        }
        let title = title.into();
        if title.trim().is_empty() {
            return Err(ModuleError::EmptyTitle);
        }
        Ok(Self {
            id,
            sequence_number,
            title: title.trim().to_owned(),
            media_locator,
            media_kind,
        })
    }

    /// Builds a module whose media kind is inferred from its locator.
    ///
    /// # Errors
    ///
    /// Same as [`Module::new`].
    pub fn with_inferred_kind(
        id: ModuleId,
        sequence_number: u32,
        title: impl Into<String>,
        media_locator: MediaLocator,
    ) -> Result<Self, ModuleError> {
        let kind = MediaKind::infer(&media_locator);
        Self::new(id, sequence_number, title, media_locator, kind)
    }

    #[must_use]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    #[must_use]
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn media_locator(&self) -> &MediaLocator {
        &self.media_locator
    }

    #[must_use]
    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    /// The first module is unlocked for everyone.
    #[must_use]
    pub fn is_entry_point(&self) -> bool {
        self.sequence_number == 1
    }
}
