use serde::{Deserialize, Serialize};

use crate::short::ShortCode;

/// Kind-specific part of a record.
///
/// For encrypted records the payload field (`url`, `content`, `data`, or the
/// side file for images) holds a sealed envelope the store never inspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Link {
        url: String,
    },
    Paste {
        content: String,
        language: Option<String>,
    },
    /// Payload lives on disk under the upload directory as `file_name`.
    Image {
        content_type: String,
        file_name: String,
    },
    Secret {
        data: String,
    },
}

impl Content {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Link { .. } => Kind::Link,
            Self::Paste { .. } => Kind::Paste,
            Self::Image { .. } => Kind::Image,
            Self::Secret { .. } => Kind::Secret,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Link,
    Paste,
    Image,
    Secret,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Paste => "paste",
            Self::Image => "image",
            Self::Secret => "secret",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored in redb as bincode-encoded bytes, keyed by `short`.
/// Never mutated after creation; only its presence changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub short: ShortCode,
    pub content: Content,
    /// True iff the payload is a sealed envelope rather than raw content.
    pub encrypted: bool,
    /// True iff the first successful read destroys the record.
    /// Secrets are consumed on read regardless of this flag.
    pub one_time: bool,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    /// Unix timestamp (seconds) at which the record stops being readable.
    pub expires_at: i64,
}

impl Record {
    pub fn kind(&self) -> Kind {
        self.content.kind()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            short: self.short.clone(),
            kind: self.kind(),
            encrypted: self.encrypted,
            one_time: self.one_time || self.kind() == Kind::Secret,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Metadata returned by peek; never includes the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub short: ShortCode,
    pub kind: Kind,
    pub encrypted: bool,
    #[serde(rename = "onetime")]
    pub one_time: bool,
    pub created_at: i64,
    pub expires_at: i64,
}
