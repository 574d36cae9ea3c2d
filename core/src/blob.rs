//! Blobs: units of user content ingested by the server.
//!
//! # Design
//! `Blob` is a closed set of variants tagged by `"type"` on the wire. Each
//! variant declares the fields it requires and [`Blob::validate`] checks them
//! before anything is serialized, so a half-built blob never reaches the
//! server. `fields` and `created_at` are common to every variant and sit
//! beside the tag.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    #[default]
    Chat,
    Doc,
    Image,
    Code,
    Transcript,
}

impl BlobType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlobType::Chat => "chat",
            BlobType::Doc => "doc",
            BlobType::Image => "image",
            BlobType::Code => "code",
            BlobType::Transcript => "transcript",
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of an OpenAI-compatible conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            alias: None,
            created_at: None,
        }
    }
}

/// A timed segment of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptStamp {
    pub content: String,
    pub start_timestamp_in_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_timestamp_in_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// Variant-specific payload of a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlobContent {
    Chat {
        messages: Vec<ChatMessage>,
    },
    Doc {
        content: String,
    },
    Code {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base64: Option<String>,
    },
    Transcript {
        transcripts: Vec<TranscriptStamp>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(flatten)]
    pub content: BlobContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Blob {
    pub fn new(content: BlobContent) -> Self {
        Self {
            content,
            fields: None,
            created_at: None,
        }
    }

    pub fn chat(messages: Vec<ChatMessage>) -> Self {
        Self::new(BlobContent::Chat { messages })
    }

    pub fn doc(content: impl Into<String>) -> Self {
        Self::new(BlobContent::Doc {
            content: content.into(),
        })
    }

    pub fn code(content: impl Into<String>, language: Option<String>) -> Self {
        Self::new(BlobContent::Code {
            content: content.into(),
            language,
        })
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::new(BlobContent::Image {
            url: Some(url.into()),
            base64: None,
        })
    }

    pub fn transcript(transcripts: Vec<TranscriptStamp>) -> Self {
        Self::new(BlobContent::Transcript { transcripts })
    }

    pub fn with_fields(mut self, fields: Map<String, Value>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn blob_type(&self) -> BlobType {
        match self.content {
            BlobContent::Chat { .. } => BlobType::Chat,
            BlobContent::Doc { .. } => BlobType::Doc,
            BlobContent::Code { .. } => BlobType::Code,
            BlobContent::Image { .. } => BlobType::Image,
            BlobContent::Transcript { .. } => BlobType::Transcript,
        }
    }

    /// Check the fields this blob's type requires.
    pub fn validate(&self) -> Result<(), ApiError> {
        let problem = match &self.content {
            BlobContent::Chat { messages } if messages.is_empty() => {
                Some("chat blob needs at least one message")
            }
            BlobContent::Chat { messages } if messages.iter().any(|m| m.content.is_empty()) => {
                Some("chat message content must not be empty")
            }
            BlobContent::Doc { content } | BlobContent::Code { content, .. }
                if content.is_empty() =>
            {
                Some("content must not be empty")
            }
            BlobContent::Image { url: None, base64: None } => {
                Some("image blob needs a url or base64 payload")
            }
            BlobContent::Transcript { transcripts } if transcripts.is_empty() => {
                Some("transcript blob needs at least one stamp")
            }
            _ => None,
        };
        match problem {
            Some(msg) => Err(ApiError::InvalidBlob(format!("{}: {msg}", self.blob_type()))),
            None => Ok(()),
        }
    }
}

/// A blob as the server stores and returns it.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct StoredBlob {
    pub blob_type: BlobType,
    pub blob_data: Value,
    #[serde(default)]
    pub fields: Option<Map<String, Value>>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl StoredBlob {
    /// Rebuild the typed blob. `blob_data` may or may not repeat the tag and
    /// common fields; the outer record wins when both are present.
    pub fn into_blob(self) -> Result<Blob, ApiError> {
        let Value::Object(mut payload) = self.blob_data else {
            return Err(ApiError::Protocol("blob_data is not an object".to_string()));
        };
        payload.insert(
            "type".to_string(),
            Value::String(self.blob_type.as_str().to_string()),
        );
        if let Some(fields) = self.fields {
            payload.insert("fields".to_string(), Value::Object(fields));
        }
        if let Some(created_at) = self.created_at {
            let parsed = crate::types::parse_timestamp(&created_at)?;
            payload.insert("created_at".to_string(), Value::String(parsed.to_rfc3339()));
        }
        serde_json::from_value(Value::Object(payload))
            .map_err(|e| ApiError::Protocol(format!("stored blob does not match its type: {e}")))
    }
}

/// Accept either the stored record shape or an already-tagged blob.
pub(crate) fn blob_from_value(data: Value) -> Result<Blob, ApiError> {
    if data.get("blob_type").is_some() {
        let stored: StoredBlob = serde_json::from_value(data)
            .map_err(|e| ApiError::Protocol(format!("invalid stored blob: {e}")))?;
        return stored.into_blob();
    }
    serde_json::from_value(data).map_err(|e| ApiError::Protocol(format!("invalid blob: {e}")))
}
