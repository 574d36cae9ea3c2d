//! Request and response DTOs for the MemoBase API.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::blob::ChatMessage;
use crate::error::ApiError;

/// Literal used for a profile topic or sub-topic the server did not supply.
pub const UNSET_TOPIC: &str = "NONE";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct IdData {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct IdsData {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProfileConfigData {
    pub profile_config: String,
}

/// Sort key for [`UsersQuery`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOrder {
    #[default]
    UpdatedAt,
    ProfileCount,
    EventCount,
}

impl UserOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            UserOrder::UpdatedAt => "updated_at",
            UserOrder::ProfileCount => "profile_count",
            UserOrder::EventCount => "event_count",
        }
    }
}

impl fmt::Display for UserOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter and paging for `MemoBaseClient::get_users`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsersQuery {
    pub search: String,
    pub order_by: UserOrder,
    pub order_desc: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for UsersQuery {
    fn default() -> Self {
        Self {
            search: String::new(),
            order_by: UserOrder::UpdatedAt,
            order_desc: true,
            limit: 10,
            offset: 0,
        }
    }
}

impl UsersQuery {
    /// Query pairs in the order the server documents them.
    pub(crate) fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("search", self.search.clone()),
            ("order_by", self.order_by.as_str().to_string()),
            ("order_desc", self.order_desc.to_string()),
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
        ]
    }
}

/// One user as listed by the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUser {
    pub id: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub profile_count: Option<u64>,
    #[serde(default)]
    pub event_count: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectUsers {
    #[serde(default)]
    pub users: Vec<ProjectUser>,
    #[serde(default)]
    pub count: u64,
}

/// Per-day usage counters for the project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageItem {
    pub date: String,
    #[serde(default)]
    pub total_insert: u64,
    #[serde(default)]
    pub total_success_insert: u64,
    #[serde(default)]
    pub total_input_token: u64,
    #[serde(default)]
    pub total_output_token: u64,
}

/// A profile entry derived by the server from a user's blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub topic: String,
    pub sub_topic: String,
    pub content: String,
}

impl Profile {
    pub fn describe(&self) -> String {
        format!("{}: {} - {}", self.topic, self.sub_topic, self.content)
    }
}

/// Profile as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProfileRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub updated_at: String,
}

impl ProfileRecord {
    pub fn into_profile(self) -> Result<Profile, ApiError> {
        let attribute = |key: &str| {
            self.attributes
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(UNSET_TOPIC)
                .to_string()
        };
        Ok(Profile {
            updated_at: parse_timestamp(&self.updated_at)?,
            topic: attribute("topic"),
            sub_topic: attribute("sub_topic"),
            id: self.id,
            content: self.content,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProfilesData {
    pub profiles: Vec<ProfileRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDelta {
    pub content: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTag {
    pub tag: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub profile_delta: Vec<ProfileDelta>,
    #[serde(default)]
    pub event_tip: Option<String>,
    #[serde(default)]
    pub event_tags: Option<Vec<EventTag>>,
}

/// A memory event recorded when buffered blobs were processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub id: String,
    #[serde(default)]
    pub event_data: EventData,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EventsData {
    #[serde(default)]
    pub events: Vec<UserEvent>,
}

/// Processing state of a buffered blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStatus {
    #[default]
    Idle,
    Processing,
    Done,
    Failed,
}

impl BufferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferStatus::Idle => "idle",
            BufferStatus::Processing => "processing",
            BufferStatus::Done => "done",
            BufferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BufferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic search over a user's events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSearch {
    pub query: String,
    pub topk: u32,
    pub similarity_threshold: f64,
    pub time_range_in_days: u32,
}

impl EventSearch {
    /// Search for `query` with the server's usual limits: 10 hits, 0.2
    /// similarity, the last 7 days.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            topk: 10,
            similarity_threshold: 0.2,
            time_range_in_days: 7,
        }
    }

    pub(crate) fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("query", self.query.clone()),
            ("topk", self.topk.to_string()),
            ("similarity_threshold", self.similarity_threshold.to_string()),
            ("time_range_in_days", self.time_range_in_days.to_string()),
        ]
    }
}

/// Shape of the memory prompt returned by `UserHandle::context`.
///
/// Only `max_token_size` is always sent; every other knob is left to the
/// server unless set.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextOptions {
    pub max_token_size: u32,
    /// Topics ranked first when the context has to be trimmed.
    pub prefer_topics: Vec<String>,
    /// Restrict profiles to these topics.
    pub only_topics: Vec<String>,
    pub max_subtopic_size: Option<u32>,
    /// Per-topic subtopic limits; override `max_subtopic_size`.
    pub topic_limits: BTreeMap<String, u32>,
    pub profile_event_ratio: Option<f64>,
    pub require_event_summary: Option<bool>,
    /// Recent conversation used to pick relevant events.
    pub chats: Vec<ChatMessage>,
    pub event_similarity_threshold: Option<f64>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_token_size: 1000,
            prefer_topics: Vec::new(),
            only_topics: Vec::new(),
            max_subtopic_size: None,
            topic_limits: BTreeMap::new(),
            profile_event_ratio: None,
            require_event_summary: None,
            chats: Vec::new(),
            event_similarity_threshold: None,
        }
    }
}

impl ContextOptions {
    /// Query pairs; list options repeat their key once per entry.
    pub(crate) fn to_pairs(&self) -> Result<Vec<(&'static str, String)>, ApiError> {
        let mut pairs = vec![("max_token_size", self.max_token_size.to_string())];
        pairs.extend(self.prefer_topics.iter().map(|t| ("prefer_topics", t.clone())));
        pairs.extend(self.only_topics.iter().map(|t| ("only_topics", t.clone())));
        if let Some(size) = self.max_subtopic_size {
            pairs.push(("max_subtopic_size", size.to_string()));
        }
        if !self.topic_limits.is_empty() {
            let limits = serde_json::to_string(&self.topic_limits)
                .map_err(|e| ApiError::Serialization(e.to_string()))?;
            pairs.push(("topic_limits_json", limits));
        }
        if let Some(ratio) = self.profile_event_ratio {
            pairs.push(("profile_event_ratio", ratio.to_string()));
        }
        if let Some(summary) = self.require_event_summary {
            pairs.push(("require_event_summary", summary.to_string()));
        }
        if !self.chats.is_empty() {
            let chats = serde_json::to_string(&self.chats)
                .map_err(|e| ApiError::Serialization(e.to_string()))?;
            pairs.push(("chats_str", chats));
        }
        if let Some(threshold) = self.event_similarity_threshold {
            pairs.push(("event_similarity_threshold", threshold.to_string()));
        }
        Ok(pairs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ContextData {
    pub context: String,
}

/// Parse a server timestamp. RFC 3339 is preferred; a timestamp without an
/// offset is taken as UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ApiError::Protocol(format!("invalid timestamp {raw:?}: {e}")))
}
