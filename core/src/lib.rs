//! Async client for the MemoBase user-memory API.
//!
//! # Overview
//! A project holds users; each user accumulates blobs (chats, documents,
//! transcripts, ...) from which the server derives profiles. This crate turns
//! typed calls into authenticated, versioned HTTP requests and turns the
//! server's `{data, errmsg, errno}` envelope back into values or `ApiError`s.
//!
//! # Design
//! - `RequestComposer` builds `HttpRequest` values; `envelope::unpack` reads
//!   `HttpResponse` values. Both are pure.
//! - A `Transport` moves requests over the network. `ReqwestTransport` is
//!   provided behind the default `reqwest` feature; tests use
//!   `testing::ScriptedTransport`.
//! - `MemoBaseClient` is the only type that calls the transport.
//!   `UserHandle`s delegate to it and hold no state beyond the user id.
//! - No retries, caching or timeouts live here.
//!
//! ```no_run
//! # async fn demo() -> Result<(), memobase_core::ApiError> {
//! use memobase_core::{Blob, BlobType, ChatMessage, ClientConfig, ContextOptions, MemoBaseClient};
//!
//! let client = MemoBaseClient::with_reqwest(
//!     ClientConfig::from_env("http://localhost:8019"),
//! )?;
//! let user = client.get_or_create_user("alice").await?;
//! user.insert(&Blob::chat(vec![ChatMessage::user("I moved to Lisbon")])).await?;
//! user.flush(BlobType::Chat).await?;
//! for profile in user.profile().await? {
//!     println!("{}", profile.describe());
//! }
//! let prompt = user.context(&ContextOptions::default()).await?;
//! println!("{prompt}");
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod client;
pub mod compose;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http;
pub mod testing;
pub mod transport;
pub mod types;
pub mod user;

pub use blob::{Blob, BlobContent, BlobType, ChatMessage, Role, TranscriptStamp};
pub use client::MemoBaseClient;
pub use compose::{escape_segment, RequestComposer};
pub use config::{ClientConfig, API_KEY_ENV, DEFAULT_API_VERSION};
pub use envelope::{unpack, Envelope};
pub use error::ApiError;
pub use http::{HttpMethod, HttpRequest, HttpResponse};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
pub use transport::{Transport, TransportError};
pub use types::{
    BufferStatus, ContextOptions, EventData, EventSearch, EventTag, Profile, ProfileDelta,
    ProjectUser, ProjectUsers, UsageItem, UserEvent, UserOrder, UsersQuery,
};
pub use user::UserHandle;
