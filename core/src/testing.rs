//! In-memory transport for exercising the client without a network.
//!
//! `ScriptedTransport` replays queued replies in order and records every
//! request it receives, so tests can assert on exactly what went over the
//! wire.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::http::{HttpRequest, HttpResponse};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw response.
    pub fn reply(&self, status: u16, body: impl Into<String>) -> &Self {
        lock(&self.replies).push_back(Ok(HttpResponse::new(status, body)));
        self
    }

    /// Queue a 200 success envelope carrying `data`.
    pub fn reply_data(&self, data: Value) -> &Self {
        self.reply(200, json!({ "data": data, "errmsg": "", "errno": 0 }).to_string())
    }

    /// Queue a 200 success envelope with no `data` field.
    pub fn reply_empty(&self) -> &Self {
        self.reply(200, json!({ "errmsg": "", "errno": 0 }).to_string())
    }

    /// Queue a 200 envelope reporting a server-side error.
    pub fn reply_errno(&self, errno: i64, errmsg: &str) -> &Self {
        self.reply(200, json!({ "errmsg": errmsg, "errno": errno }).to_string())
    }

    /// Queue a transport failure.
    pub fn fail(&self, message: &str) -> &Self {
        lock(&self.replies).push_back(Err(TransportError::new(message)));
        self
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        lock(&self.requests).last().cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        lock(&self.requests).push(request);
        lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::new("no scripted reply left")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
