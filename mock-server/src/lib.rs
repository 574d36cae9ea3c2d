//! In-memory MemoBase API server for local development and end-to-end tests.
//!
//! Implements the routes the client uses under `/api/v1`, wrapping every
//! reply in the `{data, errmsg, errno}` envelope. All routes except
//! `/healthcheck` require `Authorization: Bearer <api key>`.
//!
//! Profile extraction is a stand-in: flushing a buffer turns each buffered
//! chat user message into a `chat/message` profile and each doc blob into a
//! profile with no topic attributes, and records one event per flush. Event
//! search scores by query-word overlap and the context prompt budgets by
//! word count.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

pub const API_PREFIX: &str = "/api/v1";

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub data: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct BlobRow {
    pub id: String,
    pub user_id: String,
    pub blob_type: String,
    pub blob_data: Value,
    pub fields: Option<Value>,
    pub created_at: String,
    pub buffered: bool,
}

#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub attributes: Value,
    pub related_blobs: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: String,
    pub user_id: String,
    pub event_data: Value,
    pub created_at: String,
}

#[derive(Debug, Default)]
pub struct Store {
    pub profile_config: String,
    pub users: HashMap<String, UserRow>,
    pub blobs: Vec<BlobRow>,
    pub profiles: Vec<ProfileRow>,
    pub events: Vec<EventRow>,
    /// date -> (inserts attempted, inserts stored)
    pub usage: HashMap<String, (u64, u64)>,
}

impl Store {
    fn profile_count(&self, user_id: &str) -> usize {
        self.profiles.iter().filter(|p| p.user_id == user_id).count()
    }

    fn event_count(&self, user_id: &str) -> usize {
        self.events.iter().filter(|e| e.user_id == user_id).count()
    }

    fn require_user(&self, user_id: &str) -> Result<(), ApiFailure> {
        if self.users.contains_key(user_id) {
            Ok(())
        } else {
            Err(ApiFailure::not_found(format!("user {user_id} not found")))
        }
    }

    /// Derive profiles from buffered blobs of one type, then clear the buffer.
    /// Records one event when anything was derived.
    fn process_buffer(&mut self, user_id: &str, blob_type: &str) {
        let mut derived = Vec::new();
        for blob in self
            .blobs
            .iter_mut()
            .filter(|b| b.buffered && b.user_id == user_id && b.blob_type == blob_type)
        {
            blob.buffered = false;
            match blob.blob_type.as_str() {
                "chat" => {
                    let messages = blob.blob_data["messages"].as_array().cloned().unwrap_or_default();
                    for message in messages.iter().filter(|m| m["role"] == "user") {
                        if let Some(content) = message["content"].as_str() {
                            derived.push((
                                content.to_string(),
                                json!({ "topic": "chat", "sub_topic": "message" }),
                                blob.id.clone(),
                            ));
                        }
                    }
                }
                "doc" => {
                    if let Some(content) = blob.blob_data["content"].as_str() {
                        derived.push((content.to_string(), json!({}), blob.id.clone()));
                    }
                }
                _ => {}
            }
        }

        if derived.is_empty() {
            return;
        }

        let stamp = now();
        let deltas: Vec<Value> = derived
            .iter()
            .map(|(content, attributes, _)| json!({ "content": content, "attributes": attributes }))
            .collect();
        for (content, attributes, blob_id) in derived {
            self.profiles.push(ProfileRow {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                content,
                attributes,
                related_blobs: vec![blob_id],
                created_at: stamp.clone(),
                updated_at: stamp.clone(),
            });
        }
        self.events.push(EventRow {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            event_data: json!({ "profile_delta": deltas }),
            created_at: stamp,
        });
    }
}

pub type Db = Arc<RwLock<Store>>;

#[derive(Clone)]
pub struct AppState {
    api_key: Arc<str>,
    db: Db,
}

/// Error reply: the HTTP status doubles as the envelope `errno`.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    message: String,
}

impl ApiFailure {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let body = json!({
            "data": null,
            "errno": self.status.as_u16(),
            "errmsg": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiFailure>;

fn ok(data: Value) -> ApiResult {
    Ok(Json(json!({ "data": data, "errno": 0, "errmsg": "" })))
}

fn done() -> ApiResult {
    Ok(Json(json!({ "errno": 0, "errmsg": "" })))
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

pub fn app(api_key: &str) -> Router {
    let state = AppState {
        api_key: Arc::from(api_key),
        db: Arc::new(RwLock::new(Store::default())),
    };

    let protected = Router::new()
        .route(
            "/project/profile_config",
            get(get_profile_config).post(update_profile_config),
        )
        .route("/project/users", get(list_users))
        .route("/project/usage", get(project_usage))
        .route("/users", post(create_user))
        .route("/users/{id}", get(get_user).put(update_user).delete(delete_user))
        .route("/blobs/insert/{user_id}", post(insert_blob))
        .route("/blobs/{user_id}/{blob_id}", get(get_blob).delete(delete_blob))
        .route("/users/blobs/{user_id}/{blob_type}", get(list_blobs))
        .route("/users/buffer/{user_id}/{blob_type}", post(flush_buffer))
        .route(
            "/users/buffer/capacity/{user_id}/{blob_type}",
            get(buffer_capacity),
        )
        .route("/users/profile/{user_id}", get(get_profiles).post(add_profile))
        .route(
            "/users/profile/{user_id}/{profile_id}",
            put(update_profile).delete(delete_profile),
        )
        .route("/users/event/{user_id}", get(get_events))
        .route("/users/event/{user_id}/{event_id}", put(update_event).delete(delete_event))
        .route("/users/event/search/{user_id}", get(search_events))
        .route("/users/context/{user_id}", get(user_context))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let api = Router::new()
        .route("/healthcheck", get(healthcheck))
        .merge(protected);

    Router::new().nest(API_PREFIX, api).with_state(state)
}

pub async fn run(listener: TcpListener, api_key: &str) -> Result<(), std::io::Error> {
    axum::serve(listener, app(api_key)).await
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented != Some(&*state.api_key) {
        tracing::debug!(path = %request.uri().path(), "rejected request without valid token");
        return ApiFailure::new(StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }
    next.run(request).await
}

async fn healthcheck() -> ApiResult {
    done()
}

// --- project ---

async fn get_profile_config(State(state): State<AppState>) -> ApiResult {
    let store = state.db.read().await;
    ok(json!({ "profile_config": store.profile_config }))
}

#[derive(Deserialize)]
struct ProfileConfigBody {
    profile_config: String,
}

async fn update_profile_config(
    State(state): State<AppState>,
    Json(body): Json<ProfileConfigBody>,
) -> ApiResult {
    state.db.write().await.profile_config = body.profile_config;
    done()
}

#[derive(Deserialize)]
struct UsersParams {
    #[serde(default)]
    search: String,
    #[serde(default = "default_order_by")]
    order_by: String,
    #[serde(default = "default_true")]
    order_desc: bool,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_order_by() -> String {
    "updated_at".to_string()
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    10
}

async fn list_users(State(state): State<AppState>, Query(params): Query<UsersParams>) -> ApiResult {
    let store = state.db.read().await;
    let mut rows: Vec<Value> = store
        .users
        .values()
        .filter(|user| params.search.is_empty() || user.id.contains(&params.search))
        .map(|user| {
            json!({
                "id": user.id,
                "data": user.data,
                "profile_count": store.profile_count(&user.id),
                "event_count": store.event_count(&user.id),
                "created_at": user.created_at,
                "updated_at": user.updated_at,
            })
        })
        .collect();

    let key = match params.order_by.as_str() {
        "updated_at" | "profile_count" | "event_count" => params.order_by.clone(),
        other => {
            return Err(ApiFailure::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("cannot order by {other}"),
            ))
        }
    };
    rows.sort_by(|a, b| {
        let ord = match (&a[&key], &b[&key]) {
            (Value::Number(x), Value::Number(y)) => x.as_u64().cmp(&y.as_u64()),
            (x, y) => x.as_str().cmp(&y.as_str()),
        };
        let ord = ord.then_with(|| a["id"].as_str().cmp(&b["id"].as_str()));
        if params.order_desc {
            ord.reverse()
        } else {
            ord
        }
    });

    let count = rows.len();
    let users: Vec<Value> = rows.into_iter().skip(params.offset).take(params.limit).collect();
    ok(json!({ "users": users, "count": count }))
}

#[derive(Deserialize)]
struct UsageParams {
    #[serde(default = "default_last_days")]
    last_days: usize,
}

fn default_last_days() -> usize {
    7
}

async fn project_usage(State(state): State<AppState>, Query(params): Query<UsageParams>) -> ApiResult {
    let store = state.db.read().await;
    let mut days: Vec<(&String, &(u64, u64))> = store.usage.iter().collect();
    days.sort_by(|a, b| b.0.cmp(a.0));
    let items: Vec<Value> = days
        .into_iter()
        .take(params.last_days)
        .map(|(date, (attempted, stored))| {
            json!({
                "date": date,
                "total_insert": attempted,
                "total_success_insert": stored,
                "total_input_token": 0,
                "total_output_token": 0,
            })
        })
        .collect();
    ok(json!(items))
}

// --- users ---

#[derive(Deserialize)]
struct CreateUser {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    id: Option<String>,
}

async fn create_user(State(state): State<AppState>, Json(input): Json<CreateUser>) -> ApiResult {
    let mut store = state.db.write().await;
    let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    if store.users.contains_key(&id) {
        return Err(ApiFailure::new(
            StatusCode::CONFLICT,
            format!("user {id} already exists"),
        ));
    }
    let stamp = now();
    store.users.insert(
        id.clone(),
        UserRow {
            id: id.clone(),
            data: input.data,
            created_at: stamp.clone(),
            updated_at: stamp,
        },
    );
    ok(json!({ "id": id }))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let store = state.db.read().await;
    let user = store
        .users
        .get(&id)
        .ok_or_else(|| ApiFailure::not_found(format!("user {id} not found")))?;
    ok(json!({
        "data": user.data,
        "created_at": user.created_at,
        "updated_at": user.updated_at,
    }))
}

#[derive(Deserialize)]
struct UpdateUser {
    #[serde(default)]
    data: Option<Value>,
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<UpdateUser>,
) -> ApiResult {
    let mut store = state.db.write().await;
    let user = store
        .users
        .get_mut(&id)
        .ok_or_else(|| ApiFailure::not_found(format!("user {id} not found")))?;
    user.data = input.data;
    user.updated_at = now();
    ok(json!({ "id": id }))
}

async fn delete_user(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let mut store = state.db.write().await;
    if store.users.remove(&id).is_none() {
        return Err(ApiFailure::not_found(format!("user {id} not found")));
    }
    store.blobs.retain(|b| b.user_id != id);
    store.profiles.retain(|p| p.user_id != id);
    store.events.retain(|e| e.user_id != id);
    done()
}

// --- blobs ---

#[derive(Deserialize)]
struct InsertBlob {
    blob_type: String,
    blob_data: Value,
    #[serde(default)]
    fields: Option<Value>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct WaitParams {
    #[serde(default)]
    wait_process: bool,
}

/// With `wait_process` the blob's buffer is processed before replying.
async fn insert_blob(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(wait): Query<WaitParams>,
    Json(input): Json<InsertBlob>,
) -> ApiResult {
    let mut store = state.db.write().await;
    let today = Utc::now().format("%Y-%m-%d").to_string();
    store.usage.entry(today.clone()).or_default().0 += 1;
    store.require_user(&user_id)?;

    let id = Uuid::new_v4().to_string();
    let blob_type = input.blob_type.clone();
    store.blobs.push(BlobRow {
        id: id.clone(),
        user_id: user_id.clone(),
        blob_type: input.blob_type,
        blob_data: input.blob_data,
        fields: input.fields,
        created_at: input.created_at.unwrap_or_else(now),
        buffered: true,
    });
    store.usage.entry(today).or_default().1 += 1;
    if wait.wait_process {
        store.process_buffer(&user_id, &blob_type);
    }
    ok(json!({ "id": id }))
}

async fn get_blob(
    State(state): State<AppState>,
    Path((user_id, blob_id)): Path<(String, String)>,
) -> ApiResult {
    let store = state.db.read().await;
    let blob = store
        .blobs
        .iter()
        .find(|b| b.id == blob_id && b.user_id == user_id)
        .ok_or_else(|| ApiFailure::not_found(format!("blob {blob_id} not found")))?;
    ok(json!({
        "blob_type": blob.blob_type,
        "blob_data": blob.blob_data,
        "fields": blob.fields,
        "created_at": blob.created_at,
    }))
}

async fn delete_blob(
    State(state): State<AppState>,
    Path((user_id, blob_id)): Path<(String, String)>,
) -> ApiResult {
    let mut store = state.db.write().await;
    let before = store.blobs.len();
    store
        .blobs
        .retain(|b| !(b.id == blob_id && b.user_id == user_id));
    if store.blobs.len() == before {
        return Err(ApiFailure::not_found(format!("blob {blob_id} not found")));
    }
    done()
}

#[derive(Deserialize)]
struct PageParams {
    #[serde(default)]
    page: usize,
    #[serde(default = "default_limit")]
    page_size: usize,
}

async fn list_blobs(
    State(state): State<AppState>,
    Path((user_id, blob_type)): Path<(String, String)>,
    Query(params): Query<PageParams>,
) -> ApiResult {
    let store = state.db.read().await;
    store.require_user(&user_id)?;
    let ids: Vec<&str> = store
        .blobs
        .iter()
        .filter(|b| b.user_id == user_id && b.blob_type == blob_type)
        .skip(params.page.saturating_mul(params.page_size))
        .take(params.page_size)
        .map(|b| b.id.as_str())
        .collect();
    ok(json!({ "ids": ids }))
}

// --- buffer ---

async fn flush_buffer(
    State(state): State<AppState>,
    Path((user_id, blob_type)): Path<(String, String)>,
    Query(wait): Query<WaitParams>,
) -> ApiResult {
    let mut store = state.db.write().await;
    store.require_user(&user_id)?;
    store.process_buffer(&user_id, &blob_type);
    tracing::debug!(blob_type = %blob_type, wait_process = wait.wait_process, "flushed buffer");
    done()
}

#[derive(Deserialize)]
struct StatusParams {
    #[serde(default = "default_status")]
    status: String,
}

fn default_status() -> String {
    "idle".to_string()
}

/// Buffered blobs are `idle` until processed, then `done`.
async fn buffer_capacity(
    State(state): State<AppState>,
    Path((user_id, blob_type)): Path<(String, String)>,
    Query(params): Query<StatusParams>,
) -> ApiResult {
    let store = state.db.read().await;
    store.require_user(&user_id)?;
    let ids: Vec<&str> = store
        .blobs
        .iter()
        .filter(|b| b.user_id == user_id && b.blob_type == blob_type)
        .filter(|b| if b.buffered { "idle" } else { "done" } == params.status)
        .map(|b| b.id.as_str())
        .collect();
    ok(json!({ "ids": ids }))
}

// --- profiles ---

async fn get_profiles(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    let store = state.db.read().await;
    store.require_user(&user_id)?;
    let profiles: Vec<Value> = store
        .profiles
        .iter()
        .filter(|p| p.user_id == user_id)
        .map(|p| {
            json!({
                "id": p.id,
                "content": p.content,
                "attributes": p.attributes,
                "related_blobs": p.related_blobs,
                "created_at": p.created_at,
                "updated_at": p.updated_at,
            })
        })
        .collect();
    ok(json!({ "profiles": profiles }))
}

#[derive(Deserialize)]
struct ProfileBody {
    content: String,
    #[serde(default)]
    attributes: Option<Value>,
}

async fn add_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(input): Json<ProfileBody>,
) -> ApiResult {
    let mut store = state.db.write().await;
    store.require_user(&user_id)?;
    let id = Uuid::new_v4().to_string();
    let stamp = now();
    store.profiles.push(ProfileRow {
        id: id.clone(),
        user_id,
        content: input.content,
        attributes: input.attributes.unwrap_or_else(|| json!({})),
        related_blobs: Vec::new(),
        created_at: stamp.clone(),
        updated_at: stamp,
    });
    ok(json!({ "id": id }))
}

async fn update_profile(
    State(state): State<AppState>,
    Path((user_id, profile_id)): Path<(String, String)>,
    Json(input): Json<ProfileBody>,
) -> ApiResult {
    let mut store = state.db.write().await;
    let profile = store
        .profiles
        .iter_mut()
        .find(|p| p.id == profile_id && p.user_id == user_id)
        .ok_or_else(|| ApiFailure::not_found(format!("profile {profile_id} not found")))?;
    profile.content = input.content;
    if let Some(attributes) = input.attributes {
        profile.attributes = attributes;
    }
    profile.updated_at = now();
    done()
}

async fn delete_profile(
    State(state): State<AppState>,
    Path((user_id, profile_id)): Path<(String, String)>,
) -> ApiResult {
    let mut store = state.db.write().await;
    let before = store.profiles.len();
    store
        .profiles
        .retain(|p| !(p.id == profile_id && p.user_id == user_id));
    if store.profiles.len() == before {
        return Err(ApiFailure::not_found(format!("profile {profile_id} not found")));
    }
    done()
}

// --- events ---

#[derive(Deserialize)]
struct EventParams {
    #[serde(default = "default_limit")]
    topk: usize,
}

async fn get_events(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<EventParams>,
) -> ApiResult {
    let store = state.db.read().await;
    store.require_user(&user_id)?;
    let events: Vec<Value> = store
        .events
        .iter()
        .rev()
        .filter(|e| e.user_id == user_id)
        .take(params.topk)
        .map(|e| {
            json!({
                "id": e.id,
                "event_data": e.event_data,
                "created_at": e.created_at,
                "updated_at": e.created_at,
            })
        })
        .collect();
    ok(json!({ "events": events }))
}

async fn delete_event(
    State(state): State<AppState>,
    Path((user_id, event_id)): Path<(String, String)>,
) -> ApiResult {
    let mut store = state.db.write().await;
    let before = store.events.len();
    store
        .events
        .retain(|e| !(e.id == event_id && e.user_id == user_id));
    if store.events.len() == before {
        return Err(ApiFailure::not_found(format!("event {event_id} not found")));
    }
    done()
}

/// Merge the request's keys into the event's `event_data`.
async fn update_event(
    State(state): State<AppState>,
    Path((user_id, event_id)): Path<(String, String)>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult {
    let mut store = state.db.write().await;
    let event = store
        .events
        .iter_mut()
        .find(|e| e.id == event_id && e.user_id == user_id)
        .ok_or_else(|| ApiFailure::not_found(format!("event {event_id} not found")))?;
    if let Value::Object(data) = &mut event.event_data {
        data.extend(patch);
    }
    done()
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default = "default_limit")]
    topk: usize,
    #[serde(default = "default_similarity")]
    similarity_threshold: f64,
    #[serde(default = "default_range")]
    time_range_in_days: i64,
}

fn default_similarity() -> f64 {
    0.2
}

fn default_range() -> i64 {
    7
}

/// Share of query words found in the event's profile deltas.
fn similarity(query: &str, event_data: &Value) -> f64 {
    let text = event_data["profile_delta"]
        .as_array()
        .map(|deltas| {
            deltas
                .iter()
                .filter_map(|d| d["content"].as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
        .unwrap_or_default();
    let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| text.contains(w.as_str())).count();
    hits as f64 / words.len() as f64
}

async fn search_events(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult {
    let store = state.db.read().await;
    store.require_user(&user_id)?;
    let oldest = Utc::now() - Duration::days(params.time_range_in_days.clamp(0, 36_500));
    let mut scored: Vec<(&EventRow, f64)> = store
        .events
        .iter()
        .filter(|e| e.user_id == user_id)
        .filter(|e| {
            DateTime::parse_from_rfc3339(&e.created_at)
                .map(|ts| ts.with_timezone(&Utc) >= oldest)
                .unwrap_or(false)
        })
        .map(|e| (e, similarity(&params.query, &e.event_data)))
        .filter(|(_, score)| *score >= params.similarity_threshold)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    let events: Vec<Value> = scored
        .into_iter()
        .take(params.topk)
        .map(|(e, score)| {
            json!({
                "id": e.id,
                "event_data": e.event_data,
                "created_at": e.created_at,
                "updated_at": e.created_at,
                "similarity": score,
            })
        })
        .collect();
    ok(json!({ "events": events }))
}

// --- context ---

fn bad_request(message: impl Into<String>) -> ApiFailure {
    ApiFailure::new(StatusCode::BAD_REQUEST, message)
}

/// Render profiles and recent event deltas as a markdown prompt, cut off
/// once `max_token_size` whitespace-separated words are used.
async fn user_context(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult {
    let store = state.db.read().await;
    store.require_user(&user_id)?;

    let mut max_tokens = 1000usize;
    let mut only_topics: Vec<&str> = Vec::new();
    for (key, value) in &params {
        match key.as_str() {
            "max_token_size" => {
                max_tokens = value
                    .parse()
                    .map_err(|_| bad_request(format!("invalid max_token_size {value}")))?;
            }
            "only_topics" => only_topics.push(value),
            "topic_limits_json" => {
                serde_json::from_str::<HashMap<String, u32>>(value)
                    .map_err(|e| bad_request(format!("invalid topic_limits JSON: {e}")))?;
            }
            _ => {}
        }
    }

    let mut lines = vec!["# Memory".to_string(), "## User Profile".to_string()];
    for profile in store.profiles.iter().filter(|p| p.user_id == user_id) {
        let attribute = |key: &str| {
            profile.attributes[key]
                .as_str()
                .filter(|s| !s.is_empty())
                .unwrap_or("NONE")
                .to_string()
        };
        let topic = attribute("topic");
        if !only_topics.is_empty() && !only_topics.contains(&topic.as_str()) {
            continue;
        }
        lines.push(format!("- {topic}::{}: {}", attribute("sub_topic"), profile.content));
    }
    lines.push("## Past Events".to_string());
    for event in store.events.iter().rev().filter(|e| e.user_id == user_id) {
        let deltas = event.event_data["profile_delta"].as_array().cloned().unwrap_or_default();
        for delta in deltas {
            if let Some(content) = delta["content"].as_str() {
                lines.push(format!("- [{}] {content}", event.created_at));
            }
        }
    }

    let mut budget = max_tokens;
    let mut kept = Vec::new();
    for line in lines {
        let cost = line.split_whitespace().count();
        if cost > budget {
            break;
        }
        budget -= cost;
        kept.push(line);
    }
    ok(json!({ "context": kept.join("\n") }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_renders_envelope_with_status_as_errno() {
        let failure = ApiFailure::not_found("user u1 not found");
        assert_eq!(failure.status, StatusCode::NOT_FOUND);
        let response = failure.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn users_params_default_like_the_client() {
        let params: UsersParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.search, "");
        assert_eq!(params.order_by, "updated_at");
        assert!(params.order_desc);
        assert_eq!(params.limit, 10);
        assert_eq!(params.offset, 0);
    }

    #[test]
    fn store_counts_are_per_user() {
        let mut store = Store::default();
        store.events.push(EventRow {
            id: "e1".to_string(),
            user_id: "a".to_string(),
            event_data: json!({}),
            created_at: now(),
        });
        assert_eq!(store.event_count("a"), 1);
        assert_eq!(store.event_count("b"), 0);
        assert_eq!(store.profile_count("a"), 0);
        assert!(store.require_user("a").is_err());
    }

    #[test]
    fn similarity_counts_query_words_in_deltas() {
        let data = json!({ "profile_delta": [{ "content": "Moved to New York" }] });
        assert_eq!(similarity("new york", &data), 1.0);
        assert_eq!(similarity("york paris", &data), 0.5);
        assert_eq!(similarity("", &data), 0.0);
        assert_eq!(similarity("york", &json!({})), 0.0);
    }

    #[test]
    fn process_buffer_only_touches_matching_type() {
        let mut store = Store::default();
        for (id, blob_type, data) in [
            ("b1", "chat", json!({ "messages": [{ "role": "user", "content": "hi" }] })),
            ("b2", "doc", json!({ "content": "notes" })),
        ] {
            store.blobs.push(BlobRow {
                id: id.to_string(),
                user_id: "u".to_string(),
                blob_type: blob_type.to_string(),
                blob_data: data,
                fields: None,
                created_at: now(),
                buffered: true,
            });
        }
        store.process_buffer("u", "chat");
        assert!(!store.blobs[0].buffered);
        assert!(store.blobs[1].buffered);
        assert_eq!(store.profile_count("u"), 1);
        assert_eq!(store.event_count("u"), 1);

        store.process_buffer("u", "chat");
        assert_eq!(store.event_count("u"), 1);
    }
}
