use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bsky_publisher::handlers::oauth_router;
use bsky_publisher::service::{CollectionSummary, RecordSummary};
use bsky_publisher::{Error, Post, PostId, PostStore, PublishingService, Result, TokenState};
use serde::Deserialize;
use serde_json::json;

use crate::db::SqliteStore;
use crate::jobs::{JobKind, JobQueue};

#[derive(Clone)]
pub struct AppState {
    pub service: PublishingService,
    pub store: Arc<SqliteStore>,
    pub jobs: JobQueue,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/users/{did}", delete(delete_user))
        .route("/users/{did}/posts", post(create_post).get(list_posts))
        .route("/users/{did}/posts/{id}", get(get_post))
        .route("/users/{did}/posts/{id}/publish", post(publish_post))
        .route("/users/{did}/posts/{id}/unpublish", post(unpublish_post))
        .route("/users/{did}/posts/{id}/archive", post(archive_post))
        .route("/users/{did}/posts/{id}/unarchive", post(unarchive_post))
        .route("/users/{did}/preserved-form", get(take_preserved_form))
        .route("/users/{did}/bluesky/posts", get(recent_bluesky_posts))
        .route("/users/{did}/collections", get(list_collections))
        .route("/users/{did}/records", get(list_records))
        .route("/users/{did}/record", get(get_record))
        .with_state(state.clone());

    Router::new()
        .merge(oauth_router(state.service))
        .merge(api)
}

#[derive(Debug, Deserialize)]
struct PostForm {
    title: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    collection: String,
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecordQuery {
    uri: String,
}

/// Loads a post and checks it belongs to `did`
async fn owned_post(state: &AppState, did: &str, id: PostId) -> Result<Post> {
    match state.store.get_post(id).await? {
        Some(post) if post.user_did == did => Ok(post),
        _ => Err(Error::NotFound(format!("post {}", id))),
    }
}

async fn delete_user(State(state): State<AppState>, Path(did): Path<String>) -> Result<StatusCode> {
    if !state.store.delete_user(&did).await? {
        return Err(Error::NotFound(format!("user {}", did)));
    }
    tracing::info!("deleted user {} and their posts", did);
    Ok(StatusCode::NO_CONTENT)
}

async fn create_post(
    State(state): State<AppState>,
    Path(did): Path<String>,
    Json(form): Json<PostForm>,
) -> Result<Response> {
    let mut post = state.store.create_post(&did, &form.title, &form.content).await?;
    state.service.save_draft(&mut post).await?;
    Ok((StatusCode::CREATED, Json(post)).into_response())
}

async fn list_posts(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> Result<Json<Vec<Post>>> {
    Ok(Json(state.store.list_posts(&did).await?))
}

async fn get_post(
    State(state): State<AppState>,
    Path((did, id)): Path<(String, PostId)>,
) -> Result<Json<Post>> {
    Ok(Json(owned_post(&state, &did, id).await?))
}

/// Queues the remote write. Invalid posts are refused here rather than in
/// the job. A user without usable tokens gets a 401 and the request is kept
/// so it can be replayed after sign-in.
async fn enqueue(state: &AppState, did: &str, id: PostId, kind: JobKind) -> Result<Response> {
    let post = owned_post(state, did, id).await?;
    match kind {
        JobKind::Publish if !post.is_published() => post.check_publishable()?,
        JobKind::Publish => {}
        JobKind::Unpublish => post.check_unpublishable()?,
    }

    let credential = state.service.credential_for(did).await;
    let signed_in = credential.as_ref().is_ok_and(|c| {
        state.service.tokens().local_state(c, chrono::Utc::now()) != TokenState::Invalidated
    });
    if !signed_in {
        state.service.preserved_forms().preserve(
            did,
            json!({
                "post_id": post.id,
                "action": if kind == JobKind::Publish { "publish" } else { "unpublish" },
                "title": post.title,
            }),
        )?;
        return Err(Error::ReauthenticationRequired(format!(
            "sign in again to continue with post {}",
            post.id
        )));
    }

    state.jobs.enqueue(post.id, kind)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"queued": true, "post_id": post.id}))).into_response())
}

async fn publish_post(
    State(state): State<AppState>,
    Path((did, id)): Path<(String, PostId)>,
) -> Result<Response> {
    enqueue(&state, &did, id, JobKind::Publish).await
}

async fn unpublish_post(
    State(state): State<AppState>,
    Path((did, id)): Path<(String, PostId)>,
) -> Result<Response> {
    enqueue(&state, &did, id, JobKind::Unpublish).await
}

async fn archive_post(
    State(state): State<AppState>,
    Path((did, id)): Path<(String, PostId)>,
) -> Result<Json<Post>> {
    let mut post = owned_post(&state, &did, id).await?;
    state.service.archive(&mut post).await?;
    Ok(Json(post))
}

async fn unarchive_post(
    State(state): State<AppState>,
    Path((did, id)): Path<(String, PostId)>,
) -> Result<Json<Post>> {
    let mut post = owned_post(&state, &did, id).await?;
    state.service.unarchive(&mut post).await?;
    Ok(Json(post))
}

async fn take_preserved_form(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> Result<Response> {
    match state.service.preserved_forms().take(&did)? {
        Some(form) => Ok(Json(form).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn recent_bluesky_posts(
    State(state): State<AppState>,
    Path(did): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<RecordSummary>>> {
    let posts = state
        .service
        .fetch_recent_posts(&did, query.limit.unwrap_or(10))
        .await?;
    Ok(Json(posts))
}

async fn list_collections(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> Result<Json<Vec<CollectionSummary>>> {
    Ok(Json(state.service.list_collections(&did).await?))
}

async fn list_records(
    State(state): State<AppState>,
    Path(did): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Result<Response> {
    let page = state
        .service
        .list_records(
            &did,
            &query.collection,
            query.limit.unwrap_or(50),
            query.cursor.as_deref(),
        )
        .await?;
    Ok(Json(page).into_response())
}

async fn get_record(
    State(state): State<AppState>,
    Path(did): Path<String>,
    Query(query): Query<RecordQuery>,
) -> Result<Response> {
    let record = state.service.get_record(&did, &query.uri).await?;
    Ok(Json(record).into_response())
}
