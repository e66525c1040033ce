#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use url::Url;

use bsky_publisher::{
    AuthScheme, CredentialStore, MemoryStore, PublishFormat, PublisherConfig, PublishingService,
    UserCredential,
};

pub const DID: &str = "did:plc:abc";
pub const SERVER_NONCE: &str = "server-nonce-1";

/// How a fake endpoint answers
#[derive(Clone, Debug)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            delay: None,
        }
    }

    pub fn status(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            delay: None,
        }
    }

    pub fn hang() -> Self {
        Self {
            status: 200,
            body: json!({}),
            delay: Some(Duration::from_secs(5)),
        }
    }
}

/// Mutable behaviour and request counters of the fake data server
pub struct FakeState {
    pub base: Mutex<String>,
    pub create: Mutex<Reply>,
    pub delete: Mutex<Reply>,
    pub get_session: Mutex<Reply>,
    pub refresh_session: Mutex<Reply>,
    pub token: Mutex<Reply>,
    pub list: Mutex<Reply>,
    pub get_record: Mutex<Reply>,
    /// createRecord demands the server nonce in the proof
    pub create_requires_nonce: Mutex<bool>,
    /// createRecord answers every request with a nonce challenge
    pub create_always_challenges: Mutex<bool>,
    /// When set, refreshSession only accepts this token and rotates it
    pub live_refresh_token: Mutex<Option<String>>,

    pub create_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub session_checks: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub challenge_calls: AtomicUsize,
    pub did_lookups: AtomicUsize,

    pub last_create_body: Mutex<Option<Value>>,
    pub last_token_form: Mutex<Option<HashMap<String, String>>>,
    pub proofs: Mutex<Vec<Value>>,
    pub authorizations: Mutex<Vec<String>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            base: Mutex::new(String::new()),
            create: Mutex::new(Reply::ok(json!({
                "uri": "at://did:plc:abc/com.whtwnd.blog.entry/xyz",
                "cid": "bafy123"
            }))),
            delete: Mutex::new(Reply::ok(json!({}))),
            get_session: Mutex::new(Reply::ok(json!({"did": DID, "handle": "alice.test"}))),
            refresh_session: Mutex::new(Reply::ok(json!({
                "did": DID,
                "accessJwt": "refreshed-access",
                "refreshJwt": "refreshed-refresh"
            }))),
            token: Mutex::new(Reply::ok(json!({
                "access_token": "oauth-access",
                "refresh_token": "oauth-refresh",
                "token_type": "DPoP",
                "expires_in": 3600,
                "sub": DID
            }))),
            list: Mutex::new(Reply::ok(json!({"records": []}))),
            get_record: Mutex::new(Reply::status(
                400,
                json!({"error": "RecordNotFound", "message": "Could not locate record"}),
            )),
            create_requires_nonce: Mutex::new(false),
            create_always_challenges: Mutex::new(false),
            live_refresh_token: Mutex::new(None),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            session_checks: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            token_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            challenge_calls: AtomicUsize::new(0),
            did_lookups: AtomicUsize::new(0),
            last_create_body: Mutex::new(None),
            last_token_form: Mutex::new(None),
            proofs: Mutex::new(Vec::new()),
            authorizations: Mutex::new(Vec::new()),
        }
    }
}

impl FakeState {
    pub fn set(&self, slot: &Mutex<Reply>, reply: Reply) {
        *slot.lock().unwrap() = reply;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakePds {
    pub url: Url,
    pub state: Arc<FakeState>,
}

fn proof_claims(headers: &HeaderMap) -> Option<Value> {
    let proof = headers.get("DPoP")?.to_str().ok()?;
    let payload = proof.split('.').nth(1)?;
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()
}

fn record_request(state: &FakeState, headers: &HeaderMap) -> Option<Value> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.authorizations.lock().unwrap().push(auth.to_string());
    }
    let claims = proof_claims(headers);
    if let Some(claims) = &claims {
        state.proofs.lock().unwrap().push(claims.clone());
    }
    claims
}

async fn reply(reply: Reply) -> Response {
    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

fn nonce_challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            ("DPoP-Nonce", SERVER_NONCE),
            ("WWW-Authenticate", r#"DPoP error="use_dpop_nonce""#),
        ],
        Json(json!({"error": "use_dpop_nonce", "message": "DPoP nonce mismatch"})),
    )
        .into_response()
}

async fn did_document(State(state): State<Arc<FakeState>>, Path(did): Path<String>) -> Response {
    state.did_lookups.fetch_add(1, Ordering::SeqCst);
    let base = state.base.lock().unwrap().clone();
    match did.as_str() {
        DID => Json(json!({
            "id": DID,
            "alsoKnownAs": ["at://alice.test"],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": base
            }]
        }))
        .into_response(),
        "did:plc:nopds" => Json(json!({"id": "did:plc:nopds", "service": []})).into_response(),
        _ => (StatusCode::NOT_FOUND, "DID not registered").into_response(),
    }
}

async fn create_record(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.create_calls.fetch_add(1, Ordering::SeqCst);
    let claims = record_request(&state, &headers);
    *state.last_create_body.lock().unwrap() = Some(body);

    if *state.create_always_challenges.lock().unwrap() {
        return nonce_challenge();
    }
    if *state.create_requires_nonce.lock().unwrap() {
        let nonce = claims.as_ref().and_then(|c| c.get("nonce")).and_then(|n| n.as_str());
        if nonce != Some(SERVER_NONCE) {
            return nonce_challenge();
        }
    }

    let configured = state.create.lock().unwrap().clone();
    reply(configured).await
}

async fn delete_record(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    state.delete_calls.fetch_add(1, Ordering::SeqCst);
    record_request(&state, &headers);
    let configured = state.delete.lock().unwrap().clone();
    reply(configured).await
}

async fn get_session(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    state.session_checks.fetch_add(1, Ordering::SeqCst);
    record_request(&state, &headers);
    let configured = state.get_session.lock().unwrap().clone();
    reply(configured).await
}

fn rotate_refresh(state: &FakeState, presented: Option<&str>, call: usize) -> Option<Response> {
    let mut live = state.live_refresh_token.lock().unwrap();
    let current = live.as_mut()?;
    if presented != Some(current.as_str()) {
        return Some(
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "ExpiredToken", "message": "Token has been revoked"})),
            )
                .into_response(),
        );
    }
    *current = format!("refresh-{}", call);
    Some(
        Json(json!({
            "did": DID,
            "accessJwt": format!("access-{}", call),
            "refreshJwt": current.clone()
        }))
        .into_response(),
    )
}

async fn refresh_session(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    let call = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    record_request(&state, &headers);

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    if let Some(response) = rotate_refresh(&state, presented.as_deref(), call) {
        return response;
    }

    let configured = state.refresh_session.lock().unwrap().clone();
    reply(configured).await
}

async fn list_records(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Query(_query): Query<HashMap<String, String>>,
) -> Response {
    state.list_calls.fetch_add(1, Ordering::SeqCst);
    record_request(&state, &headers);
    let configured = state.list.lock().unwrap().clone();
    reply(configured).await
}

async fn get_record(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    record_request(&state, &headers);
    let configured = state.get_record.lock().unwrap().clone();
    reply(configured).await
}

async fn always_challenge(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    state.challenge_calls.fetch_add(1, Ordering::SeqCst);
    record_request(&state, &headers);
    nonce_challenge()
}

async fn protected_resource(State(state): State<Arc<FakeState>>) -> Response {
    let base = state.base.lock().unwrap().clone();
    Json(json!({"resource": base, "authorization_servers": [base]})).into_response()
}

async fn authorization_server(State(state): State<Arc<FakeState>>) -> Response {
    let base = state.base.lock().unwrap().clone();
    Json(json!({
        "issuer": base,
        "token_endpoint": format!("{}/oauth/token", base),
        "revocation_endpoint": format!("{}/oauth/revoke", base)
    }))
    .into_response()
}

async fn token(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    let claims = record_request(&state, &headers);
    *state.last_token_form.lock().unwrap() = Some(form);

    let nonce = claims.as_ref().and_then(|c| c.get("nonce")).and_then(|n| n.as_str());
    if nonce != Some(SERVER_NONCE) {
        return (
            StatusCode::BAD_REQUEST,
            [("DPoP-Nonce", SERVER_NONCE)],
            Json(json!({"error": "use_dpop_nonce", "error_description": "Authorization server requires nonce in DPoP proof"})),
        )
            .into_response();
    }

    let configured = state.token.lock().unwrap().clone();
    reply(configured).await
}

/// Starts a fake PDS (also serving as DID directory and authorization server)
pub async fn spawn_fake_pds() -> FakePds {
    let state = Arc::new(FakeState::default());

    let app = Router::new()
        .route("/{did}", get(did_document))
        .route("/xrpc/com.atproto.repo.createRecord", post(create_record))
        .route("/xrpc/com.atproto.repo.deleteRecord", post(delete_record))
        .route("/xrpc/com.atproto.repo.listRecords", get(list_records))
        .route("/xrpc/com.atproto.repo.getRecord", get(get_record))
        .route("/xrpc/com.atproto.server.getSession", get(get_session))
        .route("/xrpc/com.atproto.server.refreshSession", post(refresh_session))
        .route("/xrpc/test.nonce", get(always_challenge))
        .route("/.well-known/oauth-protected-resource", get(protected_resource))
        .route("/.well-known/oauth-authorization-server", get(authorization_server))
        .route("/oauth/token", post(token))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://{}", addr);
    *state.base.lock().unwrap() = base.clone();

    FakePds {
        url: Url::parse(&base).unwrap(),
        state,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config_for(pds: &FakePds, key_dir: &std::path::Path) -> PublisherConfig {
    PublisherConfig::new(Url::parse("http://localhost:3000").unwrap())
        .with_default_pds(pds.url.clone())
        .with_identity_directory(pds.url.clone())
        .with_key_dir(key_dir)
        .with_http_timeout(Duration::from_millis(500))
}

pub struct Harness {
    pub pds: FakePds,
    pub store: Arc<MemoryStore>,
    pub service: PublishingService,
    _keys: tempfile::TempDir,
}

impl Harness {
    pub async fn new(format: PublishFormat, scheme: AuthScheme) -> Self {
        init_tracing();
        let pds = spawn_fake_pds().await;
        let keys = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let credential = UserCredential::new(
            DID,
            scheme,
            "access-token",
            "refresh-token",
            Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        );
        store.save_credential(&credential).await.unwrap();

        let service = PublishingService::builder()
            .config(config_for(&pds, keys.path()).with_publish_format(format))
            .credential_store(store.clone())
            .post_store(store.clone())
            .build()
            .unwrap();

        Self {
            pds,
            store,
            service,
            _keys: keys,
        }
    }

    pub async fn stored_credential(&self) -> UserCredential {
        self.store.load_credential(DID).await.unwrap().unwrap()
    }
}
