//! In-process mock of an upstream registry that requires bearer tokens

#![allow(dead_code)]

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use registry_proxy::Digest;
use registry_proxy::context::NAME_VAR;
use registry_proxy::RequestContext;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

pub const REPOSITORY: &str = "library/redis";
pub const TAG: &str = "7.2";
pub const TOKEN: &str = "mock-registry-token";
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Default)]
pub struct Counters {
    pub pings: AtomicUsize,
    pub tokens: AtomicUsize,
    pub blob_gets: AtomicUsize,
    pub manifest_gets: AtomicUsize,
}

impl Counters {
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> usize {
        self.tokens.load(Ordering::SeqCst)
    }

    pub fn blob_gets(&self) -> usize {
        self.blob_gets.load(Ordering::SeqCst)
    }

    pub fn manifest_gets(&self) -> usize {
        self.manifest_gets.load(Ordering::SeqCst)
    }
}

pub struct MockState {
    pub counters: Counters,
    pub challenge: String,
    pub blobs: HashMap<String, Bytes>,
    pub manifest: Bytes,
    pub manifest_digest: Digest,
    /// `Authorization` header of the last token request
    pub token_authorization: Mutex<Option<String>>,
    /// `scope` of the last token request
    pub token_scope: Mutex<Option<String>>,
}

pub struct MockRegistry {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    pub config: Bytes,
    pub layer: Bytes,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = Bytes::from_static(br#"{"architecture":"amd64","os":"linux"}"#);
        let layer = Bytes::from(vec![7u8; 200 * 1024]);
        let config_digest = Digest::from_bytes(&config);
        let layer_digest = Digest::from_bytes(&layer);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer_digest,
                "size": layer.len(),
            }],
        });
        let manifest = Bytes::from(manifest.to_string());

        let mut blobs = HashMap::new();
        blobs.insert(config_digest.to_string(), config.clone());
        blobs.insert(layer_digest.to_string(), layer.clone());

        let state = Arc::new(MockState {
            counters: Counters::default(),
            challenge: format!(
                r#"Bearer realm="http://{}/token",service="mock-registry""#,
                addr
            ),
            blobs,
            manifest_digest: Digest::from_bytes(&manifest),
            manifest,
            token_authorization: Mutex::new(None),
            token_scope: Mutex::new(None),
        });

        let app = Router::new()
            .route("/v2/", get(ping))
            .route("/token", get(token))
            .route("/v2/library/redis/blobs/{digest}", get(blob))
            .route("/v2/library/redis/manifests/{reference}", get(manifest_handler))
            .route("/v2/library/redis/tags/list", get(tags_list))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            config,
            layer,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }
}

/// Context of an inbound request for `name`, as the HTTP layer would build it
pub fn request_context(name: &str, query: &str) -> RequestContext {
    let url = Url::parse(&format!("http://localhost:5000/v2/{}/manifests/latest{}", name, query)).unwrap();
    RequestContext::for_request(url).with_var(NAME_VAR, name)
}

fn unauthorized(state: &MockState) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, state.challenge.clone())],
    )
        .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|h| h == format!("Bearer {}", TOKEN))
}

async fn ping(State(state): State<Arc<MockState>>) -> Response {
    state.counters.pings.fetch_add(1, Ordering::SeqCst);
    unauthorized(&state)
}

async fn token(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    state.counters.tokens.fetch_add(1, Ordering::SeqCst);
    *state.token_scope.lock().unwrap() = params.get("scope").cloned();
    *state.token_authorization.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    axum::Json(serde_json::json!({ "token": TOKEN, "expires_in": 300 })).into_response()
}

async fn blob(
    State(state): State<Arc<MockState>>,
    Path(digest): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized(&state);
    }
    if method == Method::GET {
        state.counters.blob_gets.fetch_add(1, Ordering::SeqCst);
    }
    match state.blobs.get(&digest) {
        Some(content) => (
            [(header::CONTENT_TYPE, "application/octet-stream".to_string())],
            content.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn manifest_handler(
    State(state): State<Arc<MockState>>,
    Path(reference): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized(&state);
    }
    if reference != TAG && reference != state.manifest_digest.as_str() {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method == Method::GET {
        state.counters.manifest_gets.fetch_add(1, Ordering::SeqCst);
    }
    (
        [
            (header::CONTENT_TYPE, MANIFEST_MEDIA_TYPE.to_string()),
            (
                header::HeaderName::from_static("docker-content-digest"),
                state.manifest_digest.to_string(),
            ),
        ],
        state.manifest.clone(),
    )
        .into_response()
}

async fn tags_list(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized(&state);
    }
    axum::Json(serde_json::json!({ "name": REPOSITORY, "tags": [TAG, "latest"] })).into_response()
}
