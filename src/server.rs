//! HTTP surfaces: worker application server, plugin admin routes, and the
//! cluster proxy
//!
//! The worker server runs the enhancer and the plugin chain around every
//! request; the cluster proxy picks a worker per request and reports the
//! outcome back to the balancer.

use crate::balancer::RouteContext;
use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::monitoring::{ExportFormat, WorkerTelemetry};
use crate::plugins::{
    HookBus, PluginContext, PluginDescriptor, PluginEngine, PluginExecutor, PluginOutcome,
    PluginRegistry, PluginType, RequestStart, RequestTiming, RouteErrorInfo,
};
use crate::request::{EnhancedRequest, TrustProxy};
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Handler for an application route hosted by the framework
#[async_trait]
pub trait AppHandler: Send + Sync {
    async fn handle(&self, request: &EnhancedRequest) -> Result<Response>;
}

struct AppRoute {
    method: String,
    pattern: String,
    handler: Arc<dyn AppHandler>,
}

impl AppRoute {
    fn matches(&self, method: &str, path: &str) -> bool {
        if !self.method.eq_ignore_ascii_case(method) {
            return false;
        }
        match self.pattern.strip_suffix("/*") {
            Some(prefix) => path.starts_with(prefix),
            None => self.pattern == path,
        }
    }
}

/// Shared state of the worker application server
pub struct WorkerState {
    pub worker_id: String,
    pub telemetry: Arc<WorkerTelemetry>,
    pub engine: Arc<PluginEngine>,
    pub trust: TrustProxy,
    /// The in-process smart cache shared with the plugin engine
    pub cache: Arc<crate::cache::SmartCache<serde_json::Value>>,
    /// Encrypted overlay for application data, when enabled
    pub secure_cache: Option<Arc<crate::secure_cache::SecureCache>>,
    routes: tokio::sync::RwLock<Vec<AppRoute>>,
    /// Keeps the cache sweep/memory tasks alive for the server's lifetime
    _cache_maintenance: Option<crate::cache::CacheMaintenance>,
    _key_rotation: Option<crate::secure_cache::RotationSchedule>,
}

impl WorkerState {
    pub async fn register_route(&self, method: &str, pattern: &str, handler: Arc<dyn AppHandler>) {
        self.routes.write().await.push(AppRoute {
            method: method.to_string(),
            pattern: pattern.to_string(),
            handler,
        });
    }

    async fn find_handler(&self, method: &str, path: &str) -> Option<Arc<dyn AppHandler>> {
        self.routes
            .read()
            .await
            .iter()
            .find(|r| r.matches(method, path))
            .map(|r| Arc::clone(&r.handler))
    }
}

/// Build the worker router: health, plugin admin, and the enhanced
/// application fallback.
pub fn worker_router(state: Arc<WorkerState>) -> Router {
    let admin = plugin_router(AdminState {
        registry: Arc::clone(state.engine.registry()),
        engine: Arc::clone(&state.engine),
    });

    Router::new()
        .route("/health", get(worker_health))
        .fallback(handle_app_request)
        .with_state(Arc::clone(&state))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
}

async fn worker_health(State(state): State<Arc<WorkerState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "worker": state.worker_id,
        "uptime_seconds": state.telemetry.uptime().as_secs(),
    }))
}

/// The application path: enhance, run the plugin chain, dispatch, time.
async fn handle_app_request(
    State(state): State<Arc<WorkerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, BODY_LIMIT_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large", None)
        }
    };

    let mut enhanced =
        EnhancedRequest::enhance(&parts.method, &parts.uri, &parts.headers, peer, &state.trust);
    if !body_bytes.is_empty() {
        enhanced.body = Some(body_bytes.to_vec());
    }

    let hooks = Arc::clone(state.engine.hooks());
    hooks.emit_request_start(RequestStart {
        path: enhanced.path.clone(),
        method: enhanced.method.clone(),
        client_ip: enhanced.ip.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    });
    state.telemetry.request_started();

    let ctx = plugin_context(&enhanced);
    let response = match state.engine.execute_chain(&ctx, None).await {
        Ok(chain) => {
            if let Some(halt) = chain.response {
                let mut builder = axum::http::Response::builder().status(
                    StatusCode::from_u16(halt.status).unwrap_or(StatusCode::OK),
                );
                for (name, value) in &halt.headers {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        builder = builder.header(name, value);
                    }
                }
                builder
                    .body(Body::from(halt.body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            } else {
                match state.find_handler(&enhanced.method, &enhanced.path).await {
                    Some(handler) => match handler.handle(&enhanced).await {
                        Ok(response) => response,
                        Err(e) => {
                            emit_route_error(&hooks, &enhanced, 500, &e.to_string());
                            error_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "Internal Server Error",
                                Some(&e.to_string()),
                            )
                        }
                    },
                    None => error_response(StatusCode::NOT_FOUND, "Not Found", None),
                }
            }
        }
        Err(e) => {
            emit_route_error(&hooks, &enhanced, 500, &e.to_string());
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                Some(&e.to_string()),
            )
        }
    };

    let duration_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let status = response.status();
    hooks.emit_request_timing(RequestTiming {
        path: enhanced.path.clone(),
        method: enhanced.method.clone(),
        duration_ms,
        status_code: status.as_u16(),
        client_ip: enhanced.ip.to_string(),
        user_agent: enhanced.user_agent().to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    });
    state
        .telemetry
        .request_finished(duration_ms, status.is_server_error())
        .await;

    response
}

fn plugin_context(request: &EnhancedRequest) -> PluginContext {
    use std::hash::{Hash, Hasher};
    let body_hash = match &request.body {
        Some(body) => {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            body.hash(&mut hasher);
            hasher.finish()
        }
        None => 0,
    };
    PluginContext {
        method: request.method.clone(),
        path: request.path.clone(),
        query: request
            .query
            .entries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        body_hash,
        client_ip: request.ip.to_string(),
        user_agent: request.user_agent().to_string(),
        headers: HashMap::new(),
    }
}

fn emit_route_error(hooks: &HookBus, request: &EnhancedRequest, status: u16, message: &str) {
    hooks.emit_route_error(RouteErrorInfo {
        path: request.path.clone(),
        method: request.method.clone(),
        status_code: status,
        client_ip: request.ip.to_string(),
        message: message.to_string(),
        stack: String::new(),
        body_snapshot: request
            .body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default(),
        query_snapshot: format!("{:?}", request.query.entries()),
        params_snapshot: format!("{:?}", request.params),
        timestamp: chrono::Utc::now().timestamp_millis(),
    });
}

fn error_response(status: StatusCode, error: &str, message: Option<&str>) -> Response {
    let mut body = serde_json::json!({ "error": error });
    if let Some(message) = message {
        body["message"] = serde_json::Value::String(message.to_string());
    }
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Plugin admin surface
// ---------------------------------------------------------------------------

/// State for the plugin admin routes
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<PluginRegistry>,
    pub engine: Arc<PluginEngine>,
}

/// Types registrable over HTTP
const REGISTER_ALLOW_LIST: [PluginType; 3] = [
    PluginType::Performance,
    PluginType::Cache,
    PluginType::Monitoring,
];

pub fn plugin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health/plugins", get(plugins_health))
        .route("/plugins/{id}/stats", get(plugin_stats))
        .route("/plugins/register", post(register_plugin))
        .route("/plugins/{id}", delete(unregister_plugin))
        .with_state(state)
}

async fn plugins_health(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let registry = state.registry.registry_stats().await;
    Json(serde_json::json!({
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "plugins": {
            "registry": registry,
            "engine": {
                "chainBudgetMs": state.engine.chain_budget().as_millis() as u64,
            },
            "status": "ok",
        }
    }))
}

async fn plugin_stats(
    State(state): State<AdminState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.registry.stats(&id).await {
        Some(stats) => Json(serde_json::json!({
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "pluginId": id,
            "stats": stats,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "Plugin not found",
                "pluginId": id,
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    #[serde(rename = "pluginConfig")]
    plugin_config: Option<PluginDescriptor>,
}

/// Executor attached to plugins registered declaratively over HTTP: it
/// contributes monitoring counters but runs no foreign code.
struct DeclaredExecutor;

#[async_trait]
impl PluginExecutor for DeclaredExecutor {
    async fn execute(&self, ctx: &PluginContext) -> Result<PluginOutcome> {
        Ok(PluginOutcome::with_data(
            crate::plugins::PluginData::Monitoring {
                counters: HashMap::from([(format!("{} {}", ctx.method, ctx.path), 1u64)]),
            },
        ))
    }
}

async fn register_plugin(
    State(state): State<AdminState>,
    Json(body): Json<RegisterBody>,
) -> Response {
    let Some(descriptor) = body.plugin_config else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "pluginConfig is required" })),
        )
            .into_response();
    };

    if descriptor.id.is_empty() || descriptor.name.is_empty() || descriptor.version.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "id, name, and version are required" })),
        )
            .into_response();
    }

    if !REGISTER_ALLOW_LIST.contains(&descriptor.plugin_type) {
        warn!(plugin = %descriptor.id, plugin_type = descriptor.plugin_type.as_str(),
              "plugin registration rejected by type allow-list");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": "Plugin type not allowed",
                "allowed": ["performance", "cache", "monitoring"],
            })),
        )
            .into_response();
    }

    if state.registry.contains(&descriptor.id) {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "Plugin already registered",
                "pluginId": descriptor.id,
            })),
        )
            .into_response();
    }

    let id = descriptor.id.clone();
    let plugin_type = descriptor.plugin_type;
    match state.registry.register(descriptor, Arc::new(DeclaredExecutor)) {
        Ok(()) => {
            state.registry.activate(&id);
            info!(plugin = %id, "plugin registered via admin surface");
            Json(serde_json::json!({
                "success": true,
                "pluginId": id,
                "type": plugin_type.as_str(),
                "registeredAt": chrono::Utc::now().timestamp_millis(),
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn unregister_plugin(
    State(state): State<AdminState>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if state.registry.unregister(&id) {
        Json(serde_json::json!({ "success": true })).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "Plugin could not be removed", "pluginId": id })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Cluster proxy surface
// ---------------------------------------------------------------------------

/// State for the master-side proxy
#[derive(Clone)]
pub struct ProxyState {
    pub manager: Arc<ClusterManager>,
    pub client: reqwest::Client,
    pub trust: TrustProxy,
    pub affinity_header: String,
}

impl ProxyState {
    pub fn new(manager: Arc<ClusterManager>) -> Result<Self> {
        let config = manager.config().clone();
        let trust = TrustProxy::parse(&config.trust_proxy.trust)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            manager,
            client,
            trust,
            affinity_header: config.balancer.session_affinity_header,
        })
    }
}

/// Router for the primary port in cluster topology: cluster admin plus the
/// forwarding fallback.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/cluster/health", get(cluster_health))
        .route("/cluster/metrics", get(cluster_metrics))
        .fallback(forward_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn cluster_health(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    Json(state.manager.health_summary().await)
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

async fn cluster_metrics(
    State(state): State<ProxyState>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let format = match ExportFormat::parse(query.format.as_deref().unwrap_or("json")) {
        Ok(format) => format,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    match state.manager.export_metrics(format).await {
        Ok(rendered) => axum::http::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", format.content_type())
            .body(Body::from(rendered))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            error!(error = %e, "metrics export failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Forward one request to a balancer-picked worker and record the outcome.
async fn forward_request(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, BODY_LIMIT_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large", None)
        }
    };

    let forwarded_for = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let (client_ip, _) = state.trust.resolve_client(peer.ip(), forwarded_for);

    let ctx = RouteContext {
        client_ip: client_ip.to_string(),
        session_key: parts
            .headers
            .get(state.affinity_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        method: parts.method.to_string(),
    };

    // One extra attempt, and only for idempotent methods
    let attempts = if is_idempotent(&parts.method) { 2 } else { 1 };
    let mut last_failure = StatusCode::BAD_GATEWAY;

    for attempt in 0..attempts {
        let worker_id = match state.manager.balancer().pick(&ctx).await {
            Ok(worker_id) => worker_id,
            Err(_) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({
                        "error": "Service Unavailable",
                        "message": "No workers available",
                    })),
                )
                    .into_response()
            }
        };

        let record = match state.manager.worker_manager().record(&worker_id).await {
            Some(record) => record,
            None => {
                state.manager.balancer().record_error(&worker_id).await;
                continue;
            }
        };

        match forward_once(&state, &parts, &body_bytes, record.port).await {
            ForwardOutcome::Ok(response, latency_ms) => {
                if response.status().is_server_error() {
                    state.manager.balancer().record_error(&worker_id).await;
                } else {
                    state
                        .manager
                        .balancer()
                        .record_success(&worker_id, latency_ms)
                        .await;
                }
                return response;
            }
            ForwardOutcome::Timeout => {
                state.manager.balancer().record_error(&worker_id).await;
                // A timed-out non-idempotent request must not be replayed
                return error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout", None);
            }
            ForwardOutcome::Unreachable => {
                state.manager.balancer().record_error(&worker_id).await;
                last_failure = StatusCode::BAD_GATEWAY;
                debug!(worker = %worker_id, attempt, "worker unreachable, may retry");
            }
        }
    }

    error_response(last_failure, "Bad Gateway", None)
}

enum ForwardOutcome {
    Ok(Response, f64),
    Timeout,
    Unreachable,
}

async fn forward_once(
    state: &ProxyState,
    parts: &axum::http::request::Parts,
    body: &[u8],
    port: u16,
) -> ForwardOutcome {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://127.0.0.1:{}{}", port, path_and_query);

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return ForwardOutcome::Unreachable,
    };

    let mut outbound = state.client.request(method, &url);
    for (name, value) in parts.headers.iter() {
        if name.as_str() == "host" || name.as_str() == "content-length" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }
    if !body.is_empty() {
        outbound = outbound.body(body.to_vec());
    }

    let started = Instant::now();
    match outbound.send().await {
        Ok(upstream) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
            let status =
                StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = axum::http::Response::builder().status(status);
            for (name, value) in upstream.headers().iter() {
                if name.as_str() == "transfer-encoding" {
                    continue;
                }
                builder = builder.header(name, value);
            }
            match upstream.bytes().await {
                Ok(bytes) => ForwardOutcome::Ok(
                    builder
                        .body(Body::from(bytes))
                        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
                    latency_ms,
                ),
                Err(_) => ForwardOutcome::Unreachable,
            }
        }
        Err(e) if e.is_timeout() => ForwardOutcome::Timeout,
        Err(_) => ForwardOutcome::Unreachable,
    }
}

/// Bind and serve a router until the shutdown signal fires.
pub async fn serve(
    router: Router,
    addr: SocketAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Fatal(format!("bind {} failed: {}", addr, e)))?;
    info!(%addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await
    .map_err(|e| Error::Fatal(e.to_string()))
}

/// Bind first (so failures surface as exit-code-1 fatals), serve later.
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Fatal(format!("bind {} failed: {}", addr, e)))
}

/// Serve on an already-bound listener.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    router: Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await
    .map_err(|e| Error::Fatal(e.to_string()))
}

/// Build a default worker state wired to a config.
pub fn build_worker_state(worker_id: &str, config: &Config) -> Result<Arc<WorkerState>> {
    let telemetry = Arc::new(WorkerTelemetry::new(worker_id));
    let registry = Arc::new(PluginRegistry::new());
    let cache = Arc::new(crate::cache::SmartCache::from_config(&config.cache));
    let maintenance = crate::cache::CacheMaintenance::start(
        Arc::clone(&cache),
        Duration::from_secs(config.cache.cleanup_interval_secs),
        Duration::from_secs(config.cache.memory_check_interval_secs),
    );
    let hooks = Arc::new(HookBus::new());
    let engine = Arc::new(PluginEngine::new(
        registry,
        Arc::clone(&cache),
        Duration::from_millis(config.server.plugin_chain_budget_ms),
        hooks,
    ));
    let trust = TrustProxy::parse(&config.trust_proxy.trust)?;

    let (secure_cache, key_rotation) = if config.secure_cache.enabled {
        let secret = match config.ipc_secret() {
            Some(secret) => secret,
            None => secrecy::SecretString::from(crate::crypto::CipherSuite::generate_secret()?),
        };
        let strategy = crate::cache::EvictionStrategy::parse(&config.cache.strategy)
            .unwrap_or(crate::cache::EvictionStrategy::Adaptive);
        let overlay = Arc::new(crate::secure_cache::SecureCache::new(
            config.cache.max_entries,
            strategy,
            &secret,
            config.secure_cache.clone(),
        )?);
        let rotation = crate::secure_cache::RotationSchedule::start(
            Arc::clone(&overlay),
            Duration::from_secs(config.secure_cache.key_rotation_interval_secs),
        );
        (Some(overlay), Some(rotation))
    } else {
        (None, None)
    };

    Ok(Arc::new(WorkerState {
        worker_id: worker_id.to_string(),
        telemetry,
        engine,
        trust,
        cache,
        secure_cache,
        routes: tokio::sync::RwLock::new(Vec::new()),
        _cache_maintenance: Some(maintenance),
        _key_rotation: key_rotation,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EvictionStrategy, SmartCache};
    use tower::util::ServiceExt;

    fn admin_state() -> AdminState {
        let registry = Arc::new(PluginRegistry::new());
        let engine = Arc::new(PluginEngine::new(
            Arc::clone(&registry),
            Arc::new(SmartCache::new(64, EvictionStrategy::Lru)),
            Duration::from_secs(5),
            Arc::new(HookBus::new()),
        ));
        AdminState { registry, engine }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn register_request(body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/plugins/register")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_allows_monitoring_type() {
        let router = plugin_router(admin_state());
        let response = router
            .oneshot(register_request(serde_json::json!({
                "pluginConfig": {
                    "id": "latency-probe",
                    "name": "Latency Probe",
                    "version": "1.0.0",
                    "type": "monitoring"
                }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], serde_json::json!(true));
        assert_eq!(body["pluginId"], serde_json::json!("latency-probe"));
    }

    #[tokio::test]
    async fn test_register_rejects_disallowed_type() {
        let router = plugin_router(admin_state());
        let response = router
            .oneshot(register_request(serde_json::json!({
                "pluginConfig": {
                    "id": "evil-middleware",
                    "name": "Evil",
                    "version": "1.0.0",
                    "type": "middleware"
                }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_register_missing_fields_is_400() {
        let router = plugin_router(admin_state());
        let response = router
            .oneshot(register_request(serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_duplicate_is_409() {
        let state = admin_state();
        let body = serde_json::json!({
            "pluginConfig": {
                "id": "cache-helper",
                "name": "Cache Helper",
                "version": "0.1.0",
                "type": "cache"
            }
        });

        let response = plugin_router(state.clone())
            .oneshot(register_request(body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = plugin_router(state)
            .oneshot(register_request(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_plugin_stats_not_found() {
        let router = plugin_router(admin_state());
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/plugins/ghost/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], serde_json::json!("Plugin not found"));
        assert_eq!(body["pluginId"], serde_json::json!("ghost"));
    }

    #[tokio::test]
    async fn test_unregister_round_trip() {
        let state = admin_state();
        let register = plugin_router(state.clone())
            .oneshot(register_request(serde_json::json!({
                "pluginConfig": {
                    "id": "temp-plugin",
                    "name": "Temp",
                    "version": "1.0.0",
                    "type": "performance"
                }
            })))
            .await
            .unwrap();
        assert_eq!(register.status(), StatusCode::OK);

        let response = plugin_router(state.clone())
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/plugins/temp-plugin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Second delete has nothing to remove
        let response = plugin_router(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/plugins/temp-plugin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_plugins_health_shape() {
        let router = plugin_router(admin_state());
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health/plugins")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["timestamp"].is_i64());
        assert!(body["plugins"]["registry"].is_object());
        assert_eq!(body["plugins"]["status"], serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn test_worker_router_serves_health_and_404() {
        let config = Config::default();
        let state = build_worker_state("w0", &config).unwrap();
        state.engine.registry().activate_all();
        let router = worker_router(state);

        let mut request = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:5000".parse().unwrap()));
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["worker"], serde_json::json!("w0"));

        let mut request = axum::http::Request::builder()
            .uri("/no-such-route")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:5000".parse().unwrap()));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_app_route_dispatch() {
        struct Hello;

        #[async_trait]
        impl AppHandler for Hello {
            async fn handle(&self, request: &EnhancedRequest) -> Result<Response> {
                Ok((
                    StatusCode::OK,
                    format!("hello {}", request.query.get("name").unwrap_or("world")),
                )
                    .into_response())
            }
        }

        let config = Config::default();
        let state = build_worker_state("w0", &config).unwrap();
        state.register_route("GET", "/hello", Arc::new(Hello)).await;
        let router = worker_router(state);

        let mut request = axum::http::Request::builder()
            .uri("/hello?name=cluster")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:5000".parse().unwrap()));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&bytes[..], b"hello cluster");
    }
}
