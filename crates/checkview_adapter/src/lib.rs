#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::env;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Extension, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use checkview_contracts::gate::{
    Admitted, GateDenial, GateRequest, TokenValidator, TransportSecurity, CLIENT_DENIAL_MESSAGE,
};
use checkview_contracts::session::{
    CookieScope, SessionCookie, TestContext, VisitorAddress, DEFAULT_SESSION_TTL_MS, TEST_ID_PARAM,
};
use checkview_engines::token::{Hs256TokenValidator, TokenKeyError};
use checkview_os::cleanup::{
    CleanupScheduler, RetentionCleanup, ScheduleOutcome, DEFAULT_CLEANUP_INTERVAL,
    NONCE_CLEANUP_JOB,
};
use checkview_os::clock::{Clock, SystemClock};
use checkview_os::gate::PermissionGate;
use checkview_os::session_resolver::{SessionResolver, SessionResolverConfig};
use checkview_os::test_registry::{RegisterFormTestRequest, RegistrationError, TestRegistry};
use checkview_storage::repo::CheckviewStore;
use checkview_storage::sqlite::{SqliteStore, DEFAULT_BUSY_TIMEOUT};
use checkview_storage::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_SEND_TO: &str = "verify@test-mail.checkview.io";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

pub const HEALTH_PATH: &str = "/healthz";
pub const REGISTER_FORM_TEST_PATH: &str = "/checkview/v1/forms/registerformtest";
pub const PAGE_VIEW_PATH: &str = "/checkview/v1/pageview";
pub const SUBMISSION_PATH: &str = "/wp-admin/admin-ajax.php";

const NO_CACHE_CONTROL: &str = "no-cache, must-revalidate, max-age=0, no-store, private";
const NO_CACHE_EXPIRES: &str = "Wed, 11 Jan 1984 05:00:00 GMT";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("CHECKVIEW_TOKEN_SECRET must be set")]
    MissingTokenSecret,
    #[error("CHECKVIEW_HTTP_BIND is not a socket address: {0}")]
    InvalidBind(String),
    #[error("CHECKVIEW_BOT_IPS entry is not an IP address: {0}")]
    InvalidBotAddress(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store unavailable: {0}")]
    Storage(#[from] StorageError),
    #[error("token validator setup failed: {0}")]
    TokenKey(#[from] TokenKeyError),
}

#[derive(Clone)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    /// `None` keeps everything in an in-memory sqlite database.
    pub db_path: Option<PathBuf>,
    pub token_secret: String,
    pub default_send_to: String,
    pub cookie_scope: CookieScope,
    pub trust_forwarded_proto: bool,
    pub bot_addresses: BTreeSet<VisitorAddress>,
    pub cleanup_interval_ms: u64,
    pub store_timeout_ms: u64,
    pub session_ttl_ms: u64,
}

impl std::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("bind", &self.bind)
            .field("db_path", &self.db_path)
            .field("token_secret", &"<redacted>")
            .field("default_send_to", &self.default_send_to)
            .field("cookie_scope", &self.cookie_scope)
            .field("trust_forwarded_proto", &self.trust_forwarded_proto)
            .field("bot_addresses", &self.bot_addresses)
            .field("cleanup_interval_ms", &self.cleanup_interval_ms)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("session_ttl_ms", &self.session_ttl_ms)
            .finish()
    }
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_raw = non_empty("CHECKVIEW_HTTP_BIND").unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidBind(bind_raw.clone()))?;
        let token_secret = non_empty("CHECKVIEW_TOKEN_SECRET").ok_or(ConfigError::MissingTokenSecret)?;
        let bot_addresses = parse_bot_addresses(non_empty("CHECKVIEW_BOT_IPS").as_deref())?;

        Ok(Self {
            bind,
            db_path: non_empty("CHECKVIEW_DB_PATH").map(PathBuf::from),
            token_secret,
            default_send_to: non_empty("CHECKVIEW_DEFAULT_EMAIL")
                .unwrap_or_else(|| DEFAULT_SEND_TO.to_string()),
            cookie_scope: CookieScope {
                domain: non_empty("CHECKVIEW_COOKIE_DOMAIN").unwrap_or_default(),
                path: non_empty("CHECKVIEW_COOKIE_PATH").unwrap_or_else(|| "/".to_string()),
            },
            trust_forwarded_proto: parse_flag_from_env(
                &lookup,
                "CHECKVIEW_TRUST_FORWARDED_PROTO",
                true,
            ),
            bot_addresses,
            cleanup_interval_ms: parse_ms_from_env(
                &lookup,
                "CHECKVIEW_CLEANUP_INTERVAL_MS",
                60_000..=86_400_000,
                DEFAULT_CLEANUP_INTERVAL.as_millis() as u64,
            ),
            store_timeout_ms: parse_ms_from_env(
                &lookup,
                "CHECKVIEW_STORE_TIMEOUT_MS",
                50..=30_000,
                DEFAULT_STORE_TIMEOUT_MS,
            ),
            session_ttl_ms: parse_ms_from_env(
                &lookup,
                "CHECKVIEW_SESSION_TTL_MS",
                60_000..=86_400_000,
                DEFAULT_SESSION_TTL_MS,
            ),
        })
    }
}

fn parse_flag_from_env(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        None => default,
    }
}

fn parse_ms_from_env(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    range: RangeInclusive<u64>,
    default: u64,
) -> u64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .unwrap_or(default)
}

fn parse_bot_addresses(raw: Option<&str>) -> Result<BTreeSet<VisitorAddress>, ConfigError> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| VisitorAddress::new(s).map_err(|_| ConfigError::InvalidBotAddress(s.to_string())))
        .collect()
}

/// Everything the HTTP surface needs, cheap to clone into each request.
#[derive(Clone)]
pub struct AdapterRuntime {
    gate: PermissionGate,
    resolver: SessionResolver,
    registry: TestRegistry,
    cleanup: Arc<RetentionCleanup>,
    scheduler: Arc<CleanupScheduler>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    cleanup_interval: Duration,
    trust_forwarded_proto: bool,
}

impl AdapterRuntime {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let store: Arc<dyn CheckviewStore> = match &config.db_path {
            Some(path) => Arc::new(SqliteStore::open(path, DEFAULT_BUSY_TIMEOUT)?),
            None => Arc::new(SqliteStore::open_in_memory()?),
        };
        let validator = Arc::new(Hs256TokenValidator::new(config.token_secret.as_bytes().to_vec())?);
        Ok(Self::with_parts(store, validator, Arc::new(SystemClock), config))
    }

    pub fn with_parts(
        store: Arc<dyn CheckviewStore>,
        validator: Arc<dyn TokenValidator>,
        clock: Arc<dyn Clock>,
        config: &AdapterConfig,
    ) -> Self {
        let resolver_config = SessionResolverConfig {
            cookie_scope: config.cookie_scope.clone(),
            default_send_to: config.default_send_to.clone(),
            bot_addresses: config.bot_addresses.clone(),
            session_ttl_ms: config.session_ttl_ms,
        };
        Self {
            gate: PermissionGate::new(validator, store.clone()),
            resolver: SessionResolver::new(store.clone(), resolver_config),
            registry: TestRegistry::new(store.clone()),
            cleanup: Arc::new(
                RetentionCleanup::new(store).with_session_ttl_ms(config.session_ttl_ms),
            ),
            scheduler: Arc::new(CleanupScheduler::new()),
            clock,
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
            trust_forwarded_proto: config.trust_forwarded_proto,
        }
    }

    /// Idempotent: a second call finds the job already registered.
    pub fn start_cleanup(&self) -> ScheduleOutcome {
        self.scheduler.schedule_recurring(
            NONCE_CLEANUP_JOB,
            self.cleanup_interval,
            self.cleanup.clone(),
            self.clock.clone(),
        )
    }

    pub fn stop_cleanup(&self) {
        self.scheduler.shutdown();
    }

    pub fn router(self) -> Router {
        let gated = Router::new()
            .route(REGISTER_FORM_TEST_PATH, post(register_form_test))
            .route_layer(middleware::from_fn_with_state(self.clone(), require_admission));
        Router::new()
            .route(HEALTH_PATH, get(healthz))
            .route(PAGE_VIEW_PATH, get(page_view))
            .route(SUBMISSION_PATH, post(submission))
            .merge(gated)
            .with_state(self)
    }

    /// Runs blocking store work off the async workers, bounded by the store timeout.
    async fn bounded<T, F>(&self, op: &'static str, work: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match tokio::time::timeout(self.store_timeout, tokio::task::spawn_blocking(work)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join)) => Err(StorageError::Backend {
                op,
                detail: join.to_string(),
            }),
            Err(_) => Err(StorageError::Timeout { op }),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// This listener never terminates TLS itself, so encryption is only ever learned from
/// the fronting proxy, and only when that proxy is trusted.
pub fn transport_security(headers: &HeaderMap, trust_forwarded_proto: bool) -> TransportSecurity {
    if !trust_forwarded_proto {
        return TransportSecurity::Plaintext;
    }
    let forwarded_https = header_str(headers, "x-forwarded-proto")
        .and_then(|v| v.split(',').next())
        .is_some_and(|p| p.trim().eq_ignore_ascii_case("https"));
    let forwarded_ssl =
        header_str(headers, "x-forwarded-ssl").is_some_and(|v| v.eq_ignore_ascii_case("on"));
    if forwarded_https || forwarded_ssl {
        TransportSecurity::Encrypted
    } else {
        TransportSecurity::Plaintext
    }
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the socket peer.
pub fn visitor_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(first.to_string());
    }
    if let Some(real) = header_str(headers, "x-real-ip") {
        return Some(real.to_string());
    }
    peer.map(|addr| addr.ip().to_string())
}

pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
}

pub fn render_set_cookie(cookie: &SessionCookie) -> String {
    let mut out = format!(
        "{}={}; Max-Age={}; Path={}",
        cookie.name, cookie.value, cookie.max_age_s, cookie.path
    );
    if !cookie.domain.is_empty() {
        out.push_str("; Domain=");
        out.push_str(&cookie.domain);
    }
    out
}

fn apply_no_cache(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE_CONTROL));
    headers.insert(header::EXPIRES, HeaderValue::from_static(NO_CACHE_EXPIRES));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub code: u16,
    pub message: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let mut response = (
        status,
        Json(ApiErrorResponse {
            code: status.as_u16(),
            message: message.to_string(),
        }),
    )
        .into_response();
    apply_no_cache(response.headers_mut());
    response
}

fn denial_response(denial: &GateDenial) -> Response {
    let status = StatusCode::from_u16(denial.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    error_response(status, denial.client_message())
}

async fn require_admission(State(rt): State<AdapterRuntime>, mut req: Request, next: Next) -> Response {
    let authorization = header_str(req.headers(), header::AUTHORIZATION.as_str()).map(str::to_string);
    let transport = transport_security(req.headers(), rt.trust_forwarded_proto);
    let now = rt.clock.now();
    let gate = rt.gate.clone();

    let verdict = rt
        .bounded("permission_gate", move || {
            gate.evaluate(&GateRequest {
                authorization: authorization.as_deref(),
                transport,
                now,
            })
        })
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "permission gate did not finish; failing closed");
            Err(GateDenial::StoreError {
                detail: err.to_string(),
            })
        });

    match verdict {
        Ok(admitted) => {
            req.extensions_mut().insert(admitted);
            let mut response = next.run(req).await;
            apply_no_cache(response.headers_mut());
            response
        }
        Err(denial) => denial_response(&denial),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub cleanup_scheduled: bool,
}

async fn healthz(State(rt): State<AdapterRuntime>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        cleanup_scheduled: rt.scheduler.is_scheduled(NONCE_CLEANUP_JOB),
    })
}

/// JSON registration fields. Ids arrive as numbers or strings depending on the caller,
/// under either the long or the short field name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterFormTestBody {
    #[serde(default, alias = "frm_id")]
    pub form_id: Option<Value>,
    #[serde(default, alias = "pg_id")]
    pub page_id: Option<Value>,
    #[serde(default, rename = "type")]
    pub test_type: Option<Value>,
    #[serde(default)]
    pub send_to: Option<Value>,
}

fn scalar_text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

impl From<&RegisterFormTestBody> for RegisterFormTestRequest {
    fn from(body: &RegisterFormTestBody) -> Self {
        Self {
            form_id: scalar_text(&body.form_id),
            page_id: scalar_text(&body.page_id),
            test_type: scalar_text(&body.test_type),
            send_to: scalar_text(&body.send_to),
        }
    }
}

/// Reads registration fields from `key=value&...` pairs. Later pairs win.
fn registration_from_pairs(raw: &[u8]) -> RegisterFormTestRequest {
    let mut req = RegisterFormTestRequest::default();
    for (key, value) in url::form_urlencoded::parse(raw) {
        let slot = match key.as_ref() {
            "form_id" | "frm_id" => &mut req.form_id,
            "page_id" | "pg_id" => &mut req.page_id,
            "type" => &mut req.test_type,
            "send_to" => &mut req.send_to,
            _ => continue,
        };
        *slot = Some(value.into_owned());
    }
    req
}

fn is_form_encoded(headers: &HeaderMap) -> bool {
    header_str(headers, header::CONTENT_TYPE.as_str())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Body fields (JSON or form-encoded) first, then the query string. An unreadable body
/// contributes nothing and the registration reports incomplete details.
fn registration_request(uri: &Uri, headers: &HeaderMap, body: &[u8]) -> RegisterFormTestRequest {
    let from_body = if is_form_encoded(headers) {
        registration_from_pairs(body)
    } else if body.iter().all(u8::is_ascii_whitespace) {
        RegisterFormTestRequest::default()
    } else {
        match serde_json::from_slice::<RegisterFormTestBody>(body) {
            Ok(parsed) => RegisterFormTestRequest::from(&parsed),
            Err(err) => {
                warn!(error = %err, "registration body is not valid JSON");
                RegisterFormTestRequest::default()
            }
        }
    };
    let from_query = registration_from_pairs(uri.query().unwrap_or_default().as_bytes());
    RegisterFormTestRequest {
        form_id: from_body.form_id.or(from_query.form_id),
        page_id: from_body.page_id.or(from_query.page_id),
        test_type: from_body.test_type.or(from_query.test_type),
        send_to: from_body.send_to.or(from_query.send_to),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFormTestResponse {
    pub status: String,
    pub test_key: String,
}

async fn register_form_test(
    State(rt): State<AdapterRuntime>,
    Extension(admitted): Extension<Admitted>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let registry = rt.registry.clone();
    let request = registration_request(&uri, &headers, &body);
    let outcome = rt
        .bounded("register_form_test", move || {
            registry.register_form_test(&admitted, &request)
        })
        .await
        .map_err(RegistrationError::from)
        .and_then(|r| r);

    match outcome {
        Ok(key) => Json(RegisterFormTestResponse {
            status: "success".to_string(),
            test_key: key.as_str().to_string(),
        })
        .into_response(),
        Err(err @ RegistrationError::Incomplete(_)) => {
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(RegistrationError::Store(err)) => {
            error!(error = %err, "form test registration failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, CLIENT_DENIAL_MESSAGE)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageViewQuery {
    #[serde(default)]
    pub page_id: Option<u64>,
    #[serde(default)]
    pub checkview_test_id: Option<String>,
}

fn context_response(context: TestContext, cookies: &[SessionCookie]) -> Response {
    let mut response = Json(context).into_response();
    for cookie in cookies {
        match HeaderValue::from_str(&render_set_cookie(cookie)) {
            Ok(v) => {
                response.headers_mut().append(header::SET_COOKIE, v);
            }
            Err(err) => warn!(cookie = cookie.name.as_str(), error = %err, "cookie not representable"),
        }
    }
    apply_no_cache(response.headers_mut());
    response
}

async fn page_view(
    State(rt): State<AdapterRuntime>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<PageViewQuery>,
) -> Response {
    let visitor = visitor_address(&headers, peer.map(|ConnectInfo(addr)| addr)).unwrap_or_default();
    let page_id = query.page_id.unwrap_or(0);
    let resolver = rt.resolver.clone();
    let now = rt.clock.now();
    let outcome = rt
        .bounded("page_view", move || {
            resolver.page_view(&visitor, query.checkview_test_id.as_deref(), page_id, now)
        })
        .await
        .and_then(|r| r);

    match outcome {
        Ok(view) => {
            if !view.cookies.is_empty() {
                info!(page_id, "test session opened");
            }
            context_response(view.context, &view.cookies)
        }
        Err(err) => {
            error!(error = %err, "page view session lookup failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, CLIENT_DENIAL_MESSAGE)
        }
    }
}

async fn submission(
    State(rt): State<AdapterRuntime>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let visitor = visitor_address(&headers, peer.map(|ConnectInfo(addr)| addr)).unwrap_or_default();
    let carried = cookie_value(&headers, TEST_ID_PARAM).map(str::to_string);
    let referrer = header_str(&headers, header::REFERER.as_str()).map(str::to_string);
    let resolver = rt.resolver.clone();
    let now = rt.clock.now();
    let outcome = rt
        .bounded("submission_context", move || {
            resolver.submission_context(&visitor, carried.as_deref(), referrer.as_deref(), now)
        })
        .await
        .and_then(|r| r);

    match outcome {
        Ok(context) => context_response(context, &[]),
        Err(err) => {
            error!(error = %err, "submission session lookup failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, CLIENT_DENIAL_MESSAGE)
        }
    }
}
