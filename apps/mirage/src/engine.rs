//! The execution-engine seam.
//!
//! Everything that actually puts bytes on the wire lives behind the
//! [`ExecutionEngine`] / [`EngineSession`] traits so the gateway can be
//! driven against a scripted engine in tests. The production engine wraps a
//! `reqwest` client per session: the cookie jar lives for the lifetime of
//! the session, and policy mutations (proxy, timeout, TLS verification,
//! default headers) rebuild the client around that same jar.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::{Client, Method, Proxy, Url, Version};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Endpoint used by `ip()`; the lookup goes through the session's own
/// client so proxies apply.
const IP_ECHO_URL: &str = "https://api.ipify.org";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("{0}")]
    Request(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),

    #[error("session is closed")]
    Closed,
}

/// One request as handed to the engine, headers already flattened into an
/// ordered name/value list.
#[derive(Debug, Clone, Default)]
pub struct EngineRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Option<Duration>,
    pub force_http1: bool,
    pub force_http3: bool,
    pub insecure_skip_verify: bool,
    pub no_cookie: bool,
    pub ignore_body: bool,
    pub disable_redirects: bool,
    pub max_redirects: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineResponse {
    pub status: u16,
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub cookies: Vec<EngineCookie>,
    pub url: String,
}

/// Cookie as reported by the engine. `same_site` is the engine's numeric
/// code: 0 unset, 1 default, 2 lax, 3 strict, 4 none. Values outside that
/// range are possible and must be tolerated by callers.
#[derive(Debug, Clone, Default)]
pub struct EngineCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: i32,
}

/// Factory for engine sessions. One engine serves the whole process.
pub trait ExecutionEngine: Send + Sync {
    fn open_session(&self) -> Result<Arc<dyn EngineSession>, EngineError>;
}

/// One engine-side session: cookie jar, connection pool, and transport
/// policy, alive until `close`.
#[async_trait]
pub trait EngineSession: Send + Sync {
    fn set_browser(&self, browser: &str);
    fn browser(&self) -> Option<String>;
    fn set_user_agent(&self, user_agent: &str);
    async fn set_proxy(&self, proxy: &str) -> Result<(), EngineError>;
    fn clear_proxy(&self);
    fn proxy(&self) -> Option<String>;
    fn set_timeout(&self, timeout: Duration);
    fn set_max_redirects(&self, max_redirects: u32);
    fn set_insecure_skip_verify(&self, skip: bool);
    fn set_default_headers(&self, headers: Vec<(String, String)>);

    async fn apply_ja3(&self, ja3: &str, navigator: &str) -> Result<(), EngineError>;
    async fn apply_http2(&self, fingerprint: &str) -> Result<(), EngineError>;
    async fn apply_http3(&self, fingerprint: &str) -> Result<(), EngineError>;
    async fn add_pins(&self, url: &str, pins: &[String]) -> Result<(), EngineError>;
    async fn clear_pins(&self, url: &str) -> Result<(), EngineError>;
    async fn ip(&self) -> Result<String, EngineError>;

    async fn execute(&self, request: EngineRequest) -> Result<EngineResponse, EngineError>;

    /// Releases pooled connections. Must be idempotent.
    async fn close(&self);
}

/// Production engine backed by `reqwest`.
pub struct HttpEngine;

impl HttpEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine for HttpEngine {
    fn open_session(&self) -> Result<Arc<dyn EngineSession>, EngineError> {
        Ok(Arc::new(HttpEngineSession::new()?))
    }
}

/// Session-level transport policy. Fingerprint directives are recorded so a
/// fingerprint-capable transport can pick them up; this client does not
/// alter its TLS stack per directive.
#[derive(Debug, Clone)]
struct SessionPolicy {
    browser: Option<String>,
    user_agent: Option<String>,
    proxy: Option<String>,
    timeout: Duration,
    max_redirects: u32,
    insecure_skip_verify: bool,
    default_headers: Vec<(String, String)>,
    ja3: Option<(String, String)>,
    http2_fingerprint: Option<String>,
    http3_fingerprint: Option<String>,
    pins: HashMap<String, Vec<String>>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            browser: None,
            user_agent: None,
            proxy: None,
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            insecure_skip_verify: false,
            default_headers: Vec::new(),
            ja3: None,
            http2_fingerprint: None,
            http3_fingerprint: None,
            pins: HashMap::new(),
        }
    }
}

pub struct HttpEngineSession {
    jar: Arc<Jar>,
    policy: Mutex<SessionPolicy>,
    client: Mutex<Client>,
    closed: AtomicBool,
}

impl HttpEngineSession {
    fn new() -> Result<Self, EngineError> {
        let jar = Arc::new(Jar::default());
        let policy = SessionPolicy::default();
        let client = build_client(&policy, Some(jar.clone()), &RequestShape::default())?;
        Ok(Self {
            jar,
            policy: Mutex::new(policy),
            client: Mutex::new(client),
            closed: AtomicBool::new(false),
        })
    }

    fn rebuild(&self, policy: &SessionPolicy) -> Result<(), EngineError> {
        let client = build_client(policy, Some(self.jar.clone()), &RequestShape::default())?;
        *self.client.lock() = client;
        Ok(())
    }
}

/// Per-request deviations from the session policy that `reqwest` can only
/// express at client level. A request with a non-default shape gets a
/// one-off client sharing the session jar.
#[derive(Debug, Clone, Default, PartialEq)]
struct RequestShape {
    no_cookie: bool,
    disable_redirects: bool,
    max_redirects: Option<u32>,
    insecure_skip_verify: bool,
}

impl RequestShape {
    fn of(request: &EngineRequest) -> Self {
        Self {
            no_cookie: request.no_cookie,
            disable_redirects: request.disable_redirects,
            max_redirects: request.max_redirects,
            insecure_skip_verify: request.insecure_skip_verify,
        }
    }
}

fn build_client(
    policy: &SessionPolicy,
    jar: Option<Arc<Jar>>,
    shape: &RequestShape,
) -> Result<Client, EngineError> {
    let mut builder = Client::builder();

    if let Some(jar) = jar {
        if !shape.no_cookie {
            builder = builder.cookie_provider(jar);
        }
    }
    if let Some(user_agent) = &policy.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    if !policy.default_headers.is_empty() {
        builder = builder.default_headers(header_map(&policy.default_headers));
    }
    builder = builder.timeout(policy.timeout);

    let redirect = if shape.disable_redirects {
        reqwest::redirect::Policy::none()
    } else {
        let limit = shape.max_redirects.unwrap_or(policy.max_redirects);
        reqwest::redirect::Policy::limited(limit as usize)
    };
    builder = builder.redirect(redirect);

    if let Some(proxy) = &policy.proxy {
        let proxy = Proxy::all(proxy).map_err(|e| EngineError::InvalidProxy(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    if policy.insecure_skip_verify || shape.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| EngineError::Client(e.to_string()))
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => warn!("skipping invalid default header {name:?}"),
        }
    }
    map
}

#[async_trait]
impl EngineSession for HttpEngineSession {
    fn set_browser(&self, browser: &str) {
        self.policy.lock().browser = Some(browser.to_string());
    }

    fn browser(&self) -> Option<String> {
        self.policy.lock().browser.clone()
    }

    fn set_user_agent(&self, user_agent: &str) {
        let policy = {
            let mut policy = self.policy.lock();
            policy.user_agent = Some(user_agent.to_string());
            policy.clone()
        };
        if let Err(e) = self.rebuild(&policy) {
            warn!("failed to apply user agent: {e}");
        }
    }

    async fn set_proxy(&self, proxy: &str) -> Result<(), EngineError> {
        Proxy::all(proxy).map_err(|e| EngineError::InvalidProxy(e.to_string()))?;
        let policy = {
            let mut policy = self.policy.lock();
            policy.proxy = Some(proxy.to_string());
            policy.clone()
        };
        self.rebuild(&policy)
    }

    fn clear_proxy(&self) {
        let policy = {
            let mut policy = self.policy.lock();
            policy.proxy = None;
            policy.clone()
        };
        if let Err(e) = self.rebuild(&policy) {
            warn!("failed to clear proxy: {e}");
        }
    }

    fn proxy(&self) -> Option<String> {
        self.policy.lock().proxy.clone()
    }

    fn set_timeout(&self, timeout: Duration) {
        let policy = {
            let mut policy = self.policy.lock();
            policy.timeout = timeout;
            policy.clone()
        };
        if let Err(e) = self.rebuild(&policy) {
            warn!("failed to apply timeout: {e}");
        }
    }

    fn set_max_redirects(&self, max_redirects: u32) {
        let policy = {
            let mut policy = self.policy.lock();
            policy.max_redirects = max_redirects;
            policy.clone()
        };
        if let Err(e) = self.rebuild(&policy) {
            warn!("failed to apply redirect limit: {e}");
        }
    }

    fn set_insecure_skip_verify(&self, skip: bool) {
        let policy = {
            let mut policy = self.policy.lock();
            policy.insecure_skip_verify = skip;
            policy.clone()
        };
        if let Err(e) = self.rebuild(&policy) {
            warn!("failed to apply TLS verification policy: {e}");
        }
    }

    fn set_default_headers(&self, headers: Vec<(String, String)>) {
        let policy = {
            let mut policy = self.policy.lock();
            policy.default_headers = headers;
            policy.clone()
        };
        if let Err(e) = self.rebuild(&policy) {
            warn!("failed to apply default headers: {e}");
        }
    }

    async fn apply_ja3(&self, ja3: &str, navigator: &str) -> Result<(), EngineError> {
        self.policy.lock().ja3 = Some((ja3.to_string(), navigator.to_string()));
        Ok(())
    }

    async fn apply_http2(&self, fingerprint: &str) -> Result<(), EngineError> {
        self.policy.lock().http2_fingerprint = Some(fingerprint.to_string());
        Ok(())
    }

    async fn apply_http3(&self, fingerprint: &str) -> Result<(), EngineError> {
        self.policy.lock().http3_fingerprint = Some(fingerprint.to_string());
        Ok(())
    }

    async fn add_pins(&self, url: &str, pins: &[String]) -> Result<(), EngineError> {
        let url = Url::parse(url).map_err(|e| EngineError::InvalidUrl(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::InvalidUrl("missing host".into()))?
            .to_string();
        self.policy
            .lock()
            .pins
            .entry(host)
            .or_default()
            .extend(pins.iter().cloned());
        Ok(())
    }

    async fn clear_pins(&self, url: &str) -> Result<(), EngineError> {
        let url = Url::parse(url).map_err(|e| EngineError::InvalidUrl(e.to_string()))?;
        if let Some(host) = url.host_str() {
            self.policy.lock().pins.remove(host);
        }
        Ok(())
    }

    async fn ip(&self) -> Result<String, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let client = self.client.lock().clone();
        let response = client
            .get(IP_ECHO_URL)
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;
        Ok(text.trim().to_string())
    }

    async fn execute(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        if request.force_http3 {
            return Err(EngineError::Unsupported("HTTP/3"));
        }

        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| EngineError::Request(format!("invalid method {:?}", request.method)))?;
        let url =
            Url::parse(&request.url).map_err(|e| EngineError::InvalidUrl(e.to_string()))?;

        let policy = self.policy.lock().clone();
        if policy.ja3.is_some()
            || policy.http2_fingerprint.is_some()
            || policy.http3_fingerprint.is_some()
            || !policy.pins.is_empty()
        {
            debug!("fingerprint/pin directives are recorded but not applied by this transport");
        }

        let shape = RequestShape::of(&request);
        let client = if shape == RequestShape::default() {
            self.client.lock().clone()
        } else {
            build_client(&policy, Some(self.jar.clone()), &shape)?
        };

        let mut builder = client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if request.force_http1 {
            builder = builder.version(Version::HTTP_11);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;

        let status = response.status();
        let status_line = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };
        let final_url = response.url().to_string();

        let mut headers = Vec::new();
        let mut cookies = Vec::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            if name == SET_COOKIE {
                if let Some(cookie) = parse_set_cookie(&value) {
                    cookies.push(cookie);
                }
            }
            headers.push((name.to_string(), value));
        }

        let body = if request.ignore_body {
            Vec::new()
        } else {
            response
                .bytes()
                .await
                .map_err(|e| EngineError::Request(e.to_string()))?
                .to_vec()
        };

        Ok(EngineResponse {
            status: status.as_u16(),
            status_line,
            headers,
            body,
            cookies,
            url: final_url,
        })
    }

    async fn close(&self) {
        // Dropping the client releases its pool; the flag makes further use
        // fail fast instead of resurrecting connections.
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Minimal `Set-Cookie` parser producing the numeric SameSite codes the
/// adapter layer expects: 0 unset, 1 default, 2 lax, 3 strict, 4 none.
fn parse_set_cookie(raw: &str) -> Option<EngineCookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = EngineCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        ..Default::default()
    };

    for attr in parts {
        let attr = attr.trim();
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
            None => (attr.to_ascii_lowercase(), ""),
        };
        match key.as_str() {
            "domain" => cookie.domain = val.trim_start_matches('.').to_string(),
            "path" => cookie.path = val.to_string(),
            "expires" => {
                if let Ok(when) = DateTime::parse_from_rfc2822(val) {
                    cookie.expires = Some(when.with_timezone(&Utc));
                }
            }
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "samesite" => {
                cookie.same_site = match val.to_ascii_lowercase().as_str() {
                    "lax" => 2,
                    "strict" => 3,
                    "none" => 4,
                    _ => 1,
                }
            }
            _ => {}
        }
    }

    Some(cookie)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_cookie() {
        let cookie = parse_set_cookie("sid=abc123; Path=/; HttpOnly").unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.path, "/");
        assert!(cookie.http_only);
        assert!(!cookie.secure);
        assert_eq!(cookie.same_site, 0);
    }

    #[test]
    fn parses_same_site_codes() {
        let lax = parse_set_cookie("a=1; SameSite=Lax").unwrap();
        assert_eq!(lax.same_site, 2);
        let strict = parse_set_cookie("a=1; SameSite=Strict").unwrap();
        assert_eq!(strict.same_site, 3);
        let none = parse_set_cookie("a=1; Secure; SameSite=None").unwrap();
        assert_eq!(none.same_site, 4);
        assert!(none.secure);
        let odd = parse_set_cookie("a=1; SameSite=Whatever").unwrap();
        assert_eq!(odd.same_site, 1);
    }

    #[test]
    fn parses_domain_and_expiry() {
        let cookie = parse_set_cookie(
            "token=x; Domain=.example.com; Expires=Wed, 21 Oct 2015 07:28:00 GMT",
        )
        .unwrap();
        assert_eq!(cookie.domain, "example.com");
        let expires = cookie.expires.unwrap();
        assert_eq!(expires.to_rfc3339(), "2015-10-21T07:28:00+00:00");
    }

    #[test]
    fn rejects_nameless_cookie() {
        assert!(parse_set_cookie("=oops; Path=/").is_none());
        assert!(parse_set_cookie("no-equals-sign").is_none());
    }

    #[test]
    fn request_shape_detects_overrides() {
        let plain = EngineRequest {
            method: "GET".into(),
            url: "https://example.com".into(),
            ..Default::default()
        };
        assert_eq!(RequestShape::of(&plain), RequestShape::default());

        let shaped = EngineRequest {
            no_cookie: true,
            ..plain
        };
        assert_ne!(RequestShape::of(&shaped), RequestShape::default());
    }
}
