//! Execution adapter: translates a logical request plus its option set into
//! one engine call and normalizes the result. Both transports go through
//! this path, so REST and WebSocket requests behave identically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::warn;

use crate::engine::{EngineRequest, EngineResponse, EngineSession};
use crate::error::{GatewayError, Result};
use crate::protocol::{CookieOut, ExecRequest, ExecResponse, HeaderValues, RequestOptions, SameSite};
use crate::session::SessionRegistry;

pub struct Executor {
    sessions: Arc<SessionRegistry>,
}

impl Executor {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }

    /// Executes a request against an existing session. Validation failures
    /// surface as typed errors; engine-level failures land in the response's
    /// `error` field so the façade can report them as data.
    pub async fn execute(&self, session_id: &str, request: &ExecRequest) -> Result<ExecResponse> {
        let session = self.sessions.get(session_id).await?;
        self.execute_with(session.as_ref(), request).await
    }

    /// Executes a request in a throwaway session. The session is deleted
    /// afterwards whether or not execution succeeded; a failure to create it
    /// in the first place is reported as its own error and execution is
    /// never attempted.
    pub async fn execute_stateless(&self, request: &ExecRequest) -> Result<ExecResponse> {
        let (id, session) = self.sessions.create(None, None).await.map_err(|e| {
            GatewayError::execution(format!("failed to create temporary session: {e}"))
        })?;

        let result = self.execute_with(session.as_ref(), request).await;

        if let Err(e) = self.sessions.delete(&id).await {
            warn!("failed to delete temporary session {id}: {e}");
        }

        result
    }

    async fn execute_with(
        &self,
        session: &dyn EngineSession,
        request: &ExecRequest,
    ) -> Result<ExecResponse> {
        let engine_request = build_engine_request(request)?;

        if let Err(e) = apply_session_overrides(session, &request.options).await {
            return Ok(ExecResponse::failed(
                &request.id,
                format!("failed to apply request options: {e}"),
            ));
        }

        match session.execute(engine_request).await {
            Ok(response) => Ok(normalize(&request.id, response)),
            Err(e) => Ok(ExecResponse::failed(&request.id, e.to_string())),
        }
    }
}

/// Options that mutate the session rather than the single request: a proxy
/// override is applied only when it differs from the session's current
/// proxy, and likewise for the browser profile.
async fn apply_session_overrides(
    session: &dyn EngineSession,
    options: &RequestOptions,
) -> std::result::Result<(), crate::engine::EngineError> {
    if !options.proxy.is_empty() && session.proxy().as_deref() != Some(options.proxy.as_str()) {
        session.set_proxy(&options.proxy).await?;
    }
    if !options.browser.is_empty()
        && session.browser().as_deref() != Some(options.browser.as_str())
    {
        session.set_browser(&options.browser);
    }
    Ok(())
}

fn build_engine_request(request: &ExecRequest) -> Result<EngineRequest> {
    if request.body.is_some() && request.body_b64.is_some() {
        return Err(GatewayError::invalid_input(
            "`body` and `body_b64` are mutually exclusive",
        ));
    }
    if request.headers.is_some() && request.ordered_headers.is_some() {
        return Err(GatewayError::invalid_input(
            "`headers` and `ordered_headers` are mutually exclusive",
        ));
    }

    let body = if let Some(encoded) = &request.body_b64 {
        STANDARD
            .decode(encoded)
            .map_err(|e| GatewayError::invalid_input(format!("invalid base64 body: {e}")))?
    } else {
        request.body.clone().unwrap_or_default().into_bytes()
    };

    let headers = if let Some(ordered) = &request.ordered_headers {
        flatten_ordered_headers(ordered)
    } else if let Some(map) = &request.headers {
        let mut flat = Vec::new();
        for (name, values) in map {
            match values {
                HeaderValues::One(value) => flat.push((name.clone(), value.clone())),
                HeaderValues::Many(values) => {
                    flat.extend(values.iter().map(|v| (name.clone(), v.clone())));
                }
            }
        }
        flat
    } else {
        Vec::new()
    };

    let options = &request.options;
    Ok(EngineRequest {
        method: request.method.clone(),
        url: request.url.clone(),
        headers,
        body,
        timeout: (options.timeout_ms > 0).then(|| Duration::from_millis(options.timeout_ms)),
        force_http1: options.force_http1,
        force_http3: options.force_http3,
        insecure_skip_verify: options.insecure_skip_verify,
        no_cookie: options.no_cookie,
        ignore_body: options.ignore_body,
        disable_redirects: options.disable_redirects,
        max_redirects: (options.max_redirects > 0).then_some(options.max_redirects),
    })
}

/// Flattens `[[name, value, value, ...], ...]` entries into name/value
/// pairs, preserving order. Entries without a name are dropped.
pub(crate) fn flatten_ordered_headers(entries: &[Vec<String>]) -> Vec<(String, String)> {
    let mut flat = Vec::new();
    for entry in entries {
        match entry.split_first() {
            None => {}
            Some((name, [])) => flat.push((name.clone(), String::new())),
            Some((name, values)) => {
                flat.extend(values.iter().map(|v| (name.clone(), v.clone())));
            }
        }
    }
    flat
}

fn normalize(id: &str, response: EngineResponse) -> ExecResponse {
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in response.headers {
        headers.entry(name).or_default().push(value);
    }

    let mut out = ExecResponse {
        id: id.to_string(),
        status_code: response.status,
        status: response.status_line,
        headers,
        url: response.url,
        ..Default::default()
    };

    if !response.body.is_empty() {
        let content_type = out
            .headers
            .get("content-type")
            .and_then(|values| values.first())
            .map(String::as_str);
        if is_binary_content(content_type, &response.body) {
            out.body_b64 = Some(STANDARD.encode(&response.body));
        } else {
            out.body = String::from_utf8_lossy(&response.body).into_owned();
        }
    }

    out.cookies = response
        .cookies
        .into_iter()
        .map(|cookie| CookieOut {
            name: cookie.name,
            value: cookie.value,
            domain: cookie.domain,
            path: cookie.path,
            expires: cookie.expires,
            secure: cookie.secure,
            http_only: cookie.http_only,
            same_site: SameSite::from_code(cookie.same_site),
        })
        .collect();

    out
}

/// Decides whether a response body is binary: the declared content type
/// wins when it is conclusive, otherwise the bytes are inspected.
fn is_binary_content(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(content_type) = content_type {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        if essence.starts_with("text/")
            || essence.ends_with("+json")
            || essence.ends_with("+xml")
            || matches!(
                essence.as_str(),
                "application/json"
                    | "application/xml"
                    | "application/javascript"
                    | "application/ecmascript"
                    | "application/x-www-form-urlencoded"
            )
        {
            return false;
        }

        if essence.starts_with("image/")
            || essence.starts_with("audio/")
            || essence.starts_with("video/")
            || essence.starts_with("font/")
            || matches!(
                essence.as_str(),
                "application/octet-stream"
                    | "application/pdf"
                    | "application/zip"
                    | "application/gzip"
            )
        {
            return true;
        }
    }

    body.contains(&0) || std::str::from_utf8(body).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::engine::EngineCookie;
    use crate::protocol::SessionConfig;

    fn executor() -> (Arc<FakeEngine>, Arc<SessionRegistry>, Executor) {
        let engine = FakeEngine::new();
        let sessions = Arc::new(SessionRegistry::new(engine.clone()));
        let executor = Executor::new(sessions.clone());
        (engine, sessions, executor)
    }

    fn get_request(url: &str) -> ExecRequest {
        ExecRequest {
            id: "req-1".into(),
            method: "GET".into(),
            url: url.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn conflicting_bodies_are_rejected() {
        let (_, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();

        let mut request = get_request("https://example.com");
        request.body = Some("text".into());
        request.body_b64 = Some("dGV4dA==".into());

        let err = executor.execute(&id, &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn conflicting_header_shapes_are_rejected() {
        let (_, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();

        let mut request = get_request("https://example.com");
        request.headers = Some(HashMap::from([(
            "a".to_string(),
            HeaderValues::One("1".into()),
        )]));
        request.ordered_headers = Some(vec![vec!["a".into(), "1".into()]]);

        let err = executor.execute(&id, &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn invalid_base64_body_is_rejected() {
        let (_, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();

        let mut request = get_request("https://example.com");
        request.body_b64 = Some("!!not base64!!".into());

        let err = executor.execute(&id, &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_, _, executor) = executor();
        let err = executor
            .execute("ghost", &get_request("https://example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn engine_failure_is_carried_as_data() {
        let (engine, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();
        engine.fail_execute(true);

        let response = executor
            .execute(&id, &get_request("https://example.com"))
            .await
            .unwrap();
        assert_eq!(response.id, "req-1");
        assert_eq!(response.error, "engine exploded");
        assert_eq!(response.status_code, 0);
    }

    #[tokio::test]
    async fn options_reach_the_engine() {
        let (engine, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();

        let mut request = get_request("https://example.com");
        request.options = RequestOptions {
            timeout_ms: 1_500,
            disable_redirects: true,
            max_redirects: 4,
            no_cookie: true,
            force_http1: true,
            insecure_skip_verify: true,
            ignore_body: true,
            ..Default::default()
        };
        executor.execute(&id, &request).await.unwrap();

        let session = engine.session(0);
        let executed = session.executed.lock();
        let sent = &executed[0];
        assert_eq!(sent.timeout, Some(Duration::from_millis(1_500)));
        assert!(sent.disable_redirects);
        assert_eq!(sent.max_redirects, Some(4));
        assert!(sent.no_cookie);
        assert!(sent.force_http1);
        assert!(sent.insecure_skip_verify);
        assert!(sent.ignore_body);
    }

    #[tokio::test]
    async fn header_shapes_flatten_into_pairs() {
        let (engine, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();

        let mut request = get_request("https://example.com");
        request.ordered_headers = Some(vec![
            vec!["user-agent".into(), "mirage".into()],
            vec!["accept".into(), "text/html".into(), "text/plain".into()],
            vec![],
        ]);
        executor.execute(&id, &request).await.unwrap();

        let session = engine.session(0);
        let executed = session.executed.lock();
        assert_eq!(
            executed[0].headers,
            vec![
                ("user-agent".to_string(), "mirage".to_string()),
                ("accept".to_string(), "text/html".to_string()),
                ("accept".to_string(), "text/plain".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn proxy_override_applies_only_when_different() {
        let (engine, sessions, executor) = executor();
        let config = SessionConfig {
            proxy: "http://proxy-a:3128".into(),
            ..Default::default()
        };
        let (id, _) = sessions.create(None, Some(&config)).await.unwrap();

        // Same proxy as the session: no second engine call.
        let mut request = get_request("https://example.com");
        request.options.proxy = "http://proxy-a:3128".into();
        executor.execute(&id, &request).await.unwrap();
        assert_eq!(
            engine.session(0).calls(),
            vec!["set_proxy:http://proxy-a:3128"]
        );

        // Different proxy: applied to the session.
        request.options.proxy = "http://proxy-b:3128".into();
        executor.execute(&id, &request).await.unwrap();
        assert_eq!(
            engine.session(0).calls(),
            vec![
                "set_proxy:http://proxy-a:3128",
                "set_proxy:http://proxy-b:3128"
            ]
        );
    }

    #[tokio::test]
    async fn binary_bodies_come_back_base64_flagged() {
        let (engine, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();
        engine.push_response(crate::engine::EngineResponse {
            status: 200,
            status_line: "200 OK".into(),
            headers: vec![("content-type".into(), "application/octet-stream".into())],
            body: vec![0x00, 0xFF, 0x10, 0x80],
            url: "https://example.com/blob".into(),
            ..Default::default()
        });

        let response = executor
            .execute(&id, &get_request("https://example.com/blob"))
            .await
            .unwrap();
        assert!(response.body.is_empty());
        assert_eq!(
            response.body_b64.as_deref(),
            Some(STANDARD.encode([0x00u8, 0xFF, 0x10, 0x80]).as_str())
        );
    }

    #[tokio::test]
    async fn text_bodies_stay_text() {
        let (engine, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();
        engine.push_response(crate::engine::EngineResponse {
            status: 200,
            status_line: "200 OK".into(),
            headers: vec![("content-type".into(), "text/html; charset=utf-8".into())],
            body: b"<html></html>".to_vec(),
            url: "https://example.com/".into(),
            ..Default::default()
        });

        let response = executor
            .execute(&id, &get_request("https://example.com"))
            .await
            .unwrap();
        assert_eq!(response.body, "<html></html>");
        assert!(response.body_b64.is_none());
        assert_eq!(response.status, "200 OK");
    }

    #[tokio::test]
    async fn cookies_are_normalized_for_every_same_site_code() {
        let (engine, sessions, executor) = executor();
        let (id, _) = sessions.create(None, None).await.unwrap();

        let cookie = |code: i32| EngineCookie {
            name: format!("c{code}"),
            value: "v".into(),
            same_site: code,
            ..Default::default()
        };
        engine.push_response(crate::engine::EngineResponse {
            status: 200,
            status_line: "200 OK".into(),
            cookies: (-1..=5).map(cookie).collect(),
            url: "https://example.com/".into(),
            ..Default::default()
        });

        let response = executor
            .execute(&id, &get_request("https://example.com"))
            .await
            .unwrap();
        let by_name: HashMap<_, _> = response
            .cookies
            .iter()
            .map(|c| (c.name.as_str(), c.same_site))
            .collect();
        assert_eq!(by_name["c1"], Some(SameSite::Default));
        assert_eq!(by_name["c2"], Some(SameSite::Lax));
        assert_eq!(by_name["c3"], Some(SameSite::Strict));
        assert_eq!(by_name["c4"], Some(SameSite::None));
        assert_eq!(by_name["c-1"], Option::None);
        assert_eq!(by_name["c0"], Option::None);
        assert_eq!(by_name["c5"], Option::None);
    }

    #[tokio::test]
    async fn stateless_requests_leave_no_sessions_behind() {
        let (engine, sessions, executor) = executor();

        let response = executor
            .execute_stateless(&get_request("https://example.com"))
            .await
            .unwrap();
        assert!(response.error.is_empty());
        assert_eq!(sessions.count().await, 0);

        engine.fail_execute(true);
        let response = executor
            .execute_stateless(&get_request("https://example.com"))
            .await
            .unwrap();
        assert!(!response.error.is_empty());
        assert_eq!(sessions.count().await, 0);
    }

    #[tokio::test]
    async fn stateless_reports_session_creation_failure_distinctly() {
        let (engine, _, executor) = executor();
        engine
            .fail_open
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = executor
            .execute_stateless(&get_request("https://example.com"))
            .await
            .unwrap_err();
        match err {
            GatewayError::Execution(message) => {
                assert!(message.contains("temporary session"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn binary_sniffing_falls_back_to_bytes() {
        assert!(!is_binary_content(Some("text/plain"), b"hello"));
        assert!(!is_binary_content(Some("application/json"), b"{}"));
        assert!(!is_binary_content(
            Some("application/hal+json; charset=utf-8"),
            b"{}"
        ));
        assert!(is_binary_content(Some("image/png"), b"\x89PNG"));
        assert!(is_binary_content(Some("application/pdf"), b"%PDF"));
        // No content type: decide from the bytes.
        assert!(is_binary_content(None, &[0x00, 0x01]));
        assert!(is_binary_content(None, &[0xFF, 0xFE, 0x00]));
        assert!(!is_binary_content(None, "plain text".as_bytes()));
    }
}
