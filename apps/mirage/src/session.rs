//! Session registry: the process-wide map from session ID to engine
//! session. One lock domain guards the map; it is never held across a slow
//! engine call except in `delete`, where the engine close must finish before
//! the ID becomes reusable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::{EngineSession, ExecutionEngine};
use crate::error::{GatewayError, Result};
use crate::executor::flatten_ordered_headers;
use crate::protocol::SessionConfig;

/// Generates a fresh 32-hex session identifier.
pub fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub struct SessionRegistry {
    engine: Arc<dyn ExecutionEngine>,
    sessions: RwLock<HashMap<String, Arc<dyn EngineSession>>>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a session, generating an ID when none is supplied. The config
    /// is applied to the engine session before it is published into the map,
    /// so no caller can observe a half-configured session. An explicit ID
    /// that is already registered is rejected, never replaced.
    pub async fn create(
        &self,
        id: Option<&str>,
        config: Option<&SessionConfig>,
    ) -> Result<(String, Arc<dyn EngineSession>)> {
        let requested = id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        if let Some(id) = &requested {
            if self.sessions.read().await.contains_key(id) {
                return Err(GatewayError::session_exists(id));
            }
        }

        let session = self
            .engine
            .open_session()
            .map_err(|e| GatewayError::execution(format!("failed to create session: {e}")))?;

        if let Some(config) = config {
            if let Err(e) = apply_config(session.as_ref(), config).await {
                session.close().await;
                return Err(e);
            }
        }

        let mut sessions = self.sessions.write().await;
        let id = match requested {
            // Re-check under the write lock: a racing create with the same
            // explicit ID must lose, not overwrite.
            Some(id) => {
                if sessions.contains_key(&id) {
                    drop(sessions);
                    session.close().await;
                    return Err(GatewayError::session_exists(&id));
                }
                id
            }
            None => loop {
                let candidate = generate_session_id();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        sessions.insert(id.clone(), session.clone());

        Ok((id, session))
    }

    pub async fn get(&self, id: &str) -> Result<Arc<dyn EngineSession>> {
        if id.is_empty() {
            return Err(GatewayError::NotFound("session ID required".into()));
        }
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::session_not_found(id))
    }

    /// Deletes a session. The engine close runs under the write lock, before
    /// the entry is removed: a concurrent `create` reusing the ID cannot
    /// race against leftover pooled resources.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::session_not_found(id))?;
        session.close().await;
        sessions.remove(id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Shutdown sweep: closes every session and empties the registry. Safe
    /// against concurrent `delete` calls; each session is closed at most
    /// once because removal and close happen under the same write lock.
    pub async fn cleanup_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.close().await;
        }
    }

    pub async fn apply_ja3(&self, id: &str, ja3: &str, navigator: &str) -> Result<()> {
        let navigator = if navigator.is_empty() {
            "chrome"
        } else {
            navigator
        };
        let session = self.get(id).await?;
        session.apply_ja3(ja3, navigator).await?;
        Ok(())
    }

    pub async fn apply_http2(&self, id: &str, fingerprint: &str) -> Result<()> {
        let session = self.get(id).await?;
        session.apply_http2(fingerprint).await?;
        Ok(())
    }

    pub async fn apply_http3(&self, id: &str, fingerprint: &str) -> Result<()> {
        let session = self.get(id).await?;
        session.apply_http3(fingerprint).await?;
        Ok(())
    }

    pub async fn set_proxy(&self, id: &str, proxy: &str) -> Result<()> {
        let session = self.get(id).await?;
        session.set_proxy(proxy).await?;
        Ok(())
    }

    pub async fn clear_proxy(&self, id: &str) -> Result<()> {
        let session = self.get(id).await?;
        session.clear_proxy();
        Ok(())
    }

    pub async fn add_pins(&self, id: &str, url: &str, pins: &[String]) -> Result<()> {
        Url::parse(url).map_err(|e| GatewayError::invalid_input(format!("invalid URL: {e}")))?;
        let session = self.get(id).await?;
        session.add_pins(url, pins).await?;
        Ok(())
    }

    pub async fn clear_pins(&self, id: &str, url: &str) -> Result<()> {
        Url::parse(url).map_err(|e| GatewayError::invalid_input(format!("invalid URL: {e}")))?;
        let session = self.get(id).await?;
        session.clear_pins(url).await?;
        Ok(())
    }

    pub async fn ip(&self, id: &str) -> Result<String> {
        let session = self.get(id).await?;
        Ok(session.ip().await?)
    }
}

async fn apply_config(session: &dyn EngineSession, config: &SessionConfig) -> Result<()> {
    if !config.browser.is_empty() {
        session.set_browser(&config.browser);
    }
    if !config.user_agent.is_empty() {
        session.set_user_agent(&config.user_agent);
    }
    if !config.proxy.is_empty() {
        session
            .set_proxy(&config.proxy)
            .await
            .map_err(|e| GatewayError::invalid_input(format!("failed to set proxy: {e}")))?;
    }
    if config.timeout_ms > 0 {
        session.set_timeout(Duration::from_millis(config.timeout_ms));
    }
    if config.max_redirects > 0 {
        session.set_max_redirects(config.max_redirects);
    }
    session.set_insecure_skip_verify(config.insecure_skip_verify);

    let mut headers = Vec::new();
    if let Some(ordered) = &config.ordered_headers {
        headers.extend(flatten_ordered_headers(ordered));
    }
    if let Some(map) = &config.headers {
        headers.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    if !headers.is_empty() {
        session.set_default_headers(headers);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::fake::FakeEngine;

    fn registry() -> (Arc<FakeEngine>, SessionRegistry) {
        let engine = FakeEngine::new();
        let registry = SessionRegistry::new(engine.clone());
        (engine, registry)
    }

    #[test]
    fn generated_ids_are_32_hex_and_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn create_then_get_preserves_config() {
        let (engine, registry) = registry();
        let config = SessionConfig {
            browser: "firefox".into(),
            user_agent: "mirage-test/1.0".into(),
            proxy: "http://127.0.0.1:9000".into(),
            timeout_ms: 5_000,
            max_redirects: 3,
            insecure_skip_verify: true,
            headers: Some(HashMap::from([(
                "x-team".to_string(),
                "blue".to_string(),
            )])),
            ..Default::default()
        };

        let (id, _) = registry.create(None, Some(&config)).await.unwrap();
        registry.get(&id).await.unwrap();

        let session = engine.session(0);
        assert_eq!(session.browser.lock().as_deref(), Some("firefox"));
        assert_eq!(session.user_agent.lock().as_deref(), Some("mirage-test/1.0"));
        assert_eq!(
            session.proxy.lock().as_deref(),
            Some("http://127.0.0.1:9000")
        );
        assert_eq!(*session.timeout.lock(), Some(Duration::from_millis(5_000)));
        assert_eq!(*session.max_redirects.lock(), Some(3));
        assert!(*session.insecure_skip_verify.lock());
        assert_eq!(
            *session.default_headers.lock(),
            vec![("x-team".to_string(), "blue".to_string())]
        );
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_and_original_untouched() {
        let (engine, registry) = registry();
        let (id, original) = registry.create(Some("abc123"), None).await.unwrap();
        assert_eq!(id, "abc123");

        let err = registry.create(Some("abc123"), None).await.err().unwrap();
        assert!(matches!(err, GatewayError::AlreadyExists(_)));

        // The original session survives and was never closed.
        let still_there = registry.get("abc123").await.unwrap();
        assert!(Arc::ptr_eq(&original, &still_there));
        assert_eq!(engine.session(0).close_count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn delete_unknown_leaves_registry_untouched() {
        let (_, registry) = registry();
        registry.create(Some("keep"), None).await.unwrap();

        let err = registry.delete("missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn delete_closes_engine_session_and_frees_the_id() {
        let (engine, registry) = registry();
        registry.create(Some("reuse-me"), None).await.unwrap();
        registry.delete("reuse-me").await.unwrap();
        assert_eq!(engine.session(0).close_count.load(Ordering::SeqCst), 1);

        // The ID is reusable once delete returns.
        registry.create(Some("reuse-me"), None).await.unwrap();
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_creates_yield_exactly_n_entries() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.create(None, None).await.unwrap().0
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(registry.count().await, 32);

        let mut listed = registry.list().await;
        listed.sort();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn cleanup_all_closes_every_session_once() {
        let (engine, registry) = registry();
        for _ in 0..3 {
            registry.create(None, None).await.unwrap();
        }
        registry.cleanup_all().await;
        assert_eq!(registry.count().await, 0);
        for i in 0..3 {
            assert_eq!(engine.session(i).close_count.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn failed_proxy_config_closes_the_orphan_session() {
        let (engine, registry) = registry();
        engine.fail_proxy.store(true, Ordering::SeqCst);

        let config = SessionConfig {
            proxy: "http://bad".into(),
            ..Default::default()
        };
        let err = registry.create(None, Some(&config)).await.err().unwrap();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
        assert_eq!(registry.count().await, 0);
        assert_eq!(engine.session(0).close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_with_empty_id_is_not_found() {
        let (_, registry) = registry();
        let err = registry.get("").await.err().unwrap();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn pass_through_operations_require_a_known_session() {
        let (_, registry) = registry();
        let err = registry.apply_ja3("ghost", "771,4-5", "").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        let err = registry.ip("ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn ja3_defaults_the_navigator() {
        let (engine, registry) = registry();
        let (id, _) = registry.create(None, None).await.unwrap();
        registry.apply_ja3(&id, "771,4-5", "").await.unwrap();
        assert_eq!(engine.session(0).calls(), vec!["apply_ja3:771,4-5:chrome"]);
    }

    #[tokio::test]
    async fn pins_validate_the_url_first() {
        let (_, registry) = registry();
        let (id, _) = registry.create(None, None).await.unwrap();
        let err = registry
            .add_pins(&id, "not a url", &["pin1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }
}
