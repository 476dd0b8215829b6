//! Cookieless token lifecycle.
//!
//! Every frame sharing a cookieless session periodically asks the host for
//! fresh tokens (`session:tokens:request`). The host answers from the bundle
//! cached in the [`SessionRegistry`], regenerating it through a single shared
//! request once its refresh time has passed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    config::{AcquireSource, GenerateSource, RequestSpec},
    error::EmbedError,
    http::{HttpMethod, HttpRequest, HttpTransport},
    session::{RefreshLock, SessionRegistry},
};

pub(crate) const PREPARE_FAILED: &str = "failed to prepare cookieless embed session";
pub const EXPIRED_PLACEHOLDER_TOKEN: &str = "session expired";
pub const EXPIRED_PLACEHOLDER_TTL: u64 = 240;
/// Status the generate endpoint answers with once the session has ended.
const SESSION_TERMINATED_STATUS: u16 = 400;

/// Body returned by the acquire and generate endpoints (or callbacks).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookielessSessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_token_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_token_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_reference_token_ttl: Option<u64>,
}

/// Token set exchanged with the embedded content. Absent fields are omitted
/// from the wire payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_token_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_reference_token_ttl: Option<u64>,
}

impl SessionTokens {
    pub fn expired_placeholder() -> Self {
        Self {
            api_token: Some(EXPIRED_PLACEHOLDER_TOKEN.to_string()),
            api_token_ttl: Some(EXPIRED_PLACEHOLDER_TTL),
            navigation_token: Some(EXPIRED_PLACEHOLDER_TOKEN.to_string()),
            navigation_token_ttl: Some(EXPIRED_PLACEHOLDER_TTL),
            session_reference_token_ttl: Some(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Cached cookieless state shared by every frame of one SDK instance.
///
/// `session_reference_token_ttl` of `None` marks the bundle invalid, `Some(0)`
/// marks the session terminated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookielessTokenBundle {
    pub api_token: Option<String>,
    pub api_token_ttl: Option<u64>,
    pub navigation_token: Option<String>,
    pub navigation_token_ttl: Option<u64>,
    pub session_reference_token_ttl: Option<u64>,
    pub next_refresh_at_ms: u64,
}

impl CookielessTokenBundle {
    pub fn tokens(&self) -> SessionTokens {
        SessionTokens {
            api_token: self.api_token.clone(),
            api_token_ttl: self.api_token_ttl,
            navigation_token: self.navigation_token.clone(),
            navigation_token_ttl: self.navigation_token_ttl,
            session_reference_token_ttl: self.session_reference_token_ttl,
        }
    }

    /// Shortest remaining lifetime across the three tokens, in seconds.
    pub fn min_ttl(&self) -> u64 {
        [
            self.session_reference_token_ttl,
            self.api_token_ttl,
            self.navigation_token_ttl,
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(0)
    }

    pub(crate) fn apply(&mut self, data: CookielessSessionData) {
        self.api_token = data.api_token;
        self.api_token_ttl = data.api_token_ttl;
        self.navigation_token = data.navigation_token;
        self.navigation_token_ttl = data.navigation_token_ttl;
        self.session_reference_token_ttl = data.session_reference_token_ttl;
    }

    fn from_data(data: &CookielessSessionData) -> Self {
        Self {
            api_token: data.api_token.clone(),
            api_token_ttl: data.api_token_ttl,
            navigation_token: data.navigation_token.clone(),
            navigation_token_ttl: data.navigation_token_ttl,
            session_reference_token_ttl: data.session_reference_token_ttl,
            next_refresh_at_ms: 0,
        }
    }
}

/// When the bundle should next be regenerated, leaving a two minute margin
/// before the shortest lived token expires.
pub fn next_refresh_at(now_ms: u64, ttl_secs: u64) -> u64 {
    if ttl_secs < 60 {
        now_ms
    } else if ttl_secs < 120 {
        now_ms + 60_000
    } else {
        now_ms + (ttl_secs - 120) * 1_000
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RefreshOutcome {
    Renewed(CookielessSessionData),
    Terminated,
    Invalid,
}

pub(crate) fn classify_generated(
    result: Result<CookielessSessionData, EmbedError>,
) -> RefreshOutcome {
    match result {
        Ok(data) if data.session_reference_token_ttl == Some(0) => RefreshOutcome::Terminated,
        Ok(data) if is_well_formed(&data) => RefreshOutcome::Renewed(data),
        Ok(_) => {
            warn!(
                target = "embed.tokens",
                "generate returned incomplete tokens"
            );
            RefreshOutcome::Invalid
        }
        Err(err) => {
            warn!(target = "embed.tokens", error = %err, "token generation failed");
            RefreshOutcome::Invalid
        }
    }
}

fn is_well_formed(data: &CookielessSessionData) -> bool {
    data.api_token.is_some()
        && data.api_token_ttl.unwrap_or(0) > 0
        && data.navigation_token.is_some()
        && data.navigation_token_ttl.unwrap_or(0) > 0
        && data.session_reference_token_ttl.is_some()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AcquiredSession {
    pub authentication_token: String,
    pub navigation_token: String,
    pub bundle: CookielessTokenBundle,
}

pub(crate) fn validate_acquired(
    data: CookielessSessionData,
) -> Result<AcquiredSession, EmbedError> {
    let complete = data.navigation_token_ttl.is_some()
        && data.api_token.is_some()
        && data.api_token_ttl.is_some()
        && data.session_reference_token_ttl.is_some();
    match (&data.authentication_token, &data.navigation_token) {
        (Some(authentication_token), Some(navigation_token)) if complete => Ok(AcquiredSession {
            authentication_token: authentication_token.clone(),
            navigation_token: navigation_token.clone(),
            bundle: CookielessTokenBundle::from_data(&data),
        }),
        _ => Err(EmbedError::ProtocolData(PREPARE_FAILED.to_string())),
    }
}

/// Calls the host application's acquire/generate endpoints or callbacks.
#[derive(Clone)]
pub(crate) struct CookielessFetcher {
    http: Arc<dyn HttpTransport>,
}

impl CookielessFetcher {
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self { http }
    }

    pub async fn acquire(
        &self,
        source: &AcquireSource,
    ) -> Result<CookielessSessionData, EmbedError> {
        match source {
            AcquireSource::Callback(callback) => callback
                .acquire_session()
                .await
                .map_err(|err| EmbedError::transport(PREPARE_FAILED, err.to_string())),
            AcquireSource::Endpoint(spec) => {
                let request = build_request(spec, HttpMethod::Get, Vec::new(), None);
                let response = self
                    .http
                    .execute(request)
                    .await
                    .map_err(|err| EmbedError::transport(PREPARE_FAILED, err.to_string()))?;
                if !response.is_success() {
                    return Err(EmbedError::transport(
                        PREPARE_FAILED,
                        format!(
                            "acquire returned {} {}",
                            response.status, response.status_text
                        ),
                    ));
                }
                response
                    .json()
                    .map_err(|_| EmbedError::ProtocolData(PREPARE_FAILED.to_string()))
            }
        }
    }

    pub async fn generate(
        &self,
        source: &GenerateSource,
        current: SessionTokens,
    ) -> Result<CookielessSessionData, EmbedError> {
        match source {
            GenerateSource::Callback(callback) => callback.generate_tokens(current).await,
            GenerateSource::Endpoint(spec) => {
                let body = json!({
                    "api_token": current.api_token,
                    "navigation_token": current.navigation_token,
                })
                .to_string();
                let defaults = vec![("content-type".to_string(), "application/json".to_string())];
                let request = build_request(spec, HttpMethod::Put, defaults, Some(body));
                let response = self.http.execute(request).await?;
                if response.status == SESSION_TERMINATED_STATUS {
                    debug!(
                        target = "embed.tokens",
                        "generate reported a terminated session"
                    );
                    return Ok(CookielessSessionData {
                        session_reference_token_ttl: Some(0),
                        ..Default::default()
                    });
                }
                if !response.is_success() {
                    return Err(EmbedError::transport(
                        "failed to generate tokens",
                        format!("{} {}", response.status, response.status_text),
                    ));
                }
                response.json()
            }
        }
    }
}

/// Caller supplied method and headers take precedence over the defaults.
fn build_request(
    spec: &RequestSpec,
    default_method: HttpMethod,
    default_headers: Vec<(String, String)>,
    body: Option<String>,
) -> HttpRequest {
    let mut headers: Vec<(String, String)> = default_headers
        .into_iter()
        .filter(|(name, _)| {
            !spec
                .headers
                .iter()
                .any(|(custom, _)| custom.eq_ignore_ascii_case(name))
        })
        .collect();
    headers.extend(spec.headers.iter().cloned());
    HttpRequest {
        method: spec.method.unwrap_or(default_method),
        url: spec.url.clone(),
        headers,
        body,
        with_credentials: spec.with_credentials,
    }
}

/// Per-frame flags consulted when answering token requests.
#[derive(Debug, Default)]
pub(crate) struct FrameTokenState {
    initialized: AtomicBool,
    expired: AtomicBool,
}

impl FrameTokenState {
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn mark_expired(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub(crate) struct TokenLifecycle {
    registry: Arc<SessionRegistry>,
    fetcher: CookielessFetcher,
}

impl TokenLifecycle {
    pub fn new(registry: Arc<SessionRegistry>, fetcher: CookielessFetcher) -> Self {
        Self { registry, fetcher }
    }

    /// Produces the `session:tokens` reply for one frame.
    pub async fn respond(&self, frame: &FrameTokenState) -> SessionTokens {
        if !frame.is_expired() {
            if frame.initialized.load(Ordering::SeqCst) {
                self.refresh_if_due().await;
            } else {
                // First request consumes the bundle produced at acquisition.
                let usable = self
                    .registry
                    .token_bundle()
                    .and_then(|bundle| bundle.session_reference_token_ttl)
                    .map(|ttl| ttl > 0)
                    .unwrap_or(false);
                frame.initialized.store(usable, Ordering::SeqCst);
            }
        }

        let Some(bundle) = self.registry.token_bundle() else {
            return SessionTokens::default();
        };
        match bundle.session_reference_token_ttl {
            None => {
                debug!(target = "embed.tokens", "replying with empty tokens");
                SessionTokens::default()
            }
            Some(0) => {
                frame.mark_expired();
                SessionTokens::expired_placeholder()
            }
            Some(_) => bundle.tokens(),
        }
    }

    async fn refresh_if_due(&self) {
        let fetcher = self.fetcher.clone();
        let lock = self.registry.generate_tokens_lock(move |source, current| {
            async move { classify_generated(fetcher.generate(&source, current).await) }.boxed()
        });
        match lock {
            RefreshLock::Pending(done) => done.await,
            RefreshLock::NotDue => {}
            RefreshLock::Terminated => {
                debug!(
                    target = "embed.tokens",
                    "session terminated, not refreshing"
                );
            }
            RefreshLock::Unavailable => {
                debug!(target = "embed.tokens", "no cookieless session to refresh");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_schedule_windows() {
        let now = 1_000_000;
        assert_eq!(next_refresh_at(now, 45), now);
        assert_eq!(next_refresh_at(now, 60), now + 60_000);
        assert_eq!(next_refresh_at(now, 119), now + 60_000);
        assert_eq!(next_refresh_at(now, 120), now);
        assert_eq!(next_refresh_at(now, 150), now + 30_000);
        assert_eq!(next_refresh_at(now, 3_600), now + 3_480_000);
    }

    #[test]
    fn classification_of_generate_results() {
        let renewed = CookielessSessionData {
            api_token: Some("api".into()),
            api_token_ttl: Some(600),
            navigation_token: Some("nav".into()),
            navigation_token_ttl: Some(600),
            session_reference_token_ttl: Some(3_000),
            ..Default::default()
        };
        assert_eq!(
            classify_generated(Ok(renewed.clone())),
            RefreshOutcome::Renewed(renewed.clone())
        );

        let terminated = CookielessSessionData {
            session_reference_token_ttl: Some(0),
            ..Default::default()
        };
        assert_eq!(
            classify_generated(Ok(terminated)),
            RefreshOutcome::Terminated
        );

        let missing_nav = CookielessSessionData {
            navigation_token: None,
            ..renewed
        };
        assert_eq!(classify_generated(Ok(missing_nav)), RefreshOutcome::Invalid);
        assert_eq!(
            classify_generated(Err(EmbedError::transport("failed to generate tokens", "500"))),
            RefreshOutcome::Invalid
        );
    }

    #[test]
    fn acquired_session_requires_every_token() {
        let data = CookielessSessionData {
            authentication_token: Some("auth".into()),
            authentication_token_ttl: Some(30),
            api_token: Some("api".into()),
            api_token_ttl: Some(600),
            navigation_token: Some("nav".into()),
            navigation_token_ttl: Some(600),
            session_reference_token_ttl: Some(3_000),
        };
        let acquired = validate_acquired(data.clone()).expect("complete");
        assert_eq!(acquired.authentication_token, "auth");
        assert_eq!(acquired.navigation_token, "nav");
        assert_eq!(acquired.bundle.min_ttl(), 600);

        let err = validate_acquired(CookielessSessionData {
            api_token_ttl: None,
            ..data
        })
        .expect_err("incomplete");
        assert_eq!(err, EmbedError::ProtocolData(PREPARE_FAILED.into()));
    }

    #[test]
    fn placeholder_and_empty_payloads() {
        assert_eq!(SessionTokens::default().to_value(), json!({}));
        assert_eq!(
            SessionTokens::expired_placeholder().to_value(),
            json!({
                "api_token": "session expired",
                "api_token_ttl": 240,
                "navigation_token": "session expired",
                "navigation_token_ttl": 240,
                "session_reference_token_ttl": 0,
            })
        );
    }

    #[test]
    fn custom_headers_override_defaults() {
        let spec = RequestSpec::new("/generate-tokens")
            .method(HttpMethod::Post)
            .header("Content-Type", "application/vnd+json");
        let request = build_request(
            &spec,
            HttpMethod::Put,
            vec![("content-type".into(), "application/json".into())],
            Some("{}".into()),
        );
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("content-type"), Some("application/vnd+json"));
    }
}
