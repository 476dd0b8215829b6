//! Minimal API client for cookieless embed sessions.
//!
//! Logs in with API credentials, acquires a cookieless session for an embed
//! user and regenerates its tokens. One session is cached per browser user
//! agent.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use reqwest::{header, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::AuthServerConfig, error::AuthError, user::EmbedUser};

const INVALID_TOKENS: &str = "Invalid input tokens provided";
/// Re-login this long before the API token expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Full session as returned by the API, including the reference token that
/// never leaves the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CookielessSession {
    #[serde(default)]
    pub authentication_token: Option<String>,
    #[serde(default)]
    pub authentication_token_ttl: Option<u64>,
    #[serde(default)]
    pub navigation_token: Option<String>,
    #[serde(default)]
    pub navigation_token_ttl: Option<u64>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub api_token_ttl: Option<u64>,
    #[serde(default)]
    pub session_reference_token: Option<String>,
    #[serde(default)]
    pub session_reference_token_ttl: Option<u64>,
}

/// Token set handed to the browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbedTokens {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_token_ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_token_ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token_ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_reference_token_ttl: Option<u64>,
}

impl EmbedTokens {
    /// Reply for a session that can no longer be refreshed.
    pub fn terminated() -> Self {
        Self {
            session_reference_token_ttl: Some(0),
            ..Self::default()
        }
    }

    fn acquired(session: &CookielessSession) -> Self {
        Self {
            authentication_token: session.authentication_token.clone(),
            authentication_token_ttl: session.authentication_token_ttl,
            ..Self::generated(session)
        }
    }

    fn generated(session: &CookielessSession) -> Self {
        Self {
            authentication_token: None,
            authentication_token_ttl: None,
            navigation_token: session.navigation_token.clone(),
            navigation_token_ttl: session.navigation_token_ttl,
            api_token: session.api_token.clone(),
            api_token_ttl: session.api_token_ttl,
            session_reference_token_ttl: session.session_reference_token_ttl,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct ApiToken {
    access_token: String,
    expires_at: Instant,
}

impl ApiToken {
    fn is_active(&self, now: Instant) -> bool {
        now + TOKEN_EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Serialize)]
struct AcquireRequest<'a> {
    #[serde(flatten)]
    user: &'a EmbedUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_reference_token: Option<&'a str>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    api_token: &'a str,
    navigation_token: &'a str,
    session_reference_token: &'a str,
}

pub struct CookielessSessionClient {
    http: Client,
    api_url: Url,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<ApiToken>>,
    sessions: RwLock<HashMap<String, CookielessSession>>,
}

impl CookielessSessionClient {
    pub fn new(config: &AuthServerConfig) -> Result<Self, AuthError> {
        let (client_id, client_secret) = config.api_credentials()?;
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|err| AuthError::Config(err.to_string()))?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> Result<Url, AuthError> {
        self.api_url
            .join(path)
            .map_err(|err| AuthError::Config(format!("invalid api path '{path}': {err}")))
    }

    /// Current API token, logging in again when it is missing or about to
    /// expire.
    async fn access_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.is_active(Instant::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if token.is_active(Instant::now()) {
                return Ok(token.access_token.clone());
            }
        }
        let response = self
            .http
            .post(self.url("api/4.0/login")?)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        let login: LoginResponse = checked(response).await?.json().await?;
        info!(
            target = "embed.auth",
            expires_in = login.expires_in,
            "api login succeeded"
        );
        let token = ApiToken {
            access_token: login.access_token,
            expires_at: Instant::now() + Duration::from_secs(login.expires_in),
        };
        let access_token = token.access_token.clone();
        *guard = Some(token);
        Ok(access_token)
    }

    async fn authorized(
        &self,
        request: RequestBuilder,
        user_agent: &str,
    ) -> Result<RequestBuilder, AuthError> {
        let token = self.access_token().await?;
        Ok(request
            .header(header::AUTHORIZATION, format!("token {token}"))
            .header(header::USER_AGENT, user_agent))
    }

    /// Acquires a session for `user`, joining the one already cached for
    /// `user_agent`.
    pub async fn acquire(
        &self,
        user_agent: &str,
        user: &EmbedUser,
    ) -> Result<EmbedTokens, AuthError> {
        let reference = self
            .sessions
            .read()
            .await
            .get(user_agent)
            .and_then(|session| session.session_reference_token.clone());
        let body = AcquireRequest {
            user,
            session_reference_token: reference.as_deref(),
        };
        let request = self
            .http
            .post(self.url("api/4.0/embed/cookieless_session/acquire")?)
            .json(&body);
        let response = self.authorized(request, user_agent).await?.send().await?;
        let session: CookielessSession = checked(response).await?.json().await?;
        debug!(
            target = "embed.auth",
            joined = reference.is_some(),
            "cookieless session acquired"
        );

        let tokens = EmbedTokens::acquired(&session);
        self.sessions
            .write()
            .await
            .insert(user_agent.to_string(), session);
        Ok(tokens)
    }

    /// Regenerates the api and navigation tokens of the session cached for
    /// `user_agent`.
    pub async fn generate(&self, user_agent: &str) -> Result<EmbedTokens, AuthError> {
        let session = self
            .sessions
            .read()
            .await
            .get(user_agent)
            .cloned()
            .ok_or(AuthError::SessionNotAcquired)?;
        let Some(reference) = session.session_reference_token.as_deref() else {
            warn!(
                target = "embed.auth",
                "session has no reference token, treating as expired"
            );
            return Ok(EmbedTokens::terminated());
        };
        let body = GenerateRequest {
            api_token: session.api_token.as_deref().unwrap_or_default(),
            navigation_token: session.navigation_token.as_deref().unwrap_or_default(),
            session_reference_token: reference,
        };
        let request = self
            .http
            .put(self.url("api/4.0/embed/cookieless_session/generate_tokens")?)
            .json(&body);
        let response = self.authorized(request, user_agent).await?.send().await?;
        let renewed: CookielessSession = match checked(response).await {
            Ok(response) => response.json().await?,
            Err(AuthError::Gateway { body, .. }) if body.contains(INVALID_TOKENS) => {
                warn!(
                    target = "embed.auth",
                    "api rejected the session tokens, expiring session"
                );
                return Ok(EmbedTokens::terminated());
            }
            Err(err) => return Err(err),
        };

        let tokens = EmbedTokens::generated(&renewed);
        let merged = CookielessSession {
            session_reference_token: renewed
                .session_reference_token
                .clone()
                .or(session.session_reference_token),
            ..renewed
        };
        self.sessions
            .write()
            .await
            .insert(user_agent.to_string(), merged);
        Ok(tokens)
    }

    /// Forgets the session cached for `user_agent`.
    pub async fn forget(&self, user_agent: &str) {
        self.sessions.write().await.remove(user_agent);
    }
}

async fn checked(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthError::Gateway {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn config() -> AuthServerConfig {
        AuthServerConfig {
            host: "example.looker.com".into(),
            secret: "secret".into(),
            api_url: Url::parse("https://example.looker.com:19999").expect("url"),
            client_id: Some("id".into()),
            client_secret: Some("secret".into()),
            verify_ssl: true,
        }
    }

    #[test]
    fn requires_api_credentials() {
        let mut config = config();
        config.client_secret = None;
        assert!(matches!(
            CookielessSessionClient::new(&config),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn acquire_body_flattens_the_user() {
        let user = EmbedUser::new("user-1", 600).with_models(["thelook"]);
        let body = AcquireRequest {
            user: &user,
            session_reference_token: Some("ref"),
        };
        let value = serde_json::to_value(&body).expect("json");
        assert_eq!(value["external_user_id"], "user-1");
        assert_eq!(value["models"], json!(["thelook"]));
        assert_eq!(value["session_reference_token"], "ref");
        assert!(value.get("first_name").is_none());
    }

    #[test]
    fn browser_tokens_never_carry_the_reference_token() {
        let session = CookielessSession {
            authentication_token: Some("auth".into()),
            authentication_token_ttl: Some(30),
            navigation_token: Some("nav".into()),
            navigation_token_ttl: Some(600),
            api_token: Some("api".into()),
            api_token_ttl: Some(600),
            session_reference_token: Some("ref".into()),
            session_reference_token_ttl: Some(3_000),
        };
        let acquired = serde_json::to_value(EmbedTokens::acquired(&session)).expect("json");
        assert_eq!(acquired["authentication_token"], "auth");
        assert!(acquired.get("session_reference_token").is_none());

        let generated = serde_json::to_value(EmbedTokens::generated(&session)).expect("json");
        assert!(generated.get("authentication_token").is_none());
        assert_eq!(generated["session_reference_token_ttl"], 3_000);
        assert_eq!(
            serde_json::to_value(EmbedTokens::terminated()).expect("json"),
            json!({ "session_reference_token_ttl": 0 })
        );
    }

    #[test]
    fn api_token_expires_with_margin() {
        let now = Instant::now();
        let token = ApiToken {
            access_token: "t".into(),
            expires_at: now + Duration::from_secs(3_600),
        };
        assert!(token.is_active(now));
        assert!(!token.is_active(now + Duration::from_secs(3_550)));
    }

    #[tokio::test]
    async fn generate_requires_an_acquired_session() {
        let client = CookielessSessionClient::new(&config()).expect("client");
        let err = client.generate("agent").await.expect_err("no session");
        assert!(matches!(err, AuthError::SessionNotAcquired));
    }
}
