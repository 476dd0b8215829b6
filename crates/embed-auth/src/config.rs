use serde::Deserialize;
use url::Url;

use crate::error::AuthError;

const DEFAULT_EMBED_HOST: &str = "self-signed.looker.com:9999";
const DEFAULT_API_URL: &str = "https://self-signed.looker.com:19999";

/// Server-side settings for signing embed urls and managing cookieless
/// sessions, read from `LOOKER_*` environment variables.
#[derive(Debug, Clone)]
pub struct AuthServerConfig {
    /// Embed host, `hostname[:port]`.
    pub host: String,
    pub secret: String,
    pub api_url: Url,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub verify_ssl: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    embed_host: Option<String>,
    #[serde(default)]
    embed_secret: Option<String>,
    #[serde(default)]
    embed_api_url: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    verify_ssl: Option<String>,
}

impl AuthServerConfig {
    pub fn from_env() -> Result<Self, AuthError> {
        let raw: RawConfig = config::Config::builder()
            .add_source(config::Environment::with_prefix("LOOKER"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|err| AuthError::Config(format!("failed to read LOOKER_* settings: {err}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, AuthError> {
        let secret = normalize_opt(raw.embed_secret)
            .ok_or_else(|| AuthError::Config("LOOKER_EMBED_SECRET is required".into()))?;
        let api_url = normalize_opt(raw.embed_api_url).unwrap_or_else(|| DEFAULT_API_URL.into());
        let api_url = Url::parse(&api_url)
            .map_err(|err| AuthError::Config(format!("invalid LOOKER_EMBED_API_URL: {err}")))?;

        Ok(Self {
            host: normalize_opt(raw.embed_host).unwrap_or_else(|| DEFAULT_EMBED_HOST.into()),
            secret,
            api_url,
            client_id: normalize_opt(raw.client_id),
            client_secret: normalize_opt(raw.client_secret),
            verify_ssl: normalize_opt(raw.verify_ssl)
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// API credentials, required for cookieless sessions.
    pub fn api_credentials(&self) -> Result<(&str, &str), AuthError> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => Err(AuthError::Config(
                "LOOKER_CLIENT_ID and LOOKER_CLIENT_SECRET are required".into(),
            )),
        }
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
