use std::{env, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use url::Url;

use crate::{
    error::EmbedError,
    http::HttpMethod,
    tokens::{CookielessSessionData, SessionTokens},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const SDK_PROTOCOL_VERSION: &str = "3";

/// Per SDK instance options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkOptions {
    /// Origin of the page hosting the frames. `None` means a sandboxed host
    /// without a usable origin.
    pub host_origin: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for SdkOptions {
    fn default() -> Self {
        Self {
            host_origin: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl SdkOptions {
    pub fn with_host_origin(origin: impl Into<String>) -> Self {
        Self {
            host_origin: Some(origin.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, EmbedError> {
        let host_origin = env::var("EMBED_HOST_ORIGIN").ok().and_then(normalize_opt);
        let connect_timeout = match env::var("EMBED_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(normalize_opt)
        {
            Some(raw) => {
                let millis: u64 = raw.parse().map_err(|err| {
                    EmbedError::Configuration(format!("invalid EMBED_CONNECT_TIMEOUT_MS: {err}"))
                })?;
                Duration::from_millis(millis)
            }
            None => DEFAULT_CONNECT_TIMEOUT,
        };
        Ok(Self {
            host_origin,
            connect_timeout,
        })
    }

    pub fn is_sandboxed(&self) -> bool {
        self.host_origin.is_none()
    }
}

fn normalize_opt(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Signing endpoint used by signed embeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub with_credentials: bool,
}

impl AuthConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_credentials(mut self, enabled: bool) -> Self {
        self.with_credentials = enabled;
        self
    }
}

/// An HTTP endpoint description for cookieless acquire/generate calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSpec {
    pub url: String,
    pub method: Option<HttpMethod>,
    pub headers: Vec<(String, String)>,
    pub with_credentials: bool,
}

impl RequestSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl From<&str> for RequestSpec {
    fn from(url: &str) -> Self {
        RequestSpec::new(url)
    }
}

#[async_trait]
pub trait AcquireSessionCallback: Send + Sync {
    async fn acquire_session(&self) -> Result<CookielessSessionData, EmbedError>;
}

#[async_trait]
pub trait GenerateTokensCallback: Send + Sync {
    async fn generate_tokens(
        &self,
        current: SessionTokens,
    ) -> Result<CookielessSessionData, EmbedError>;
}

#[derive(Clone)]
pub enum AcquireSource {
    Endpoint(RequestSpec),
    Callback(Arc<dyn AcquireSessionCallback>),
}

#[derive(Clone)]
pub enum GenerateSource {
    Endpoint(RequestSpec),
    Callback(Arc<dyn GenerateTokensCallback>),
}

impl PartialEq for AcquireSource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AcquireSource::Endpoint(a), AcquireSource::Endpoint(b)) => a == b,
            (AcquireSource::Callback(a), AcquireSource::Callback(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for GenerateSource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (GenerateSource::Endpoint(a), GenerateSource::Endpoint(b)) => a == b,
            (GenerateSource::Callback(a), GenerateSource::Callback(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for AcquireSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireSource::Endpoint(spec) => f.debug_tuple("Endpoint").field(spec).finish(),
            AcquireSource::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl fmt::Debug for GenerateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerateSource::Endpoint(spec) => f.debug_tuple("Endpoint").field(spec).finish(),
            GenerateSource::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<&str> for AcquireSource {
    fn from(url: &str) -> Self {
        AcquireSource::Endpoint(RequestSpec::new(url))
    }
}

impl From<&str> for GenerateSource {
    fn from(url: &str) -> Self {
        GenerateSource::Endpoint(RequestSpec::new(url))
    }
}

/// How frames authenticate.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AuthMode {
    #[default]
    None,
    Signed(AuthConfig),
    Cookieless {
        acquire: AcquireSource,
        generate: GenerateSource,
    },
}

impl AuthMode {
    pub fn is_cookieless(&self) -> bool {
        matches!(self, AuthMode::Cookieless { .. })
    }
}

/// Normalizes an api host to `hostname[:port]`, dropping default ports.
pub fn sanitize_host_url(host: &str) -> Result<String, EmbedError> {
    let trimmed = host.trim();
    let candidate = if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&candidate)
        .map_err(|err| EmbedError::Configuration(format!("invalid host url {host}: {err}")))?;
    let hostname = parsed
        .host_str()
        .ok_or_else(|| EmbedError::Configuration(format!("invalid host url {host}")))?;
    Ok(match parsed.port() {
        Some(port) if port != 443 && port != 80 => format!("{hostname}:{port}"),
        _ => hostname.to_string(),
    })
}

/// Reduces an absolute embed url to path, query and fragment and makes sure
/// the path lives under `/embed`.
pub fn sanitize_embed_url(url: &str) -> Result<String, EmbedError> {
    let mut sanitized = url.trim().to_string();
    if sanitized.starts_with("https://") || sanitized.starts_with("http://") {
        let parsed = Url::parse(&sanitized)
            .map_err(|err| EmbedError::Configuration(format!("invalid embed url {url}: {err}")))?;
        sanitized = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            sanitized.push('?');
            sanitized.push_str(query);
        }
        if let Some(fragment) = parsed.fragment() {
            sanitized.push('#');
            sanitized.push_str(fragment);
        }
    }
    if !sanitized.starts_with("/embed") {
        if !sanitized.starts_with('/') {
            sanitized.insert(0, '/');
        }
        sanitized.insert_str(0, "/embed");
    }
    Ok(sanitized)
}
