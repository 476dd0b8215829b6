use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::error::EmbedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Either absolute or relative to the host page's origin.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Browser credential mode (`include` when true). Transports without a
    /// cookie jar ignore it.
    pub with_credentials: bool,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            with_credentials: false,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, status_text: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, EmbedError> {
        serde_json::from_str(&self.body).map_err(|err| {
            EmbedError::ProtocolData(format!("invalid response body: {err}"))
        })
    }
}

/// Outbound HTTP used for signing, session acquisition and token generation.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, EmbedError>;
}

/// `reqwest` backed transport. Relative request URLs are resolved against
/// `base_url`, which is normally the host page's origin.
///
/// No cookie jar is kept, so `HttpRequest::with_credentials` has no effect
/// here.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: Client,
    base_url: Option<Url>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, EmbedError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| EmbedError::Configuration(format!("http client: {err}")))?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, EmbedError> {
        let parsed = Url::parse(base_url).map_err(|err| {
            EmbedError::Configuration(format!("invalid base url {base_url}: {err}"))
        })?;
        self.base_url = Some(parsed);
        Ok(self)
    }

    fn resolve(&self, target: &str) -> Result<Url, EmbedError> {
        if let Ok(absolute) = Url::parse(target) {
            return Ok(absolute);
        }
        let base = self.base_url.as_ref().ok_or_else(|| {
            EmbedError::Configuration(format!("relative endpoint {target} requires a base url"))
        })?;
        base.join(target).map_err(|err| {
            EmbedError::Configuration(format!("invalid endpoint {target}: {err}"))
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, EmbedError> {
        let url = self.resolve(&request.url)?;
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        };
        let mut builder = self.http.request(method, url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let res = builder.send().await?;
        let status = res.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let body = res.text().await.map_err(|err| {
            EmbedError::transport("failed to read response body", err.to_string())
        })?;
        debug!(
            target = "embed.http",
            method = request.method.as_str(),
            url = %url,
            status = status.as_u16(),
            "request completed"
        );
        Ok(HttpResponse {
            status: status.as_u16(),
            status_text,
            body,
        })
    }
}
