//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use embed_sdk::{
    channel::memory::MemoryChannelProvider, EmbedError, EmbedSdk, HttpRequest, HttpResponse,
    HttpTransport, ManualClock, SdkOptions,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const API_HOST: &str = "myhost.com";
pub const ORIGIN: &str = "http://localhost";

/// Scripted transport answering by url prefix and recording every request.
#[derive(Default)]
pub struct FakeHttp {
    routes: Mutex<HashMap<String, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, prefix: &str, status: u16, body: Value) {
        let status_text = match status {
            200 => "OK",
            400 => "Bad Request",
            403 => "Forbidden",
            _ => "Internal Server Error",
        };
        self.routes.lock().insert(
            prefix.to_string(),
            HttpResponse::new(status, status_text, body.to_string()),
        );
    }

    pub fn with_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.url.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl HttpTransport for FakeHttp {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, EmbedError> {
        let url = request.url.clone();
        self.requests.lock().push(request);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let response = self
            .routes
            .lock()
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, response)| response.clone());
        Ok(response.unwrap_or_else(|| HttpResponse::new(404, "Not Found", "")))
    }
}

pub struct Fixture {
    pub sdk: EmbedSdk,
    pub provider: MemoryChannelProvider,
    pub http: Arc<FakeHttp>,
    pub clock: Arc<ManualClock>,
}

pub fn fixture(options: SdkOptions) -> Fixture {
    let provider = MemoryChannelProvider::new();
    let http = FakeHttp::new();
    let clock = Arc::new(ManualClock::new(0));
    let sdk = EmbedSdk::with_clock(
        Arc::new(provider.clone()),
        http.clone(),
        options,
        clock.clone(),
    );
    Fixture {
        sdk,
        provider,
        http,
        clock,
    }
}

pub fn cookieless_fixture() -> Fixture {
    let fixture = fixture(SdkOptions::with_host_origin(ORIGIN));
    fixture
        .sdk
        .init_cookieless(API_HOST, "/acquire", "/generate")
        .expect("init cookieless");
    fixture
}

pub fn acquired(ttl: u64) -> Value {
    json!({
        "authentication_token": "auth-1",
        "authentication_token_ttl": 30,
        "api_token": "api-1",
        "api_token_ttl": ttl,
        "navigation_token": "nav-1",
        "navigation_token_ttl": ttl,
        "session_reference_token_ttl": 3_000,
    })
}

pub fn generated(ttl: u64) -> Value {
    json!({
        "api_token": "api-2",
        "api_token_ttl": ttl,
        "navigation_token": "nav-2",
        "navigation_token_ttl": ttl,
        "session_reference_token_ttl": 2_900,
    })
}
