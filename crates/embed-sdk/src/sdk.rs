use std::sync::Arc;

use crate::{
    builder::{ContentType, EmbedBuilder},
    channel::ChannelProvider,
    clock::{Clock, SystemClock},
    config::{AcquireSource, AuthConfig, GenerateSource, SdkOptions},
    error::EmbedError,
    http::{HttpTransport, ReqwestTransport},
    session::SessionRegistry,
    tokens::{CookielessFetcher, TokenLifecycle},
};

/// Entry point of the SDK. Every builder created from one instance shares the
/// same [`SessionRegistry`], so sibling frames cooperate on one session.
#[derive(Clone)]
pub struct EmbedSdk {
    inner: Arc<SdkInner>,
}

struct SdkInner {
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn ChannelProvider>,
    http: Arc<dyn HttpTransport>,
    options: SdkOptions,
}

impl EmbedSdk {
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        http: Arc<dyn HttpTransport>,
        options: SdkOptions,
    ) -> Self {
        Self::with_clock(provider, http, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider: Arc<dyn ChannelProvider>,
        http: Arc<dyn HttpTransport>,
        options: SdkOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SdkInner {
                registry: SessionRegistry::new(clock),
                provider,
                http,
                options,
            }),
        }
    }

    /// Uses `reqwest` for outbound calls, resolving relative endpoints against
    /// the configured host origin.
    pub fn with_reqwest(
        provider: Arc<dyn ChannelProvider>,
        options: SdkOptions,
    ) -> Result<Self, EmbedError> {
        let mut transport = ReqwestTransport::new()?;
        if let Some(origin) = &options.host_origin {
            transport = transport.with_base_url(origin)?;
        }
        Ok(Self::new(provider, Arc::new(transport), options))
    }

    /// Private or signed embedding. `auth` of `None` means private embeds.
    pub fn init(&self, api_host: &str, auth: Option<AuthConfig>) -> Result<(), EmbedError> {
        self.inner.registry.init_signed(api_host, auth)
    }

    pub fn init_cookieless(
        &self,
        api_host: &str,
        acquire: impl Into<AcquireSource>,
        generate: impl Into<GenerateSource>,
    ) -> Result<(), EmbedError> {
        self.inner
            .registry
            .init_cookieless(api_host, acquire, generate)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn options(&self) -> &SdkOptions {
        &self.inner.options
    }

    pub fn clear_session(&self) {
        self.inner.registry.clear_session();
    }

    pub(crate) fn provider(&self) -> &Arc<dyn ChannelProvider> {
        &self.inner.provider
    }

    pub(crate) fn http(&self) -> &Arc<dyn HttpTransport> {
        &self.inner.http
    }

    pub(crate) fn token_lifecycle(&self) -> TokenLifecycle {
        TokenLifecycle::new(Arc::clone(&self.inner.registry), self.fetcher())
    }

    pub(crate) fn fetcher(&self) -> CookielessFetcher {
        CookielessFetcher::new(Arc::clone(&self.inner.http))
    }

    fn builder(&self, content_type: ContentType) -> EmbedBuilder {
        EmbedBuilder::new(self.clone(), content_type)
    }

    fn with_id(&self, content_type: ContentType, id: &str) -> EmbedBuilder {
        let mut builder = self.builder(content_type);
        builder.set_id(id);
        builder
    }

    /// Frame showing the blank preload page, used to warm up a session.
    pub fn preload(&self) -> EmbedBuilder {
        let mut builder = self.builder(ContentType::Generic);
        builder.set_url("/embed/preload/");
        builder
    }

    pub fn create_with_url(&self, url: &str) -> Result<EmbedBuilder, EmbedError> {
        self.builder(ContentType::Generic).with_url(url)
    }

    pub fn create_dashboard_with_url(&self, url: &str) -> Result<EmbedBuilder, EmbedError> {
        self.builder(ContentType::Dashboard).with_url(url)
    }

    pub fn create_dashboard_with_id(&self, id: &str) -> EmbedBuilder {
        self.with_id(ContentType::Dashboard, id)
    }

    pub fn create_explore_with_url(&self, url: &str) -> Result<EmbedBuilder, EmbedError> {
        self.builder(ContentType::Explore).with_url(url)
    }

    /// `model::view` ids are normalized to `model/view`.
    pub fn create_explore_with_id(&self, id: &str) -> EmbedBuilder {
        self.with_id(ContentType::Explore, &id.replacen("::", "/", 1))
    }

    pub fn create_look_with_url(&self, url: &str) -> Result<EmbedBuilder, EmbedError> {
        self.builder(ContentType::Look).with_url(url)
    }

    pub fn create_look_with_id(&self, id: &str) -> EmbedBuilder {
        self.with_id(ContentType::Look, id)
    }

    pub fn create_extension_with_url(&self, url: &str) -> Result<EmbedBuilder, EmbedError> {
        self.builder(ContentType::Extension).with_url(url)
    }

    pub fn create_extension_with_id(&self, id: &str) -> EmbedBuilder {
        self.with_id(ContentType::Extension, id)
    }

    pub fn create_report_with_id(&self, id: &str) -> EmbedBuilder {
        self.with_id(ContentType::Report, id)
    }

    pub fn create_query_visualization_with_id(&self, id: &str) -> EmbedBuilder {
        self.with_id(ContentType::QueryVisualization, id)
    }
}
