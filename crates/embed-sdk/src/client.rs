//! Connection orchestrator: turns an [`EmbedConfig`] into a connected frame.
//!
//! `connect()` prepares the frame url, runs the strategy specific round trip
//! (none for private embeds, signing for signed embeds, session acquisition
//! for cookieless embeds), installs the protocol handlers and waits for the
//! channel handshake. The whole sequence is abortable through a
//! [`CancelSignal`] and bounded by a timeout.

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    builder::EmbedConfig,
    cancel::CancelSignal,
    channel::{ChannelHandler, HostBuilder},
    config::{AuthConfig, AuthMode},
    connection::{Connection, ConnectionState},
    embed_url::{encode_uri_component, RequiredParameters},
    error::EmbedError,
    http::{HttpMethod, HttpRequest},
    messages::{
        CLIENT_DIALOG, DASHBOARD_EDIT_CANCEL, DASHBOARD_EDIT_START, DASHBOARD_SAVE_COMPLETE,
        LOOK_EDIT_CANCEL, LOOK_EDIT_START, LOOK_SAVE_COMPLETE, PAGE_CHANGED,
        PAGE_PROPERTIES_CHANGED, SESSION_EXPIRED, SESSION_STATUS, SESSION_TOKENS,
        SESSION_TOKENS_REQUEST,
    },
    sdk::EmbedSdk,
    session::{CreationOutcome, SessionLease, SessionLock},
    tokens::validate_acquired,
};

/// Reported heights at or below this are ignored when sizing the frame.
const MIN_FRAME_HEIGHT: u64 = 100;

/// Options for a single [`EmbedClient::connect`] call.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Overrides [`crate::config::SdkOptions::connect_timeout`].
    pub timeout: Option<Duration>,
    pub signal: Option<CancelSignal>,
    pub wait_until_navigated: bool,
}

impl ConnectOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn wait_until_navigated(mut self) -> Self {
        self.wait_until_navigated = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Private,
    Signed,
    Cookieless,
}

#[derive(Debug, Deserialize)]
struct SignedUrl {
    url: String,
}

/// Built by [`crate::builder::EmbedBuilder::build`]. Owns at most one
/// connected frame.
pub struct EmbedClient {
    sdk: EmbedSdk,
    config: Arc<EmbedConfig>,
    connection: parking_lot::Mutex<Option<Connection>>,
    connect_gate: tokio::sync::Mutex<()>,
}

impl EmbedClient {
    pub(crate) fn new(sdk: EmbedSdk, config: EmbedConfig) -> Self {
        Self {
            sdk,
            config: Arc::new(config),
            connection: parking_lot::Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    pub fn connection(&self) -> Option<Connection> {
        self.connection.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn strategy(&self) -> Strategy {
        match self.sdk.registry().auth_mode() {
            AuthMode::Cookieless { .. } => Strategy::Cookieless,
            AuthMode::Signed(auth) if !auth.url.is_empty() => Strategy::Signed,
            _ => Strategy::Private,
        }
    }

    pub fn required_parameters(&self) -> Result<RequiredParameters, EmbedError> {
        let api_host = self.sdk.registry().api_host().ok_or_else(|| {
            EmbedError::Configuration("api host must be set before connecting".to_string())
        })?;
        let options = self.sdk.options();
        Ok(RequiredParameters {
            api_host,
            host_origin: options.host_origin.clone(),
            sandboxed: self.config.sandboxed_host.unwrap_or(options.is_sandboxed()),
            allow_login_screen: self.config.allow_login_screen,
        })
    }

    pub fn target_origin(&self) -> Result<String, EmbedError> {
        Ok(self.required_parameters()?.target_origin())
    }

    pub fn append_required_parameters(&self, url: &str) -> Result<String, EmbedError> {
        self.required_parameters()?.apply(url)
    }

    /// Connects the frame, or returns the connection made by an earlier call.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Connection, EmbedError> {
        if let Some(connection) = self.connection() {
            debug!(target = "embed.connect", "reusing established connection");
            return Ok(connection);
        }

        let signal = options.signal.clone().unwrap_or_default();
        if signal.is_cancelled() {
            return Err(signal.to_error());
        }
        let required = self.required_parameters()?;
        let timeout = options
            .timeout
            .unwrap_or(self.sdk.options().connect_timeout);
        let strategy = self.strategy();

        let establish = self.connect_once(strategy, &required, options.wait_until_navigated);
        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(signal.to_error()),
            _ = tokio::time::sleep(timeout) => Err(timed_out(&required, timeout)),
            result = establish => result,
        };
        if let Err(err) = &result {
            warn!(target = "embed.connect", ?strategy, error = %err, "connect failed");
        }
        result
    }

    /// Establishes the frame unless a concurrent call got there first.
    async fn connect_once(
        &self,
        strategy: Strategy,
        required: &RequiredParameters,
        wait_until_navigated: bool,
    ) -> Result<Connection, EmbedError> {
        let _gate = self.connect_gate.lock().await;
        if let Some(connection) = self.connection() {
            debug!(
                target = "embed.connect",
                "reusing connection made while waiting"
            );
            return Ok(connection);
        }

        info!(
            target = "embed.connect",
            ?strategy,
            content = ?self.config.content_type(),
            "connecting frame"
        );
        let connection = self
            .establish(strategy, required, wait_until_navigated)
            .await?;
        info!(target = "embed.connect", ?strategy, "frame connected");
        *self.connection.lock() = Some(connection.clone());
        Ok(connection)
    }

    async fn establish(
        &self,
        strategy: Strategy,
        required: &RequiredParameters,
        wait_until_navigated: bool,
    ) -> Result<Connection, EmbedError> {
        let src = required.apply(&self.config.embed_url()?)?;
        match strategy {
            Strategy::Private => {
                let url = format!("https://{}{}", required.api_host, src);
                self.create_frame(&url, required, None, wait_until_navigated)
                    .await
            }
            Strategy::Signed => {
                self.connect_signed(&src, required, wait_until_navigated)
                    .await
            }
            Strategy::Cookieless => {
                self.connect_cookieless(&src, required, wait_until_navigated)
                    .await
            }
        }
    }

    async fn connect_signed(
        &self,
        src: &str,
        required: &RequiredParameters,
        wait_until_navigated: bool,
    ) -> Result<Connection, EmbedError> {
        let bare = format!("https://{}{}", required.api_host, src);
        loop {
            match self.sdk.registry().acquire_session_lock() {
                SessionLock::Established => {
                    return self
                        .create_frame(&bare, required, None, wait_until_navigated)
                        .await;
                }
                SessionLock::Follower(wait) => match wait.wait().await {
                    CreationOutcome::Created => {
                        return self
                            .create_frame(&bare, required, None, wait_until_navigated)
                            .await;
                    }
                    CreationOutcome::Failed(err) => return Err(err),
                    CreationOutcome::Abandoned => {
                        debug!(
                            target = "embed.connect",
                            "signing leader abandoned, retrying"
                        );
                    }
                },
                SessionLock::Leader(lease) => {
                    let AuthMode::Signed(auth) = self.sdk.registry().auth_mode() else {
                        let err = EmbedError::Configuration("signed auth not configured".into());
                        lease.fail(err.clone());
                        return Err(err);
                    };
                    let url = match self.sign(&auth, src).await {
                        Ok(url) => url,
                        Err(err) => {
                            lease.fail(err.clone());
                            return Err(err);
                        }
                    };
                    return self
                        .create_frame(&url, required, Some(lease), wait_until_navigated)
                        .await;
                }
            }
        }
    }

    async fn sign(&self, auth: &AuthConfig, src: &str) -> Result<String, EmbedError> {
        let mut url = format!("{}?src={}", auth.url, encode_uri_component(src));
        for (name, value) in &auth.params {
            url.push_str(&format!(
                "&{}={}",
                encode_uri_component(name),
                encode_uri_component(value)
            ));
        }
        let mut request = HttpRequest::new(HttpMethod::Get, url);
        request
            .headers
            .push(("Cache-Control".to_string(), "no-cache".to_string()));
        request.headers.extend(auth.headers.iter().cloned());
        request.with_credentials = auth.with_credentials;

        debug!(target = "embed.connect", auth_url = %auth.url, "requesting signed url");
        let response = self.sdk.http().execute(request).await?;
        if response.status != 200 {
            return Err(EmbedError::transport(
                "signing request failed",
                response.status_text,
            ));
        }
        let signed: SignedUrl = response.json()?;
        Ok(signed.url)
    }

    async fn connect_cookieless(
        &self,
        src: &str,
        required: &RequiredParameters,
        wait_until_navigated: bool,
    ) -> Result<Connection, EmbedError> {
        loop {
            match self.sdk.registry().acquire_session_lock() {
                SessionLock::Established => {
                    return self
                        .connect_cookieless_follower(src, required, wait_until_navigated)
                        .await;
                }
                SessionLock::Follower(wait) => match wait.wait().await {
                    CreationOutcome::Created => {
                        return self
                            .connect_cookieless_follower(src, required, wait_until_navigated)
                            .await;
                    }
                    CreationOutcome::Failed(err) => return Err(err),
                    CreationOutcome::Abandoned => {
                        debug!(
                            target = "embed.connect",
                            "session leader abandoned, retrying"
                        );
                    }
                },
                SessionLock::Leader(lease) => {
                    let url = match self.cookieless_login_url(src, required).await {
                        Ok(url) => url,
                        Err(err) => {
                            lease.fail(err.clone());
                            return Err(err);
                        }
                    };
                    return self
                        .create_frame(&url, required, Some(lease), wait_until_navigated)
                        .await;
                }
            }
        }
    }

    /// Frames joining an existing session navigate with the cached token and
    /// skip the login page.
    async fn connect_cookieless_follower(
        &self,
        src: &str,
        required: &RequiredParameters,
        wait_until_navigated: bool,
    ) -> Result<Connection, EmbedError> {
        let url = match self.sdk.registry().navigation_token() {
            Some(navigation_token) => format!(
                "https://{}{}&embed_navigation_token={}",
                required.api_host, src, navigation_token
            ),
            None => self.cookieless_login_url(src, required).await?,
        };
        self.create_frame(&url, required, None, wait_until_navigated)
            .await
    }

    async fn cookieless_login_url(
        &self,
        src: &str,
        required: &RequiredParameters,
    ) -> Result<String, EmbedError> {
        let AuthMode::Cookieless { acquire, .. } = self.sdk.registry().auth_mode() else {
            return Err(EmbedError::Configuration(
                "cookieless auth not configured".to_string(),
            ));
        };
        let data = self.sdk.fetcher().acquire(&acquire).await?;
        let acquired = validate_acquired(data)?;
        self.sdk.registry().store_acquired(acquired.bundle);
        debug!(target = "embed.connect", "cookieless session acquired");

        let target = format!("{src}&embed_navigation_token={}", acquired.navigation_token);
        Ok(format!(
            "https://{}/login/embed/{}?embed_authentication_token={}",
            required.api_host,
            encode_uri_component(&target),
            acquired.authentication_token
        ))
    }

    async fn create_frame(
        &self,
        url: &str,
        required: &RequiredParameters,
        lease: Option<SessionLease>,
        wait_until_navigated: bool,
    ) -> Result<Connection, EmbedError> {
        let state = ConnectionState::new();
        let mut host_builder = self.sdk.provider().create_host(url);
        self.install_handlers(host_builder.as_mut(), &state);
        for (name, handler) in &self.config.handlers {
            host_builder.on(name, Arc::clone(handler));
        }
        self.apply_attributes(host_builder.as_mut(), required);
        let host = host_builder.build();

        let navigated = wait_until_navigated.then(|| state.page_changed_waiter());
        let channel = match host.connect().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Some(lease) = lease {
                    lease.fail(err.clone());
                }
                return Err(err);
            }
        };
        state.attach(Arc::clone(&channel));
        if let Some(lease) = lease {
            lease.complete();
        }
        let connection = Connection::new(channel, state, required.clone());

        if let Some(navigated) = navigated {
            let page_type = navigated
                .await
                .map_err(|_| EmbedError::Channel("frame closed before navigating".to_string()))?;
            debug!(target = "embed.connect", %page_type, "first navigation observed");
        }
        Ok(connection)
    }

    fn install_handlers(&self, builder: &mut dyn HostBuilder, state: &Arc<ConnectionState>) {
        let registry = Arc::clone(self.sdk.registry());
        let frame = Arc::clone(state);
        builder.on(
            SESSION_EXPIRED,
            handler(move |_| {
                frame.mark_session_expired();
                registry.clear_session();
            }),
        );

        let frame = Arc::clone(state);
        builder.on(
            PAGE_CHANGED,
            handler(move |payload: &Value| frame.apply_page_change(payload)),
        );

        for (name, editing) in [
            (DASHBOARD_EDIT_START, true),
            (DASHBOARD_EDIT_CANCEL, false),
            (DASHBOARD_SAVE_COMPLETE, false),
            (LOOK_EDIT_START, true),
            (LOOK_EDIT_CANCEL, false),
            (LOOK_SAVE_COMPLETE, false),
        ] {
            let frame = Arc::clone(state);
            builder.on(name, handler(move |_| frame.set_editing(editing)));
        }

        if self.strategy() == Strategy::Cookieless {
            let frame = Arc::clone(state);
            builder.on(
                SESSION_STATUS,
                handler(move |payload: &Value| {
                    if payload.get("expired").and_then(Value::as_bool) == Some(true) {
                        frame.tokens.mark_expired();
                    }
                }),
            );

            let frame = Arc::clone(state);
            let lifecycle = self.sdk.token_lifecycle();
            let runtime = tokio::runtime::Handle::try_current().ok();
            builder.on(
                SESSION_TOKENS_REQUEST,
                handler(move |_| {
                    let Some(runtime) = &runtime else {
                        warn!(
                            target = "embed.tokens",
                            "no runtime to answer token request"
                        );
                        return;
                    };
                    let frame = Arc::clone(&frame);
                    let lifecycle = lifecycle.clone();
                    runtime.spawn(async move {
                        let tokens = lifecycle.respond(&frame.tokens).await;
                        match frame.channel() {
                            Some(channel) => channel.send(SESSION_TOKENS, tokens.to_value()),
                            None => warn!(target = "embed.tokens", "token reply without a channel"),
                        }
                    });
                }),
            );
        }

        if self.config.dialog_scroll {
            builder.on(
                CLIENT_DIALOG,
                handler(|payload: &Value| {
                    let open = payload.get("open").and_then(Value::as_bool) == Some(true);
                    let covers = payload.get("placement").and_then(Value::as_str) == Some("cover");
                    if open && covers {
                        debug!(
                            target = "embed.connection",
                            "dialog opened over frame, scroll host to it"
                        );
                    }
                }),
            );
        }

        if self.config.dynamic_height {
            let frame = Arc::clone(state);
            builder.on(
                PAGE_PROPERTIES_CHANGED,
                handler(move |payload: &Value| {
                    if let Some(height) = payload.get("height").and_then(Value::as_u64) {
                        if height > MIN_FRAME_HEIGHT {
                            frame.set_frame_height(height);
                        }
                    }
                }),
            );
        }
    }

    fn apply_attributes(&self, builder: &mut dyn HostBuilder, required: &RequiredParameters) {
        let config = &self.config;
        for attribute in &config.sandbox_attrs {
            builder.with_sandbox_attribute(attribute);
        }
        for attribute in &config.allow_attrs {
            builder.with_allow_attribute(attribute);
        }
        for class_name in &config.class_names {
            builder.with_class_name(class_name);
        }
        builder.frame_border(&config.frame_border);
        builder.with_target_origin(&required.target_origin());
        if let Some(label) = &config.aria_label {
            builder.with_aria_label(label);
        }
        if let Some(element) = &config.element {
            builder.append_to(element);
        }
        if config.scroll_monitor {
            builder.monitor_scroll();
        }
    }
}

fn handler<F>(f: F) -> ChannelHandler
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

fn timed_out(required: &RequiredParameters, timeout: Duration) -> EmbedError {
    EmbedError::Cancelled(format!(
        "timed out after {}ms waiting for the embedded content; ensure {} is allow-listed as an embed domain on {}",
        timeout.as_millis(),
        required.embed_domain(),
        required.api_host
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        channel::memory::MemoryChannelProvider, config::SdkOptions, messages::DASHBOARD_EDIT_START,
        page::PageType,
    };

    fn sdk(provider: &MemoryChannelProvider) -> EmbedSdk {
        let sdk = EmbedSdk::with_reqwest(
            Arc::new(provider.clone()),
            SdkOptions::with_host_origin("http://localhost"),
        )
        .expect("sdk");
        sdk.init("myhost.com", None).expect("init");
        sdk
    }

    #[test]
    fn strategy_follows_registry_auth() {
        let provider = MemoryChannelProvider::new();
        let client = sdk(&provider).preload().build();
        assert_eq!(client.strategy(), Strategy::Private);
        assert_eq!(
            client.target_origin().expect("origin"),
            "https://myhost.com"
        );
    }

    #[test]
    fn connecting_needs_an_api_host() {
        let provider = MemoryChannelProvider::new();
        let sdk = EmbedSdk::with_reqwest(Arc::new(provider), SdkOptions::default()).expect("sdk");
        let err = sdk
            .preload()
            .build()
            .required_parameters()
            .expect_err("no host");
        assert!(matches!(err, EmbedError::Configuration(_)));
    }

    #[tokio::test]
    async fn protocol_handlers_precede_user_handlers() {
        let provider = MemoryChannelProvider::new();
        let client = sdk(&provider)
            .create_dashboard_with_id("42")
            .on(DASHBOARD_EDIT_START, |_| {})
            .with_dynamic_iframe_height(true)
            .with_scroll_monitor(true)
            .with_aria_label("Sales")
            .build();
        let connection = client
            .connect(ConnectOptions::default())
            .await
            .expect("connected");

        let frame = provider.last_host().expect("frame");
        let names = frame.handler_names();
        assert_eq!(names.first().map(String::as_str), Some(SESSION_EXPIRED));
        assert_eq!(names.last().map(String::as_str), Some(DASHBOARD_EDIT_START));
        assert_eq!(frame.handler_count(DASHBOARD_EDIT_START), 2);
        assert_eq!(frame.handler_count(SESSION_TOKENS_REQUEST), 0);
        assert!(frame.attributes().scroll_monitor);
        assert_eq!(frame.attributes().aria_label.as_deref(), Some("Sales"));
        assert_eq!(frame.attributes().frame_border.as_deref(), Some("0"));

        frame.emit(DASHBOARD_EDIT_START, json!({}));
        assert!(connection.is_editing());
        frame.emit(PAGE_PROPERTIES_CHANGED, json!({ "height": 80 }));
        assert_eq!(connection.frame_height(), None);
        frame.emit(PAGE_PROPERTIES_CHANGED, json!({ "height": 640 }));
        assert_eq!(connection.frame_height(), Some(640));
    }

    #[tokio::test]
    async fn session_expiry_is_recorded() {
        let provider = MemoryChannelProvider::new();
        let client = sdk(&provider).preload().build();
        let connection = client
            .connect(ConnectOptions::default())
            .await
            .expect("connected");
        provider
            .last_host()
            .expect("frame")
            .emit(SESSION_EXPIRED, json!({}));
        assert!(connection.has_session_expired());
    }

    #[tokio::test]
    async fn page_changes_reach_the_connection() {
        let provider = MemoryChannelProvider::new();
        let client = sdk(&provider).create_look_with_id("7").build();
        let connection = client
            .connect(ConnectOptions::default())
            .await
            .expect("connected");
        provider.last_host().expect("frame").emit(
            PAGE_CHANGED,
            json!({ "page": { "url": "/embed/looks/7", "lookerVersion": "25.2.0" } }),
        );
        assert_eq!(connection.page_type(), PageType::Looks);
        assert!(connection.is_page_load_supported());
    }

    #[test]
    fn timeout_message_names_the_embed_domain() {
        let required = RequiredParameters {
            api_host: "myhost.com".into(),
            host_origin: Some("https://app.example".into()),
            sandboxed: false,
            allow_login_screen: false,
        };
        let EmbedError::Cancelled(message) = timed_out(&required, Duration::from_millis(500))
        else {
            panic!("expected cancellation");
        };
        assert!(message.contains("https://app.example"));
        assert!(message.contains("myhost.com"));
    }
}
