//! In-process channel provider for tests and headless hosts.
//!
//! Records every frame it creates, lets callers play the child frame by
//! emitting events, and can hold handshakes open until released.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tracing::trace;

use super::{ChannelConnection, ChannelHandler, ChannelProvider, Host, HostBuilder};
use crate::error::EmbedError;

/// Attributes requested for a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameAttributes {
    pub sandbox: Vec<String>,
    pub allow: Vec<String>,
    pub class_names: Vec<String>,
    pub frame_border: Option<String>,
    pub target_origin: Option<String>,
    pub aria_label: Option<String>,
    pub append_to: Option<String>,
    pub scroll_monitor: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub name: String,
    pub payload: Value,
    pub expects_reply: bool,
}

#[derive(Clone)]
pub struct MemoryChannelProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    hosts: RwLock<Vec<Arc<MemoryHost>>>,
    host_count: watch::Sender<usize>,
    hold_handshakes: AtomicBool,
    handshake_failure: Mutex<Option<EmbedError>>,
    replies: Arc<RwLock<HashMap<String, Value>>>,
}

impl Default for MemoryChannelProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannelProvider {
    pub fn new() -> Self {
        let (host_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(ProviderInner {
                hosts: RwLock::new(Vec::new()),
                host_count,
                hold_handshakes: AtomicBool::new(false),
                handshake_failure: Mutex::new(None),
                replies: Arc::new(RwLock::new(HashMap::new())),
            }),
        }
    }

    /// Frames built from now on wait for [`MemoryHost::release_handshake`].
    pub fn hold_handshakes(&self, hold: bool) {
        self.inner.hold_handshakes.store(hold, Ordering::SeqCst);
    }

    /// Frames built from now on fail their handshake with `err`.
    pub fn fail_handshakes(&self, err: Option<EmbedError>) {
        *self.inner.handshake_failure.lock() = err;
    }

    /// Reply returned by `send_and_receive` for messages named `name`.
    pub fn reply_with(&self, name: &str, payload: Value) {
        self.inner.replies.write().insert(name.to_string(), payload);
    }

    pub fn hosts(&self) -> Vec<Arc<MemoryHost>> {
        self.inner.hosts.read().clone()
    }

    pub fn last_host(&self) -> Option<Arc<MemoryHost>> {
        self.inner.hosts.read().last().cloned()
    }

    /// Resolves once at least `count` frames have been built.
    pub async fn wait_for_hosts(&self, count: usize) -> Vec<Arc<MemoryHost>> {
        let mut built = self.inner.host_count.subscribe();
        loop {
            let hosts = self.hosts();
            if hosts.len() >= count {
                return hosts;
            }
            if built.changed().await.is_err() {
                return self.hosts();
            }
        }
    }
}

impl ChannelProvider for MemoryChannelProvider {
    fn create_host(&self, url: &str) -> Box<dyn HostBuilder> {
        Box::new(MemoryHostBuilder {
            provider: Arc::clone(&self.inner),
            url: url.to_string(),
            handlers: HashMap::new(),
            handler_order: Vec::new(),
            attributes: FrameAttributes::default(),
        })
    }
}

struct MemoryHostBuilder {
    provider: Arc<ProviderInner>,
    url: String,
    handlers: HashMap<String, Vec<ChannelHandler>>,
    handler_order: Vec<String>,
    attributes: FrameAttributes,
}

impl HostBuilder for MemoryHostBuilder {
    fn on(&mut self, name: &str, handler: ChannelHandler) {
        self.handler_order.push(name.to_string());
        self.handlers
            .entry(name.to_string())
            .or_default()
            .push(handler);
    }

    fn with_sandbox_attribute(&mut self, attribute: &str) {
        self.attributes.sandbox.push(attribute.to_string());
    }

    fn with_allow_attribute(&mut self, attribute: &str) {
        self.attributes.allow.push(attribute.to_string());
    }

    fn with_class_name(&mut self, class_name: &str) {
        self.attributes.class_names.push(class_name.to_string());
    }

    fn frame_border(&mut self, border: &str) {
        self.attributes.frame_border = Some(border.to_string());
    }

    fn with_target_origin(&mut self, origin: &str) {
        self.attributes.target_origin = Some(origin.to_string());
    }

    fn with_aria_label(&mut self, label: &str) {
        self.attributes.aria_label = Some(label.to_string());
    }

    fn append_to(&mut self, element: &str) {
        self.attributes.append_to = Some(element.to_string());
    }

    fn monitor_scroll(&mut self) {
        self.attributes.scroll_monitor = true;
    }

    fn build(self: Box<Self>) -> Box<dyn Host> {
        let builder = *self;
        let held = builder.provider.hold_handshakes.load(Ordering::SeqCst);
        let (gate, _) = watch::channel(!held);
        let host = Arc::new(MemoryHost {
            url: builder.url,
            handlers: builder.handlers,
            handler_order: builder.handler_order,
            attributes: builder.attributes,
            channel: Arc::new(MemoryChannel::new(Arc::clone(&builder.provider.replies))),
            gate,
            connected: AtomicBool::new(false),
            failure: builder.provider.handshake_failure.lock().clone(),
        });
        builder.provider.hosts.write().push(Arc::clone(&host));
        builder.provider.host_count.send_modify(|count| *count += 1);
        trace!(target = "embed.channel", url = %host.url, "memory frame built");
        Box::new(MemoryHostHandle { host })
    }
}

/// A frame created by [`MemoryChannelProvider`].
pub struct MemoryHost {
    url: String,
    handlers: HashMap<String, Vec<ChannelHandler>>,
    handler_order: Vec<String>,
    attributes: FrameAttributes,
    channel: Arc<MemoryChannel>,
    gate: watch::Sender<bool>,
    connected: AtomicBool,
    failure: Option<EmbedError>,
}

impl MemoryHost {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn attributes(&self) -> &FrameAttributes {
        &self.attributes
    }

    /// Handler names in registration order, one entry per handler.
    pub fn handler_names(&self) -> &[String] {
        &self.handler_order
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.get(name).map(Vec::len).unwrap_or(0)
    }

    /// Plays the child frame sending `name`. Returns how many handlers ran.
    pub fn emit(&self, name: &str, payload: Value) -> usize {
        let handlers = self.handlers.get(name).cloned().unwrap_or_default();
        for handler in &handlers {
            handler(&payload);
        }
        handlers.len()
    }

    pub fn release_handshake(&self) {
        self.gate.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Arc<MemoryChannel> {
        Arc::clone(&self.channel)
    }
}

struct MemoryHostHandle {
    host: Arc<MemoryHost>,
}

#[async_trait]
impl Host for MemoryHostHandle {
    async fn connect(&self) -> Result<Arc<dyn ChannelConnection>, EmbedError> {
        let mut released = self.host.gate.subscribe();
        while !*released.borrow_and_update() {
            if released.changed().await.is_err() {
                break;
            }
        }
        if let Some(err) = &self.host.failure {
            return Err(err.clone());
        }
        self.host.connected.store(true, Ordering::SeqCst);
        let channel: Arc<dyn ChannelConnection> = self.host.channel();
        Ok(channel)
    }
}

/// Host side of a connected memory frame.
pub struct MemoryChannel {
    sent: Mutex<Vec<SentMessage>>,
    sent_count: watch::Sender<usize>,
    replies: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryChannel {
    fn new(replies: Arc<RwLock<HashMap<String, Value>>>) -> Self {
        let (sent_count, _) = watch::channel(0);
        Self {
            sent: Mutex::new(Vec::new()),
            sent_count,
            replies,
        }
    }

    fn record(&self, name: &str, payload: Value, expects_reply: bool) {
        self.sent.lock().push(SentMessage {
            name: name.to_string(),
            payload,
            expects_reply,
        });
        self.sent_count.send_modify(|count| *count += 1);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_named(&self, name: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|message| message.name == name)
            .map(|message| message.payload.clone())
            .collect()
    }

    /// Resolves once at least `count` messages named `name` were sent.
    pub async fn wait_for(&self, name: &str, count: usize) -> Vec<Value> {
        let mut updates = self.sent_count.subscribe();
        loop {
            let matching = self.sent_named(name);
            if matching.len() >= count {
                return matching;
            }
            if updates.changed().await.is_err() {
                return matching;
            }
        }
    }
}

#[async_trait]
impl ChannelConnection for MemoryChannel {
    fn send(&self, name: &str, payload: Value) {
        self.record(name, payload, false);
    }

    async fn send_and_receive(&self, name: &str, payload: Value) -> Result<Value, EmbedError> {
        self.record(name, payload, true);
        Ok(self
            .replies
            .read()
            .get(name)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn held_handshake_waits_for_release() {
        let provider = MemoryChannelProvider::new();
        provider.hold_handshakes(true);
        let host = provider
            .create_host("https://myhost.com/embed/preload")
            .build();
        let connecting = tokio::spawn(async move { host.connect().await.map(|_| ()) });

        let frames = provider.wait_for_hosts(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!frames[0].is_connected());

        frames[0].release_handshake();
        tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .expect("handshake completes")
            .expect("connect task")
            .expect("connected");
        assert!(frames[0].is_connected());
    }

    #[tokio::test]
    async fn emit_runs_handlers_in_registration_order() {
        let provider = MemoryChannelProvider::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut builder = provider.create_host("/embed/looks/1");
        for tag in ["first", "second"] {
            let seen = seen.clone();
            builder.on(
                "page:changed",
                Arc::new(move |payload: &Value| seen.lock().push((tag, payload.clone()))),
            );
        }
        builder.frame_border("0");
        let _host = builder.build();

        let frame = provider.last_host().expect("frame");
        assert_eq!(frame.emit("page:changed", json!({"n": 1})), 2);
        assert_eq!(frame.emit("unknown", json!({})), 0);
        assert_eq!(
            *seen.lock(),
            vec![("first", json!({"n": 1})), ("second", json!({"n": 1}))]
        );
        assert_eq!(frame.attributes().frame_border.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn send_and_receive_returns_configured_reply() {
        let provider = MemoryChannelProvider::new();
        provider.reply_with("page:load", json!({"ok": true}));
        let host = provider.create_host("/embed/preload").build();
        let channel = host.connect().await.expect("connected");

        channel.send("dashboard:run", json!({}));
        let reply = channel
            .send_and_receive("page:load", json!({"url": "/embed/looks/1"}))
            .await
            .expect("reply");
        assert_eq!(reply, json!({"ok": true}));

        let frame = provider.last_host().expect("frame");
        let sent = frame.channel().sent();
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].expects_reply);
        assert!(sent[1].expects_reply);
    }
}
