//! Handle to an established frame.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    channel::ChannelConnection,
    embed_url::{encode_uri_component, RequiredParameters},
    error::EmbedError,
    facade::{
        DashboardConnection, ExploreConnection, ExtensionConnection, LookConnection,
        QueryVisualizationConnection, ReportConnection,
    },
    messages::{DASHBOARD_LOAD, HOST_SCROLL, PAGE_LOAD},
    page::{AppVersion, PageType},
    tokens::FrameTokenState,
};

/// Oldest embedded application version that understands `page:load`.
pub const PAGE_LOAD_MIN_VERSION: (i32, i32) = (25, 1);

/// Filter values keyed by filter name.
pub type Filters = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub push_history: bool,
    /// Resolve only after the next `page:changed` event.
    pub wait_until_navigated: bool,
}

impl LoadOptions {
    pub fn push_history(mut self) -> Self {
        self.push_history = true;
        self
    }

    pub fn wait_until_navigated(mut self) -> Self {
        self.wait_until_navigated = true;
        self
    }
}

/// Host page geometry reported to the frame when scroll monitoring is on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollPosition {
    pub offset_left: f64,
    pub offset_top: f64,
    pub scroll_x: f64,
    pub scroll_y: f64,
}

#[derive(Debug, Default)]
struct PageState {
    page_type: PageType,
    current_path: String,
    is_editing: bool,
    version: Option<AppVersion>,
    frame_height: Option<u64>,
}

/// Per-frame state mutated by protocol handlers.
#[derive(Default)]
pub(crate) struct ConnectionState {
    page: Mutex<PageState>,
    session_expired: AtomicBool,
    pub(crate) tokens: FrameTokenState,
    channel: OnceLock<Arc<dyn ChannelConnection>>,
    page_waiters: Mutex<Vec<oneshot::Sender<PageType>>>,
}

impl ConnectionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, channel: Arc<dyn ChannelConnection>) {
        if self.channel.set(channel).is_err() {
            warn!(target = "embed.connection", "channel already attached");
        }
    }

    pub fn channel(&self) -> Option<Arc<dyn ChannelConnection>> {
        self.channel.get().cloned()
    }

    /// Resolves with the page type of the next `page:changed` event.
    pub fn page_changed_waiter(&self) -> oneshot::Receiver<PageType> {
        let (tx, rx) = oneshot::channel();
        self.page_waiters.lock().push(tx);
        rx
    }

    pub fn apply_page_change(&self, payload: &Value) {
        let page = payload.get("page");
        let url = page
            .and_then(|page| page.get("url"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let path = url.split('?').next().unwrap_or_default();

        let page_type = {
            let mut state = self.page.lock();
            if path != state.current_path {
                state.current_path = path.to_string();
                state.is_editing = false;
                state.page_type = PageType::from_url(url);
            }
            if state.version.is_none() {
                state.version = page
                    .and_then(|page| page.get("lookerVersion"))
                    .and_then(Value::as_str)
                    .and_then(AppVersion::parse);
            }
            state.page_type
        };
        debug!(target = "embed.connection", %page_type, path, "page changed");

        let waiters = std::mem::take(&mut *self.page_waiters.lock());
        for waiter in waiters {
            let _ = waiter.send(page_type);
        }
    }

    pub fn set_editing(&self, editing: bool) {
        self.page.lock().is_editing = editing;
    }

    pub fn mark_session_expired(&self) {
        self.session_expired.store(true, Ordering::SeqCst);
    }

    pub fn set_frame_height(&self, height: u64) {
        self.page.lock().frame_height = Some(height);
    }
}

/// The caller's handle to one connected frame.
///
/// Cloning is cheap; all clones talk to the same frame.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connection(..)")
    }
}

struct ConnectionInner {
    channel: Arc<dyn ChannelConnection>,
    state: Arc<ConnectionState>,
    required: RequiredParameters,
}

impl Connection {
    pub(crate) fn new(
        channel: Arc<dyn ChannelConnection>,
        state: Arc<ConnectionState>,
        required: RequiredParameters,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                channel,
                state,
                required,
            }),
        }
    }

    pub fn send(&self, name: &str, payload: Value) {
        self.inner.channel.send(name, payload);
    }

    pub async fn send_and_receive(&self, name: &str, payload: Value) -> Result<Value, EmbedError> {
        self.inner.channel.send_and_receive(name, payload).await
    }

    pub fn page_type(&self) -> PageType {
        self.inner.state.page.lock().page_type
    }

    pub fn current_path(&self) -> String {
        self.inner.state.page.lock().current_path.clone()
    }

    pub fn is_editing(&self) -> bool {
        self.inner.state.page.lock().is_editing
    }

    pub fn has_session_expired(&self) -> bool {
        self.inner.state.session_expired.load(Ordering::SeqCst)
    }

    /// Version reported by the first navigation, or [`AppVersion::UNKNOWN`].
    pub fn looker_version(&self) -> AppVersion {
        self.inner.state.page.lock().version.unwrap_or_default()
    }

    pub fn looker_major_version(&self) -> i32 {
        self.looker_version().major
    }

    pub fn looker_minor_version(&self) -> i32 {
        self.looker_version().minor
    }

    pub fn send_scroll_position(&self, position: ScrollPosition) {
        match serde_json::to_value(position) {
            Ok(payload) => self.send(HOST_SCROLL, payload),
            Err(err) => {
                warn!(target = "embed.connection", error = %err, "scroll position not sent")
            }
        }
    }

    /// Height last reported through `page:properties:changed`.
    pub fn frame_height(&self) -> Option<u64> {
        self.inner.state.page.lock().frame_height
    }

    pub fn is_page_load_supported(&self) -> bool {
        let (major, minor) = PAGE_LOAD_MIN_VERSION;
        self.looker_version().is_at_least(major, minor)
    }

    fn unsupported() -> EmbedError {
        let (major, minor) = PAGE_LOAD_MIN_VERSION;
        EmbedError::VersionUnsupported(format!(
            "'page:load' requires embedded application version {major}.{minor} or greater"
        ))
    }

    /// Navigates the frame in place.
    pub async fn load_url(&self, url: &str, options: LoadOptions) -> Result<Value, EmbedError> {
        if !self.is_page_load_supported() {
            return Err(Self::unsupported());
        }
        if self.page_type() == PageType::Dashboards {
            self.as_dashboard_connection().stop();
        }
        let url = self.inner.required.apply(url)?;
        let navigated = options
            .wait_until_navigated
            .then(|| self.inner.state.page_changed_waiter());

        debug!(target = "embed.connection", url = %url, "loading url");
        let response = self
            .send_and_receive(
                PAGE_LOAD,
                json!({ "pushHistory": options.push_history, "url": url }),
            )
            .await?;
        if let Some(navigated) = navigated {
            navigated.await.map_err(|_| {
                EmbedError::Channel("frame closed before navigation completed".to_string())
            })?;
        }
        Ok(response)
    }

    pub async fn load_id(
        &self,
        page_type: PageType,
        id: &str,
        params: &[(&str, &str)],
        options: LoadOptions,
    ) -> Result<Value, EmbedError> {
        let mut url = format!("/embed/{}/{}", page_type.path_segment(), id);
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(key, value)| {
                    format!(
                        "{}={}",
                        encode_uri_component(key),
                        encode_uri_component(value)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }
        self.load_url(&url, options).await
    }

    /// Falls back to `dashboard:load` when the frame already shows a dashboard
    /// but predates in-place navigation.
    pub async fn load_dashboard(
        &self,
        id: &str,
        options: LoadOptions,
    ) -> Result<Value, EmbedError> {
        if !self.is_page_load_supported() && self.page_type() == PageType::Dashboards {
            return self
                .send_and_receive(
                    DASHBOARD_LOAD,
                    json!({ "id": id, "pushHistory": options.push_history }),
                )
                .await;
        }
        self.load_id(PageType::Dashboards, id, &[], options).await
    }

    /// `model::view` ids are normalized to `model/view`.
    pub async fn load_explore(&self, id: &str, options: LoadOptions) -> Result<Value, EmbedError> {
        let id = id.replacen("::", "/", 1);
        self.load_id(PageType::Explore, &id, &[], options).await
    }

    pub async fn load_look(&self, id: &str, options: LoadOptions) -> Result<Value, EmbedError> {
        self.load_id(PageType::Looks, id, &[], options).await
    }

    pub async fn load_extension(
        &self,
        id: &str,
        options: LoadOptions,
    ) -> Result<Value, EmbedError> {
        self.load_id(PageType::Extensions, id, &[], options).await
    }

    pub async fn load_query_visualization(
        &self,
        id: &str,
        options: LoadOptions,
    ) -> Result<Value, EmbedError> {
        self.load_id(PageType::QueryVisualization, id, &[], options)
            .await
    }

    pub async fn load_report(&self, id: &str, options: LoadOptions) -> Result<Value, EmbedError> {
        self.load_id(PageType::Reports, id, &[], options).await
    }

    pub async fn load_merge_query(
        &self,
        id: &str,
        options: LoadOptions,
    ) -> Result<Value, EmbedError> {
        self.load_url(&format!("/embed/merge?mid={id}"), options)
            .await
    }

    pub async fn load_query(
        &self,
        model: &str,
        view: &str,
        qid: &str,
        options: LoadOptions,
    ) -> Result<Value, EmbedError> {
        self.load_url(&format!("/embed/query/{model}/{view}?qid={qid}"), options)
            .await
    }

    pub async fn preload(&self, options: LoadOptions) -> Result<Value, EmbedError> {
        self.load_url("/embed/preload", options).await
    }

    pub fn as_dashboard_connection(&self) -> DashboardConnection {
        DashboardConnection::new(self.clone())
    }

    pub fn as_explore_connection(&self) -> ExploreConnection {
        ExploreConnection::new(self.clone())
    }

    pub fn as_look_connection(&self) -> LookConnection {
        LookConnection::new(self.clone())
    }

    pub fn as_extension_connection(&self) -> ExtensionConnection {
        ExtensionConnection::new(self.clone())
    }

    pub fn as_query_visualization_connection(&self) -> QueryVisualizationConnection {
        QueryVisualizationConnection::new(self.clone())
    }

    pub fn as_report_connection(&self) -> ReportConnection {
        ReportConnection::new(self.clone())
    }

    fn unsupported_on_page(&self, action: &str) {
        warn!(
            target = "embed.connection",
            action,
            page_type = %self.page_type(),
            "action not supported on the current page"
        );
    }

    #[deprecated(note = "use a typed connection such as `as_dashboard_connection()`")]
    pub fn run(&self) {
        match self.page_type() {
            PageType::Dashboards => self.as_dashboard_connection().run(),
            PageType::Explore => self.as_explore_connection().run(),
            PageType::Looks => self.as_look_connection().run(),
            _ => self.unsupported_on_page("run"),
        }
    }

    #[deprecated(note = "use `as_dashboard_connection().stop()`")]
    pub fn stop(&self) {
        match self.page_type() {
            PageType::Dashboards => self.as_dashboard_connection().stop(),
            _ => self.unsupported_on_page("stop"),
        }
    }

    #[deprecated(note = "use `as_dashboard_connection().edit()`")]
    pub fn edit(&self) {
        match self.page_type() {
            PageType::Dashboards => self.as_dashboard_connection().edit(),
            _ => self.unsupported_on_page("edit"),
        }
    }

    #[deprecated(note = "use a typed connection such as `as_dashboard_connection()`")]
    pub fn update_filters(&self, filters: &Filters) {
        match self.page_type() {
            PageType::Dashboards => self.as_dashboard_connection().update_filters(filters),
            PageType::Explore => self.as_explore_connection().update_filters(filters),
            PageType::Looks => self.as_look_connection().update_filters(filters),
            _ => self.unsupported_on_page("update_filters"),
        }
    }

    #[deprecated(note = "use `as_dashboard_connection().set_options()`")]
    pub fn set_options(&self, options: Value) {
        match self.page_type() {
            PageType::Dashboards => self.as_dashboard_connection().set_options(options),
            _ => self.unsupported_on_page("set_options"),
        }
    }

    #[deprecated(note = "use `as_dashboard_connection().open_schedule_dialog()`")]
    pub async fn open_schedule_dialog(&self) -> Result<Value, EmbedError> {
        match self.page_type() {
            PageType::Dashboards => self.as_dashboard_connection().open_schedule_dialog().await,
            other => Err(EmbedError::ProtocolData(format!(
                "schedule dialog is not available on {other} pages"
            ))),
        }
    }
}
