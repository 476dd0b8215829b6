//! Typed views over a [`Connection`] for each kind of embedded content.

use serde_json::{json, Value};

use crate::{
    connection::{Connection, Filters, LoadOptions},
    error::EmbedError,
    messages::{
        DASHBOARD_EDIT, DASHBOARD_FILTERS_UPDATE, DASHBOARD_LOAD, DASHBOARD_OPTIONS_SET,
        DASHBOARD_RUN, DASHBOARD_SCHEDULE_MODAL_OPEN, DASHBOARD_STOP, LOOK_FILTERS_UPDATE,
        LOOK_RUN,
    },
    page::PageType,
};

#[derive(Clone)]
pub struct DashboardConnection {
    connection: Connection,
}

impl DashboardConnection {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn run(&self) {
        self.connection.send(DASHBOARD_RUN, json!({}));
    }

    pub fn stop(&self) {
        self.connection.send(DASHBOARD_STOP, json!({}));
    }

    pub fn edit(&self) {
        self.connection.send(DASHBOARD_EDIT, json!({}));
    }

    pub fn update_filters(&self, filters: &Filters) {
        self.connection
            .send(DASHBOARD_FILTERS_UPDATE, json!({ "filters": filters }));
    }

    pub fn set_options(&self, options: Value) {
        self.connection.send(DASHBOARD_OPTIONS_SET, options);
    }

    pub async fn open_schedule_dialog(&self) -> Result<Value, EmbedError> {
        self.connection
            .send_and_receive(DASHBOARD_SCHEDULE_MODAL_OPEN, json!({}))
            .await
    }

    /// Legacy in-frame dashboard switch.
    pub async fn load_dashboard(&self, id: &str, push_history: bool) -> Result<Value, EmbedError> {
        self.connection
            .send_and_receive(
                DASHBOARD_LOAD,
                json!({ "id": id, "pushHistory": push_history }),
            )
            .await
    }
}

/// Explores reuse the look message names.
#[derive(Clone)]
pub struct ExploreConnection {
    connection: Connection,
}

impl ExploreConnection {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn run(&self) {
        self.connection.send(LOOK_RUN, json!({}));
    }

    pub fn update_filters(&self, filters: &Filters) {
        self.connection
            .send(LOOK_FILTERS_UPDATE, json!({ "filters": filters }));
    }
}

#[derive(Clone)]
pub struct LookConnection {
    connection: Connection,
}

impl LookConnection {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn run(&self) {
        self.connection.send(LOOK_RUN, json!({}));
    }

    pub fn update_filters(&self, filters: &Filters) {
        self.connection
            .send(LOOK_FILTERS_UPDATE, json!({ "filters": filters }));
    }
}

#[derive(Clone)]
pub struct ExtensionConnection {
    connection: Connection,
}

impl ExtensionConnection {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub async fn load(&self, id: &str, options: LoadOptions) -> Result<Value, EmbedError> {
        self.connection
            .load_id(PageType::Extensions, id, &[], options)
            .await
    }
}

#[derive(Clone)]
pub struct QueryVisualizationConnection {
    connection: Connection,
}

impl QueryVisualizationConnection {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub async fn load(&self, id: &str, options: LoadOptions) -> Result<Value, EmbedError> {
        self.connection
            .load_id(PageType::QueryVisualization, id, &[], options)
            .await
    }
}

#[derive(Clone)]
pub struct ReportConnection {
    connection: Connection,
}

impl ReportConnection {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub async fn load(&self, id: &str, options: LoadOptions) -> Result<Value, EmbedError> {
        self.connection
            .load_id(PageType::Reports, id, &[], options)
            .await
    }
}
