//! Message names exchanged with the embedded content.

pub const SESSION_EXPIRED: &str = "session:expired";
pub const SESSION_STATUS: &str = "session:status";
pub const SESSION_TOKENS_REQUEST: &str = "session:tokens:request";
pub const SESSION_TOKENS: &str = "session:tokens";

pub const PAGE_CHANGED: &str = "page:changed";
pub const PAGE_LOAD: &str = "page:load";
pub const PAGE_PROPERTIES_CHANGED: &str = "page:properties:changed";
pub const CLIENT_DIALOG: &str = "env:client:dialog";
pub const HOST_SCROLL: &str = "env:host:scroll";

pub const DASHBOARD_RUN: &str = "dashboard:run";
pub const DASHBOARD_STOP: &str = "dashboard:stop";
pub const DASHBOARD_EDIT: &str = "dashboard:edit";
pub const DASHBOARD_LOAD: &str = "dashboard:load";
pub const DASHBOARD_FILTERS_UPDATE: &str = "dashboard:filters:update";
pub const DASHBOARD_OPTIONS_SET: &str = "dashboard:options:set";
pub const DASHBOARD_SCHEDULE_MODAL_OPEN: &str = "dashboard:schedule_modal:open";
pub const DASHBOARD_EDIT_START: &str = "dashboard:edit:start";
pub const DASHBOARD_EDIT_CANCEL: &str = "dashboard:edit:cancel";
pub const DASHBOARD_SAVE_COMPLETE: &str = "dashboard:save:complete";

pub const LOOK_RUN: &str = "look:run";
pub const LOOK_FILTERS_UPDATE: &str = "look:filters:update";
pub const LOOK_EDIT_START: &str = "look:edit:start";
pub const LOOK_EDIT_CANCEL: &str = "look:edit:cancel";
pub const LOOK_SAVE_COMPLETE: &str = "look:save:complete";
