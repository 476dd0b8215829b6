use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The embed user a signed url or cookieless session is created for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedUser {
    pub external_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub session_length: u64,
    #[serde(default)]
    pub force_logout_login: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_attributes: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_filters: Option<Map<String, Value>>,
}

impl EmbedUser {
    pub fn new(external_user_id: impl Into<String>, session_length: u64) -> Self {
        Self {
            external_user_id: external_user_id.into(),
            session_length,
            ..Self::default()
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }
}
