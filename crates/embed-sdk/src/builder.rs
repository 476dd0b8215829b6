use std::sync::Arc;

use serde_json::Value;

use crate::{
    channel::ChannelHandler,
    client::EmbedClient,
    config::{sanitize_embed_url, AuthConfig, AuthMode},
    embed_url::encode_uri_component,
    error::EmbedError,
    sdk::EmbedSdk,
};

/// Kind of content a builder targets. Decides the `/embed/...` endpoint used
/// when the target is given by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Generic,
    Dashboard,
    Explore,
    Look,
    Extension,
    QueryVisualization,
    Report,
}

impl ContentType {
    pub fn endpoint(self) -> &'static str {
        match self {
            ContentType::Generic => "",
            ContentType::Dashboard => "/embed/dashboards",
            ContentType::Explore => "/embed/explore",
            ContentType::Look => "/embed/looks",
            ContentType::Extension => "/embed/extensions",
            ContentType::QueryVisualization => "/embed/query-visualization",
            ContentType::Report => "/embed/reporting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Unset,
    Url(String),
    Id(String),
}

/// Frame configuration captured by an [`EmbedBuilder`].
#[derive(Clone)]
pub struct EmbedConfig {
    pub(crate) content_type: ContentType,
    target: Target,
    params: Vec<(String, Vec<String>)>,
    pub(crate) handlers: Vec<(String, ChannelHandler)>,
    pub(crate) sandbox_attrs: Vec<String>,
    pub(crate) allow_attrs: Vec<String>,
    pub(crate) class_names: Vec<String>,
    pub(crate) frame_border: String,
    pub(crate) aria_label: Option<String>,
    pub(crate) element: Option<String>,
    pub(crate) scroll_monitor: bool,
    pub(crate) dynamic_height: bool,
    pub(crate) dialog_scroll: bool,
    pub(crate) allow_login_screen: bool,
    pub(crate) sandboxed_host: Option<bool>,
}

impl EmbedConfig {
    fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            target: Target::Unset,
            params: Vec::new(),
            handlers: Vec::new(),
            sandbox_attrs: Vec::new(),
            allow_attrs: Vec::new(),
            class_names: Vec::new(),
            frame_border: "0".to_string(),
            aria_label: None,
            element: None,
            scroll_monitor: false,
            dynamic_height: false,
            dialog_scroll: false,
            allow_login_screen: false,
            sandboxed_host: None,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn has_url(&self) -> bool {
        matches!(self.target, Target::Url(_))
    }

    /// Url of the embedded content before required parameters are added.
    pub fn embed_url(&self) -> Result<String, EmbedError> {
        match &self.target {
            Target::Url(url) => Ok(url.clone()),
            Target::Id(id) => {
                let params = stringify(&self.params);
                let mut url = format!("{}/{}", self.content_type.endpoint(), id);
                if !params.is_empty() {
                    url.push('?');
                    url.push_str(&params);
                }
                Ok(url)
            }
            Target::Unset => Err(EmbedError::Configuration(
                "embed target requires an id or a url".to_string(),
            )),
        }
    }

    pub fn param(&self, key: &str) -> Option<&[String]> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, values)| values.as_slice())
    }

    fn set_param(&mut self, key: String, values: Vec<String>) {
        match self.params.iter_mut().find(|(name, _)| *name == key) {
            Some((_, existing)) => *existing = values,
            None => self.params.push((key, values)),
        }
    }
}

fn stringify(params: &[(String, Vec<String>)]) -> String {
    params
        .iter()
        .flat_map(|(key, values)| {
            values.iter().map(move |value| {
                format!(
                    "{}={}",
                    encode_uri_component(key),
                    encode_uri_component(value)
                )
            })
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn escape_filter(value: &str) -> String {
    value.replace(',', "^,")
}

/// Fluent configuration for one embedded frame.
pub struct EmbedBuilder {
    sdk: EmbedSdk,
    config: EmbedConfig,
}

impl EmbedBuilder {
    pub(crate) fn new(sdk: EmbedSdk, content_type: ContentType) -> Self {
        Self {
            sdk,
            config: EmbedConfig::new(content_type),
        }
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    pub fn embed_url(&self) -> Result<String, EmbedError> {
        self.config.embed_url()
    }

    pub(crate) fn set_id(&mut self, id: &str) {
        self.config.target = Target::Id(id.to_string());
    }

    pub(crate) fn set_url(&mut self, url: &str) {
        self.config.target = Target::Url(url.to_string());
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Result<Self, EmbedError> {
        if self.config.has_url() {
            return Err(EmbedError::Configuration(
                "url already set, cannot also set an id".to_string(),
            ));
        }
        self.config.target = Target::Id(id.into());
        Ok(self)
    }

    pub fn with_url(mut self, url: &str) -> Result<Self, EmbedError> {
        if matches!(self.config.target, Target::Id(_)) {
            return Err(EmbedError::Configuration(
                "id already set, cannot also set a url".to_string(),
            ));
        }
        self.config.target = Target::Url(sanitize_embed_url(url)?);
        Ok(self)
    }

    /// Query parameters appended to id based targets. Later values replace
    /// earlier ones with the same key.
    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in params {
            self.config.set_param(key.into(), vec![value.into()]);
        }
        self
    }

    pub fn with_param_values<V>(mut self, key: impl Into<String>, values: V) -> Self
    where
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.config.set_param(key.into(), values);
        self
    }

    /// Dashboard filters are plain parameters; other content uses `f[name]`.
    pub fn with_filters<I, K, V>(mut self, filters: I, escape: bool) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in filters {
            let name = name.into();
            let value = value.into();
            let value = if escape { escape_filter(&value) } else { value };
            let key = if self.config.content_type == ContentType::Dashboard {
                name
            } else {
                format!("f[{name}]")
            };
            self.config.set_param(key, vec![value]);
        }
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.config
            .set_param("theme".to_string(), vec![theme.into()]);
        self
    }

    pub fn with_sandbox_attr<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .sandbox_attrs
            .extend(attrs.into_iter().map(Into::into));
        self
    }

    pub fn with_allow_attr<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .allow_attrs
            .extend(attrs.into_iter().map(Into::into));
        self
    }

    pub fn with_class_name<I, S>(mut self, class_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .class_names
            .extend(class_names.into_iter().map(Into::into));
        self
    }

    pub fn with_frame_border(mut self, border: impl Into<String>) -> Self {
        self.config.frame_border = border.into();
        self
    }

    pub fn with_aria_label(mut self, label: impl Into<String>) -> Self {
        self.config.aria_label = Some(label.into());
        self
    }

    pub fn append_to(mut self, element: impl Into<String>) -> Self {
        self.config.element = Some(element.into());
        self
    }

    pub fn with_scroll_monitor(mut self, enabled: bool) -> Self {
        self.config.scroll_monitor = enabled;
        self
    }

    pub fn with_dynamic_iframe_height(mut self, enabled: bool) -> Self {
        self.config.dynamic_height = enabled;
        self
    }

    pub fn with_dialog_scroll(mut self, enabled: bool) -> Self {
        self.config.dialog_scroll = enabled;
        self
    }

    pub fn with_allow_login_screen(mut self) -> Self {
        self.config.allow_login_screen = true;
        self
    }

    pub fn with_sandboxed_host(mut self, sandboxed: bool) -> Self {
        self.config.sandboxed_host = Some(sandboxed);
        self
    }

    pub fn with_api_host(self, api_host: &str) -> Result<Self, EmbedError> {
        self.sdk.registry().set_api_host(api_host)?;
        Ok(self)
    }

    pub fn with_auth_url(self, url: impl Into<String>) -> Result<Self, EmbedError> {
        self.with_auth(AuthConfig::new(url))
    }

    pub fn with_auth(self, auth: AuthConfig) -> Result<Self, EmbedError> {
        self.sdk.registry().set_auth(AuthMode::Signed(auth))?;
        Ok(self)
    }

    /// Registers a handler for messages named `name` sent by the frame.
    pub fn on<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.config.handlers.push((name.into(), Arc::new(handler)));
        self
    }

    pub fn build(self) -> EmbedClient {
        EmbedClient::new(self.sdk, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::memory::MemoryChannelProvider, config::SdkOptions, sdk::EmbedSdk};

    fn sdk() -> EmbedSdk {
        EmbedSdk::with_reqwest(
            Arc::new(MemoryChannelProvider::new()),
            SdkOptions::with_host_origin("http://localhost"),
        )
        .expect("sdk")
    }

    #[test]
    fn id_targets_carry_params() {
        let builder = sdk()
            .create_dashboard_with_id("42")
            .with_params([("my_param", "a b")])
            .with_filters([("state", "California,Nevada")], true)
            .with_theme("dark");
        assert_eq!(
            builder.embed_url().unwrap(),
            "/embed/dashboards/42?my_param=a%20b&state=California%5E%2CNevada&theme=dark"
        );
    }

    #[test]
    fn non_dashboard_filters_use_bracket_keys() {
        let builder = sdk()
            .create_look_with_id("7")
            .with_filters([("state", "CA")], false);
        assert_eq!(
            builder.config().param("f[state]"),
            Some(&["CA".to_string()][..])
        );
        assert_eq!(
            builder.embed_url().unwrap(),
            "/embed/looks/7?f%5Bstate%5D=CA"
        );
    }

    #[test]
    fn multi_value_params_repeat_the_key() {
        let builder = sdk()
            .create_look_with_id("7")
            .with_param_values("fields", ["a", "b"]);
        assert_eq!(
            builder.embed_url().unwrap(),
            "/embed/looks/7?fields=a&fields=b"
        );
    }

    #[test]
    fn id_and_url_conflict() {
        let err = sdk()
            .create_dashboard_with_id("42")
            .with_url("/embed/dashboards/43")
            .err()
            .expect("conflict");
        assert!(matches!(err, EmbedError::Configuration(_)));

        let err = sdk()
            .create_dashboard_with_url("/embed/dashboards/43")
            .expect("builder")
            .with_id("42")
            .err()
            .expect("conflict");
        assert!(matches!(err, EmbedError::Configuration(_)));
    }

    #[test]
    fn frame_defaults() {
        let builder = sdk().preload();
        assert_eq!(builder.config().frame_border, "0");
        assert_eq!(builder.embed_url().unwrap(), "/embed/preload/");
        assert_eq!(builder.config().content_type(), ContentType::Generic);
    }

    #[test]
    fn auth_cannot_change_once_set() {
        let sdk = sdk();
        sdk.init("myhost.com", Some(AuthConfig::new("/auth")))
            .expect("init");
        let err = sdk
            .create_dashboard_with_id("1")
            .with_auth_url("/other-auth")
            .err()
            .expect("changed auth");
        assert!(matches!(err, EmbedError::Configuration(_)));

        let err = sdk
            .create_dashboard_with_id("1")
            .with_api_host("other.com")
            .err()
            .expect("changed host");
        assert!(matches!(err, EmbedError::Configuration(_)));
    }
}
