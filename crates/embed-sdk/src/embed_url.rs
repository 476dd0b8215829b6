use std::collections::HashSet;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::{form_urlencoded, Url};

use crate::{config::SDK_PROTOCOL_VERSION, error::EmbedError};

/// Characters left alone by `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const PLACEHOLDER_ORIGIN: &str = "http://abc";

pub fn encode_uri_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// What every frame url must carry before it is handed to the embedded app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredParameters {
    pub api_host: String,
    pub host_origin: Option<String>,
    /// Sandboxed hosts have no usable origin; the api host stands in for it.
    pub sandboxed: bool,
    pub allow_login_screen: bool,
}

impl RequiredParameters {
    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn embed_domain(&self) -> String {
        if self.sandboxed {
            return format!("https://{}", self.api_host);
        }
        self.host_origin
            .clone()
            .unwrap_or_else(|| "null".to_string())
    }

    /// `postMessage` target origin for the frame.
    pub fn target_origin(&self) -> String {
        if self.is_sandboxed() {
            "*".to_string()
        } else {
            format!("https://{}", self.api_host)
        }
    }

    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("embed_domain", self.embed_domain())];
        if self.is_sandboxed() {
            pairs.push(("sandboxed_host", "true".to_string()));
        }
        pairs.push(("sdk", SDK_PROTOCOL_VERSION.to_string()));
        if self.allow_login_screen && !self.is_sandboxed() {
            pairs.push(("allow_login_screen", "true".to_string()));
        }
        pairs
    }

    /// Appends the missing required parameters to `url`, never overwriting
    /// ones already present. Relative urls stay relative.
    pub fn apply(&self, url: &str) -> Result<String, EmbedError> {
        let relative = !(url.starts_with("https://") || url.starts_with("http://"));
        let candidate = if relative {
            format!("{PLACEHOLDER_ORIGIN}{url}")
        } else {
            url.to_string()
        };
        let mut parsed = Url::parse(&candidate)
            .map_err(|err| EmbedError::Configuration(format!("invalid embed url {url}: {err}")))?;

        let present: HashSet<String> = parsed
            .query_pairs()
            .map(|(key, _)| key.into_owned())
            .collect();
        let missing: Vec<(&'static str, String)> = self
            .pairs()
            .into_iter()
            .filter(|(key, _)| !present.contains(*key))
            .collect();
        let added_embed_domain = missing.iter().any(|(key, _)| *key == "embed_domain");
        if !missing.is_empty() {
            let mut query = parsed.query_pairs_mut();
            for (key, value) in &missing {
                query.append_pair(key, value);
            }
        }

        let mut rendered = parsed.to_string();
        if added_embed_domain {
            let embed_domain = self.embed_domain();
            let encoded: String =
                form_urlencoded::byte_serialize(embed_domain.as_bytes()).collect();
            rendered = rendered.replacen(
                &format!("embed_domain={encoded}"),
                &format!("embed_domain={embed_domain}"),
                1,
            );
        }
        if relative {
            rendered = rendered.replacen(PLACEHOLDER_ORIGIN, "", 1);
        }
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(origin: Option<&str>) -> RequiredParameters {
        RequiredParameters {
            api_host: "myhost.com".into(),
            host_origin: origin.map(str::to_string),
            sandboxed: origin.is_none(),
            allow_login_screen: false,
        }
    }

    #[test]
    fn appends_domain_and_version_to_relative_urls() {
        let prepared = params(Some("http://localhost"))
            .apply("/embed/preload/")
            .unwrap();
        assert_eq!(
            prepared,
            "/embed/preload/?embed_domain=http://localhost&sdk=3"
        );

        let prepared = params(Some("http://localhost"))
            .apply("/embed/dashboards/42?my_filter=123")
            .unwrap();
        assert_eq!(
            prepared,
            "/embed/dashboards/42?my_filter=123&embed_domain=http://localhost&sdk=3"
        );
    }

    #[test]
    fn sandboxed_hosts_use_the_api_host_once() {
        let prepared = params(None).apply("/embed/preload/").unwrap();
        assert_eq!(
            prepared,
            "/embed/preload/?embed_domain=https://myhost.com&sandboxed_host=true&sdk=3"
        );
        assert_eq!(params(None).target_origin(), "*");
        assert_eq!(
            params(Some("http://localhost")).target_origin(),
            "https://myhost.com"
        );
    }

    #[test]
    fn existing_parameters_are_kept() {
        let prepared = params(Some("http://localhost"))
            .apply("/embed/looks/1?embed_domain=https://other.com&sdk=2")
            .unwrap();
        assert_eq!(
            prepared,
            "/embed/looks/1?embed_domain=https://other.com&sdk=2"
        );
    }

    #[test]
    fn login_screen_flag_only_for_origin_hosts() {
        let mut with_login = params(Some("http://localhost"));
        with_login.allow_login_screen = true;
        assert_eq!(
            with_login.apply("/embed/looks/1").unwrap(),
            "/embed/looks/1?embed_domain=http://localhost&sdk=3&allow_login_screen=true"
        );

        let mut sandboxed = params(None);
        sandboxed.allow_login_screen = true;
        assert!(!sandboxed
            .apply("/embed/looks/1")
            .unwrap()
            .contains("allow_login_screen"));
    }

    #[test]
    fn absolute_urls_stay_absolute() {
        let prepared = params(Some("http://localhost"))
            .apply("https://myhost.com/embed/looks/3")
            .unwrap();
        assert_eq!(
            prepared,
            "https://myhost.com/embed/looks/3?embed_domain=http://localhost&sdk=3"
        );
    }

    #[test]
    fn uri_component_encoding() {
        assert_eq!(
            encode_uri_component("/embed/preload/?embed_domain=http://localhost&sdk=3"),
            "%2Fembed%2Fpreload%2F%3Fembed_domain%3Dhttp%3A%2F%2Flocalhost%26sdk%3D3"
        );
        assert_eq!(encode_uri_component("a b(c)!"), "a%20b(c)!");
    }
}
