//! Signed embed urls.
//!
//! The signature is an HMAC-SHA1 over newline separated fields, base64
//! encoded. Every user field travels JSON encoded.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use sha1::Sha1;
use tracing::debug;

use crate::{error::AuthError, user::EmbedUser};

type HmacSha1 = Hmac<Sha1>;

const NONCE_LEN: usize = 16;

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

pub(crate) fn encode_uri_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

pub fn create_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, AuthError> {
    Ok(serde_json::to_string(value)?)
}

fn opt_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>, AuthError> {
    value.as_ref().map(to_json).transpose()
}

/// Builds `https://{host}/login/embed/{src}?...&signature=...` for `user`.
///
/// `nonce` defaults to a fresh random value and `time` to the current unix
/// time in seconds.
pub fn create_signed_url(
    src: &str,
    user: &EmbedUser,
    host: &str,
    secret: &str,
    nonce: Option<&str>,
    time: Option<u64>,
) -> Result<String, AuthError> {
    let nonce = nonce.map(str::to_string).unwrap_or_else(create_nonce);
    let time = match time {
        Some(time) => time,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| AuthError::Config(format!("system clock before epoch: {err}")))?
            .as_secs(),
    };

    let json_nonce = to_json(&nonce)?;
    let json_time = time.to_string();
    let access_filters = match &user.access_filters {
        Some(filters) => to_json(filters)?,
        None => "{}".to_string(),
    };
    let external_group_id = opt_json(&user.external_group_id)?;
    let external_user_id = to_json(&user.external_user_id)?;
    let group_ids = opt_json(&user.group_ids)?;
    let models = to_json(&user.models)?;
    let permissions = to_json(&user.permissions)?;
    let session_length = to_json(&user.session_length)?;
    let force_logout_login = to_json(&user.force_logout_login)?;
    let user_attributes = opt_json(&user.user_attributes)?;

    let embed_path = format!("/login/embed/{}", encode_uri_component(src));

    let mut to_sign = vec![
        host,
        embed_path.as_str(),
        json_nonce.as_str(),
        json_time.as_str(),
        session_length.as_str(),
        external_user_id.as_str(),
        permissions.as_str(),
        models.as_str(),
    ];
    to_sign.extend(group_ids.as_deref());
    to_sign.extend(external_group_id.as_deref());
    to_sign.extend(user_attributes.as_deref());
    to_sign.push(access_filters.as_str());
    let signature = sign(&to_sign.join("\n"), secret)?;

    let params: Vec<(&str, Option<String>)> = vec![
        ("access_filters", Some(access_filters.clone())),
        ("external_group_id", external_group_id),
        ("external_user_id", Some(external_user_id)),
        ("first_name", opt_json(&user.first_name)?),
        ("force_logout_login", Some(force_logout_login)),
        ("group_ids", group_ids),
        ("last_name", opt_json(&user.last_name)?),
        ("models", Some(models)),
        ("nonce", Some(json_nonce)),
        ("permissions", Some(permissions)),
        ("session_length", Some(session_length)),
        ("time", Some(json_time)),
        ("user_attributes", user_attributes),
        ("user_timezone", opt_json(&user.user_timezone)?),
        ("signature", Some(signature)),
    ];
    let query = params
        .into_iter()
        .filter_map(|(key, value)| {
            value.map(|value| format!("{key}={}", encode_uri_component(&value)))
        })
        .collect::<Vec<_>>()
        .join("&");

    debug!(
        target = "embed.auth",
        host,
        external_user_id = %user.external_user_id,
        "signed embed url created"
    );
    Ok(format!("https://{host}{embed_path}?{query}"))
}

fn sign(message: &str, secret: &str) -> Result<String, AuthError> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|err| AuthError::Config(format!("invalid embed secret: {err}")))?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
