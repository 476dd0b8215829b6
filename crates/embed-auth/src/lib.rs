//! Server-side helpers for embedding: signed embed urls and cookieless
//! session management against the analytics API.

pub mod config;
pub mod cookieless;
pub mod error;
pub mod signed_url;
pub mod user;

pub use config::AuthServerConfig;
pub use cookieless::{CookielessSession, CookielessSessionClient, EmbedTokens};
pub use error::AuthError;
pub use signed_url::{create_nonce, create_signed_url};
pub use user::EmbedUser;
