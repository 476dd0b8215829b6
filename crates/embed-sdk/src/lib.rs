//! Host side of an embedding SDK for analytics content.
//!
//! An [`EmbedSdk`] owns the session shared by every frame it creates. Frames
//! are described with an [`EmbedBuilder`], connected through an
//! [`EmbedClient`], and driven afterwards through a [`Connection`] and its
//! typed facades. Rendering is delegated to a [`channel::ChannelProvider`].

pub mod builder;
pub mod cancel;
pub mod channel;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod embed_url;
pub mod error;
pub mod facade;
pub mod http;
pub mod messages;
pub mod page;
pub mod sdk;
pub mod session;
pub mod tokens;

pub use builder::{ContentType, EmbedBuilder, EmbedConfig};
pub use cancel::CancelSignal;
pub use client::{ConnectOptions, EmbedClient, Strategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AcquireSessionCallback, AcquireSource, AuthConfig, AuthMode, GenerateSource,
    GenerateTokensCallback, RequestSpec, SdkOptions,
};
pub use connection::{Connection, Filters, LoadOptions, ScrollPosition};
pub use error::{EmbedError, EmbedResult};
pub use facade::{
    DashboardConnection, ExploreConnection, ExtensionConnection, LookConnection,
    QueryVisualizationConnection, ReportConnection,
};
pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use page::{AppVersion, PageType};
pub use sdk::EmbedSdk;
pub use session::SessionRegistry;
pub use tokens::{CookielessSessionData, SessionTokens};
