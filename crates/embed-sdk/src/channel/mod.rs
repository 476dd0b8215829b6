//! Capabilities the SDK needs from the frame host environment.
//!
//! A provider creates the child frame, installs message handlers, and performs
//! the handshake. Everything DOM-related lives behind these traits.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EmbedError;

/// Handler invoked with the payload of a message sent by the child frame.
pub type ChannelHandler = Arc<dyn Fn(&Value) + Send + Sync>;

pub trait ChannelProvider: Send + Sync {
    fn create_host(&self, url: &str) -> Box<dyn HostBuilder>;
}

/// Configures a frame before the handshake starts.
pub trait HostBuilder: Send {
    fn on(&mut self, name: &str, handler: ChannelHandler);
    fn with_sandbox_attribute(&mut self, attribute: &str);
    fn with_allow_attribute(&mut self, attribute: &str);
    fn with_class_name(&mut self, class_name: &str);
    fn frame_border(&mut self, border: &str);
    fn with_target_origin(&mut self, origin: &str);
    fn with_aria_label(&mut self, label: &str);
    /// Selector or identifier of the element the frame is appended to.
    fn append_to(&mut self, element: &str);
    /// Asks the environment to report host scrolling through
    /// [`crate::connection::Connection::send_scroll_position`].
    fn monitor_scroll(&mut self) {}
    fn build(self: Box<Self>) -> Box<dyn Host>;
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Completes the handshake with the child frame.
    async fn connect(&self) -> Result<Arc<dyn ChannelConnection>, EmbedError>;
}

#[async_trait]
pub trait ChannelConnection: Send + Sync {
    fn send(&self, name: &str, payload: Value);
    async fn send_and_receive(&self, name: &str, payload: Value) -> Result<Value, EmbedError>;
}
