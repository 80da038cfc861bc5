use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{error::Result, types::ConnectionParams};

/// Capacity of the queue between the notification task and the session engine
pub const FRAGMENT_QUEUE_DEPTH: usize = 64;

/// Receiving end of the fragment queue returned by [`Transport::open`]
pub type FragmentReceiver = mpsc::Receiver<Bytes>;

/// Link to one plug, carrying encoded frames out and notification fragments in
///
/// Implementations deliver every notification value received on the control
/// characteristic into the channel returned by [`Transport::open`], in
/// arrival order. Dropping the sender signals that the link is gone.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link and subscribe to notifications
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be found or connected.
    async fn open(&mut self, params: &ConnectionParams) -> Result<FragmentReceiver>;

    /// Write one encoded frame to the control characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the link is down or the write fails.
    async fn send_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Whether the link is currently established
    async fn is_link_up(&self) -> bool;

    /// Tear down the link; closing an already closed link is not an error
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to disconnect.
    async fn close(&mut self) -> Result<()>;

    /// Read the plain-text device name characteristic
    ///
    /// # Errors
    ///
    /// Returns an error if the link is down or the read fails.
    async fn read_device_name(&mut self) -> Result<String>;
}
