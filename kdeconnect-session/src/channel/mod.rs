//! Channels and Channel Services
//!
//! A [`Channel`] is one authenticated, ordered, bidirectional packet stream
//! to exactly one peer. It is produced by a [`ChannelService`] after the
//! identity exchange and handed to the
//! [`DeviceManager`](crate::DeviceManager), which attaches it to the matching
//! [`Device`](crate::Device).
//!
//! ## Channel Contract
//!
//! - `read_packet` yields packets in the order the peer wrote them
//! - `write_packet` is safe to call from several tasks; frames never interleave
//! - after `close`, pending and future reads and writes fail with
//!   [`ProtocolError::Cancelled`](crate::ProtocolError::Cancelled)
//! - a closed channel is never reopened
//!
//! ## Verification Key
//!
//! Both peers derive the same key from the two certificates so a user can
//! compare them out of band. See [`verification_key`].
//!
//! ## Payloads
//!
//! Packets never inline large data. A packet with `payloadSize` and
//! `payloadTransferInfo` announces a side stream: the sender prepares it
//! with [`Channel::upload`], sends the packet, then waits in
//! [`PayloadUpload::accept`]; the receiver opens it with
//! [`Channel::download`].

mod stream;
pub mod tcp;
pub mod tls;

pub use stream::{memory_pair, Endpoint, StreamChannel};
pub use tcp::TcpChannelService;

use crate::{DeviceIdentity, Packet, ProtocolError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;

/// Stream a downloaded payload is read from
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// Stream an uploaded payload is written into
pub type PayloadWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A prepared upload waiting for the peer to connect
pub struct PayloadUpload {
    accept: BoxFuture<'static, Result<PayloadWriter>>,
}

impl PayloadUpload {
    /// Wrap the future that resolves once the peer has connected
    pub fn new<F>(accept: F) -> Self
    where
        F: Future<Output = Result<PayloadWriter>> + Send + 'static,
    {
        Self {
            accept: Box::pin(accept),
        }
    }

    /// Wait for the peer to connect and return the payload stream
    ///
    /// Send the announcing packet first. Dropping the upload abandons it.
    pub async fn accept(self) -> Result<PayloadWriter> {
        self.accept.await
    }
}

impl fmt::Debug for PayloadUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadUpload").finish_non_exhaustive()
    }
}

/// Payload size announced by `packet`, `None` when unknown or unbounded
pub fn payload_size(packet: &Packet) -> Option<u64> {
    packet.payload_size.and_then(|size| u64::try_from(size).ok())
}

/// Box a payload stream, ending it after the announced size
pub(crate) fn limit_payload<R>(reader: R, packet: &Packet) -> PayloadReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match payload_size(packet) {
        Some(size) => Box::new(reader.take(size)),
        None => Box::new(reader),
    }
}

/// A live packet stream to a single peer
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Identity we announced on this channel
    fn identity(&self) -> &DeviceIdentity;

    /// Identity the peer announced on this channel
    fn peer_identity(&self) -> &DeviceIdentity;

    /// Our certificate material, if the transport has one
    fn certificate(&self) -> Option<&[u8]>;

    /// The peer's authenticated certificate material, if the transport has one
    fn peer_certificate(&self) -> Option<&[u8]>;

    /// Human-readable description of the transport, such as `tcp://10.0.0.5:1716`
    fn description(&self) -> &str;

    /// Whether [`Channel::close`] has been called
    fn is_closed(&self) -> bool;

    /// Read the next packet
    async fn read_packet(&self) -> Result<Packet>;

    /// Write a packet
    async fn write_packet(&self, packet: &Packet) -> Result<()>;

    /// Close the channel, cancelling pending operations
    async fn close(&self) -> Result<()>;

    /// Open the payload announced by `packet`
    ///
    /// The stream ends after `payloadSize` bytes when the packet gives one.
    async fn download(&self, packet: &Packet) -> Result<PayloadReader> {
        let _ = packet;
        Err(ProtocolError::Transport(format!(
            "{} does not support payloads",
            self.description()
        )))
    }

    /// Prepare a payload for `packet`, filling in `payloadTransferInfo`
    ///
    /// Set `payload_size` before calling, then send the packet and wait in
    /// [`PayloadUpload::accept`].
    async fn upload(&self, packet: &mut Packet) -> Result<PayloadUpload> {
        let _ = packet;
        Err(ProtocolError::Transport(format!(
            "{} does not support payloads",
            self.description()
        )))
    }

    /// Verification key for this channel
    ///
    /// `None` unless both certificates are available.
    fn verification_key(&self) -> Option<String> {
        match (self.certificate(), self.peer_certificate()) {
            (Some(local), Some(peer)) => Some(verification_key(local, peer)),
            _ => None,
        }
    }
}

/// Compute the verification key for two certificates
///
/// SHA-256 over both inputs with the byte-wise greater one first, hex
/// encoded. The result does not depend on argument order.
///
/// # Examples
///
/// ```
/// use kdeconnect_session::channel::verification_key;
///
/// let ours = b"certificate-a";
/// let theirs = b"certificate-b";
/// assert_eq!(verification_key(ours, theirs), verification_key(theirs, ours));
/// ```
pub fn verification_key(certificate: &[u8], peer_certificate: &[u8]) -> String {
    let (first, second) = if certificate > peer_certificate {
        (certificate, peer_certificate)
    } else {
        (peer_certificate, certificate)
    };

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(second);
    hex::encode(hasher.finalize())
}

/// Sink a service pushes new channels into
pub type ChannelSender = mpsc::UnboundedSender<Arc<dyn Channel>>;

/// A discovery backend that produces channels
///
/// Each service owns one URI scheme. The manager routes
/// [`identify`](ChannelService::identify) requests by scheme.
#[async_trait]
pub trait ChannelService: Send + Sync {
    /// URI scheme handled by this service, without `://`
    fn scheme(&self) -> &str;

    /// Start accepting channels, pushing each one into `channels`
    async fn start(&self, channels: ChannelSender) -> Result<()>;

    /// Actively look for peers
    ///
    /// `target` is a full URI such as `tcp://192.168.1.20:1716`, or `None` to
    /// contact everything the service knows how to reach.
    async fn identify(&self, target: Option<&str>) -> Result<()>;

    /// Stop accepting channels
    async fn stop(&self) -> Result<()>;
}
