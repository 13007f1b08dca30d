//! Newline-delimited JSON channel over any async byte stream

use super::{limit_payload, Channel, PayloadReader, PayloadUpload, PayloadWriter};
use crate::packet::MAX_PACKET_SIZE;
use crate::{DeviceIdentity, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Buffer size of each direction of an in-memory pair
const MEMORY_PIPE_SIZE: usize = 64 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One side of a channel: the identity it announced and its certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub identity: DeviceIdentity,
    pub certificate: Option<Vec<u8>>,
}

impl Endpoint {
    /// Endpoint without certificate material
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            certificate: None,
        }
    }

    /// Builder pattern: attach certificate material
    pub fn with_certificate(mut self, certificate: impl Into<Vec<u8>>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }
}

/// Side channel a [`StreamChannel`] opens payload streams on
#[async_trait]
pub(crate) trait PayloadTransport: Send + Sync {
    async fn download(&self, packet: &Packet) -> Result<PayloadReader>;

    async fn upload(&self, packet: &mut Packet) -> Result<PayloadUpload>;
}

/// Channel framing packets as JSON lines over a byte stream
///
/// Reads and writes go through separate locks, so a pending read never
/// blocks a write. Concurrent writers queue on the write lock.
pub struct StreamChannel {
    local: Endpoint,
    peer: Endpoint,
    description: String,
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
    payloads: Option<Arc<dyn PayloadTransport>>,
}

impl StreamChannel {
    /// Create a channel over a read half and a write half
    pub fn new<R, W>(
        local: Endpoint,
        peer: Endpoint,
        reader: R,
        writer: W,
        description: impl Into<String>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let (closed, _) = watch::channel(false);

        Self {
            local,
            peer,
            description: description.into(),
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            closed,
            payloads: None,
        }
    }

    /// Builder pattern: open payload streams through `payloads`
    pub(crate) fn with_payloads(mut self, payloads: Arc<dyn PayloadTransport>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    fn payloads(&self) -> Result<&Arc<dyn PayloadTransport>> {
        if self.is_closed() {
            return Err(self.cancelled());
        }
        self.payloads.as_ref().ok_or_else(|| {
            ProtocolError::Transport(format!("{} does not support payloads", self.description))
        })
    }

    fn cancelled(&self) -> ProtocolError {
        ProtocolError::Cancelled(format!("{} is closed", self.description))
    }

    async fn read_frame(&self) -> Result<Packet> {
        let mut reader = self.reader.lock().await;
        let packet = read_line_packet(&mut *reader).await?;

        debug!(
            "Received packet '{}' on {}",
            packet.packet_type, self.description
        );
        Ok(packet)
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "writing packet"))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "flushing packet"))?;
        Ok(())
    }
}

/// Read one newline-terminated packet from a buffered reader
///
/// At most [`MAX_PACKET_SIZE`] bytes are consumed for a single line.
pub(crate) async fn read_line_packet<R>(reader: &mut BufReader<R>) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let read = reader
        .take(MAX_PACKET_SIZE as u64 + 1)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, "reading packet"))?;

    if read == 0 {
        return Err(ProtocolError::Transport(
            "connection closed by peer".to_string(),
        ));
    }

    if line.last() != Some(&b'\n') {
        if line.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), MAX_PACKET_SIZE));
        }
        return Err(ProtocolError::Transport(
            "connection closed mid-packet".to_string(),
        ));
    }

    Packet::from_bytes(&line)
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("description", &self.description)
            .field("identity", &self.local.identity.device_id)
            .field("peer_identity", &self.peer.identity.device_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Channel for StreamChannel {
    fn identity(&self) -> &DeviceIdentity {
        &self.local.identity
    }

    fn peer_identity(&self) -> &DeviceIdentity {
        &self.peer.identity
    }

    fn certificate(&self) -> Option<&[u8]> {
        self.local.certificate.as_deref()
    }

    fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer.certificate.as_deref()
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn read_packet(&self) -> Result<Packet> {
        let mut closed = self.closed.subscribe();

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(self.cancelled()),
            result = self.read_frame() => result,
        }
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(bytes.len(), MAX_PACKET_SIZE));
        }

        let mut closed = self.closed.subscribe();

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(self.cancelled()),
            result = self.write_frame(&bytes) => {
                if result.is_ok() {
                    debug!("Sent packet '{}' on {}", packet.packet_type, self.description);
                }
                result
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        debug!("Closing channel {}", self.description);

        // Pending writers were woken above and release the lock
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.description, e);
        }
        Ok(())
    }

    async fn download(&self, packet: &Packet) -> Result<PayloadReader> {
        self.payloads()?.download(packet).await
    }

    async fn upload(&self, packet: &mut Packet) -> Result<PayloadUpload> {
        self.payloads()?.upload(packet).await
    }
}

/// Payload streams between the two ends of a [`memory_pair`]
///
/// An upload parks the read end of a pipe under a fresh id, which the
/// packet carries as `payloadTransferInfo: {"id": n}`.
#[derive(Default)]
struct MemoryPayloads {
    next_id: AtomicU64,
    pending: std::sync::Mutex<HashMap<u64, DuplexStream>>,
}

impl MemoryPayloads {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, DuplexStream>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PayloadTransport for MemoryPayloads {
    async fn download(&self, packet: &Packet) -> Result<PayloadReader> {
        let id = packet
            .payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ProtocolError::InvalidPacket("expected \"id\" field holding a uint64".to_string())
            })?;

        let stream = self.pending().remove(&id).ok_or_else(|| {
            ProtocolError::Transport(format!("no payload waiting under id {}", id))
        })?;
        Ok(limit_payload(stream, packet))
    }

    async fn upload(&self, packet: &mut Packet) -> Result<PayloadUpload> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (writer, reader) = tokio::io::duplex(MEMORY_PIPE_SIZE);
        self.pending().insert(id, reader);

        let mut info = Map::new();
        info.insert("id".to_string(), json!(id));
        packet.payload_transfer_info = Some(info);

        Ok(PayloadUpload::new(async move {
            let writer: PayloadWriter = Box::new(writer);
            Ok(writer)
        }))
    }
}

/// Create two connected in-process channels
///
/// The first channel is `a`'s view (local `a`, peer `b`), the second is `b`'s.
///
/// # Examples
///
/// ```
/// use kdeconnect_session::channel::{memory_pair, Channel, Endpoint};
/// use kdeconnect_session::{DeviceIdentity, DeviceType, Packet};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let a = Endpoint::new(DeviceIdentity::new("A", DeviceType::Desktop));
/// let b = Endpoint::new(DeviceIdentity::new("B", DeviceType::Phone));
/// let (left, right) = memory_pair(a, b);
///
/// left.write_packet(&Packet::new("kdeconnect.ping", json!({}))).await.unwrap();
/// let packet = right.read_packet().await.unwrap();
/// assert_eq!(packet.packet_type, "kdeconnect.ping");
/// # });
/// ```
pub fn memory_pair(a: Endpoint, b: Endpoint) -> (StreamChannel, StreamChannel) {
    let (a_stream, b_stream) = tokio::io::duplex(MEMORY_PIPE_SIZE);
    let (a_read, a_write) = tokio::io::split(a_stream);
    let (b_read, b_write) = tokio::io::split(b_stream);

    let a_description = format!("memory://{}", b.identity.device_id);
    let b_description = format!("memory://{}", a.identity.device_id);

    let payloads: Arc<dyn PayloadTransport> = Arc::new(MemoryPayloads::default());
    let left = StreamChannel::new(a.clone(), b.clone(), a_read, a_write, a_description)
        .with_payloads(payloads.clone());
    let right =
        StreamChannel::new(b, a, b_read, b_write, b_description).with_payloads(payloads);
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint::new(DeviceIdentity::new("Left", DeviceType::Desktop))
                .with_certificate(b"left-cert".to_vec()),
            Endpoint::new(DeviceIdentity::new("Right", DeviceType::Phone))
                .with_certificate(b"right-cert".to_vec()),
        )
    }

    #[tokio::test]
    async fn test_packets_arrive_in_order() {
        let (a, b) = endpoints();
        let (left, right) = memory_pair(a, b);

        for i in 0..5 {
            let packet = Packet::new("kdeconnect.ping", json!({ "seq": i }));
            left.write_packet(&packet).await.unwrap();
        }

        for i in 0..5 {
            let packet = right.read_packet().await.unwrap();
            assert_eq!(packet.body["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_identities_are_mirrored() {
        let (a, b) = endpoints();
        let (left, right) = memory_pair(a.clone(), b.clone());

        assert_eq!(left.identity(), &a.identity);
        assert_eq!(left.peer_identity(), &b.identity);
        assert_eq!(right.peer_identity(), &a.identity);
        assert_eq!(right.peer_certificate(), Some(&b"left-cert"[..]));
    }

    #[tokio::test]
    async fn test_verification_keys_match() {
        let (a, b) = endpoints();
        let (left, right) = memory_pair(a, b);

        let key = left.verification_key();
        assert!(key.is_some());
        assert_eq!(key, right.verification_key());
    }

    #[tokio::test]
    async fn test_no_key_without_certificates() {
        let a = Endpoint::new(DeviceIdentity::new("A", DeviceType::Desktop));
        let b = Endpoint::new(DeviceIdentity::new("B", DeviceType::Desktop));
        let (left, _right) = memory_pair(a, b);
        assert!(left.verification_key().is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_pending_read() {
        let (a, b) = endpoints();
        let (left, _right) = memory_pair(a, b);
        let left = Arc::new(left);

        let reader = {
            let left = left.clone();
            tokio::spawn(async move { left.read_packet().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        left.close().await.unwrap();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
        assert!(left.is_closed());
    }

    #[tokio::test]
    async fn test_write_after_close_is_cancelled() {
        let (a, b) = endpoints();
        let (left, _right) = memory_pair(a, b);

        left.close().await.unwrap();
        left.close().await.unwrap();

        let err = left
            .write_packet(&Packet::new("kdeconnect.ping", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_peer_close_is_transport_error() {
        let (a, b) = endpoints();
        let (left, right) = memory_pair(a, b);

        left.close().await.unwrap();
        drop(left);

        let err = right.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
    }

    #[tokio::test]
    async fn test_malformed_line_is_invalid_packet() {
        let (a_stream, b_stream) = tokio::io::duplex(1024);
        let (_a_read, mut a_write) = tokio::io::split(a_stream);
        let (b_read, b_write) = tokio::io::split(b_stream);
        let (a, b) = endpoints();
        let channel = StreamChannel::new(b, a, b_read, b_write, "test");

        a_write.write_all(b"{\"type\":\"x\"}\n").await.unwrap();
        a_write
            .write_all(b"{\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{}}\n")
            .await
            .unwrap();

        let err = channel.read_packet().await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPacket(_)));

        // The stream stays usable after a malformed line
        let packet = channel.read_packet().await.unwrap();
        assert_eq!(packet.packet_type, "kdeconnect.ping");
    }

    #[tokio::test]
    async fn test_payload_round_trip() {
        let (a, b) = endpoints();
        let (left, right) = memory_pair(a, b);
        let data = b"0123456789".repeat(1000);

        let mut packet = Packet::new("kdeconnect.share.request", json!({ "filename": "a.txt" }))
            .with_payload_size(data.len() as i64);
        let upload = left.upload(&mut packet).await.unwrap();
        assert!(packet.has_payload());
        left.write_packet(&packet).await.unwrap();

        let sender = {
            let data = data.clone();
            tokio::spawn(async move {
                let mut writer = upload.accept().await.unwrap();
                writer.write_all(&data).await.unwrap();
                // Trailing bytes beyond payloadSize are not delivered
                writer.write_all(b"extra").await.unwrap();
                writer.shutdown().await.unwrap();
            })
        };

        let announced = right.read_packet().await.unwrap();
        let mut reader = right.download(&announced).await.unwrap();
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        sender.await.unwrap();

        assert_eq!(received, data);

        // Each payload can be fetched once
        let err = right.download(&announced).await.err().expect("expected download error");
        assert!(matches!(err, ProtocolError::Transport(_)));
    }

    #[tokio::test]
    async fn test_download_requires_transfer_info() {
        let (a, b) = endpoints();
        let (_left, right) = memory_pair(a, b);

        let packet = Packet::new("kdeconnect.share.request", json!({})).with_payload_size(4);
        let err = right.download(&packet).await.err().expect("expected download error");
        assert!(matches!(err, ProtocolError::InvalidPacket(_)));
    }

    #[tokio::test]
    async fn test_payloads_unsupported_without_transport() {
        let (a_stream, _b_stream) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(a_stream);
        let (a, b) = endpoints();
        let channel = StreamChannel::new(a, b, read, write, "plain");

        let mut packet = Packet::new("kdeconnect.share.request", json!({}));
        let err = channel.upload(&mut packet).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
        assert!(packet.payload_transfer_info.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let (a, b) = endpoints();
        let (left, right) = memory_pair(a, b);
        let left = Arc::new(left);

        let mut tasks = Vec::new();
        for i in 0..10 {
            let left = left.clone();
            tasks.push(tokio::spawn(async move {
                let body = json!({ "seq": i, "data": "x".repeat(4096) });
                left.write_packet(&Packet::new("kdeconnect.mock.echo", body))
                    .await
            }));
        }

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..10 {
                let packet = right.read_packet().await.unwrap();
                seen.push(packet.body["seq"].as_i64().unwrap());
            }
            seen
        });

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seen = reader.await.unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }
}
