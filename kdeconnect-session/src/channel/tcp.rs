//! TCP Channel Service
//!
//! Accepts and opens TCP connections, exchanges identities and then
//! encrypts the stream:
//!
//! 1. Each side writes its `kdeconnect.identity` packet in plain text
//! 2. Each side reads the peer's identity packet within the handshake timeout
//! 3. The stream is upgraded to TLS. The side that accepted the TCP
//!    connection is the TLS client
//! 4. The peer certificate must name the announced device id
//! 5. The stream becomes a [`StreamChannel`] and is pushed to the manager
//!
//! Targets use the `tcp://host:port` form. There is no broadcast discovery;
//! `identify(None)` has nothing to reach.
//!
//! ## Payloads
//!
//! Uploads listen on the first free port in
//! [`PAYLOAD_PORT_MIN`]..=[`PAYLOAD_PORT_MAX`] and announce it as
//! `payloadTransferInfo: {"port": n}`. The downloader connects and is the
//! TLS client. Both ends must present the certificates of the channel.

use super::stream::{PayloadTransport, StreamChannel};
use super::tls::{TlsConfig, TlsRole};
use super::{limit_payload, Channel, ChannelSender, ChannelService, Endpoint};
use super::{PayloadReader, PayloadUpload, PayloadWriter};
use crate::packet::MAX_PACKET_SIZE;
use crate::{CertificateInfo, DeviceIdentity, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

/// URI scheme of this service
pub const TCP_SCHEME: &str = "tcp";

/// Default port for incoming connections
pub const DEFAULT_TCP_PORT: u16 = 1716;

/// Default timeout for connecting and for the identity exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// First port tried for payload uploads
pub const PAYLOAD_PORT_MIN: u16 = 1739;

/// Last port tried for payload uploads
pub const PAYLOAD_PORT_MAX: u16 = 1764;

#[derive(Default)]
struct ServiceState {
    channels: Option<ChannelSender>,
    listener: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// Channel service over TLS-encrypted TCP
pub struct TcpChannelService {
    handshake: Handshake,
    listen_addr: SocketAddr,
    state: Mutex<ServiceState>,
}

impl TcpChannelService {
    /// Create a service announcing `identity` and listening on `listen_addr`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Configuration`] if `certificate` was issued
    /// for another device id, and a certificate error if OpenSSL rejects it.
    pub fn new(
        identity: DeviceIdentity,
        certificate: &CertificateInfo,
        listen_addr: SocketAddr,
    ) -> Result<Self> {
        if certificate.device_id != identity.device_id {
            return Err(ProtocolError::Configuration(format!(
                "certificate is for {}, identity is {}",
                certificate.device_id, identity.device_id
            )));
        }

        let tls = Arc::new(TlsConfig::new(certificate)?);
        let local = Endpoint::new(identity).with_certificate(tls.certificate().to_vec());

        Ok(Self {
            handshake: Handshake {
                local,
                tls,
                timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            },
            listen_addr,
            state: Mutex::new(ServiceState::default()),
        })
    }

    /// Builder pattern: set the connect and handshake timeout
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake.timeout = handshake_timeout;
        self
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().local_addr
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self) -> Result<ChannelSender> {
        self.lock_state().channels.clone().ok_or_else(|| {
            ProtocolError::Configuration("TCP channel service is not started".to_string())
        })
    }

    /// Connect to `addr` and run the identity exchange and TLS handshake
    pub async fn connect(&self, addr: &str) -> Result<StreamChannel> {
        debug!("Connecting to {}", addr);

        let stream = timeout(self.handshake.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting"))?;

        // We opened the connection, so we are the TLS server
        self.handshake.run(stream, TlsRole::Server).await
    }
}

/// Parse `tcp://host:port` into `host:port`
///
/// A missing port falls back to [`DEFAULT_TCP_PORT`].
pub fn parse_tcp_uri(uri: &str) -> Result<String> {
    let authority = uri
        .strip_prefix("tcp://")
        .ok_or_else(|| ProtocolError::Configuration(format!("not a tcp:// URI: {}", uri)))?
        .trim_end_matches('/');

    if authority.is_empty() {
        return Err(ProtocolError::Configuration(format!(
            "missing host in URI: {}",
            uri
        )));
    }

    let has_port = match authority.rsplit_once(':') {
        Some((host, port)) => !host.ends_with(':') && port.parse::<u16>().is_ok(),
        None => false,
    };

    if has_port {
        Ok(authority.to_string())
    } else {
        Ok(format!("{}:{}", authority, DEFAULT_TCP_PORT))
    }
}

/// Everything needed to turn a fresh TCP stream into a channel
#[derive(Clone)]
struct Handshake {
    local: Endpoint,
    tls: Arc<TlsConfig>,
    timeout: Duration,
}

impl Handshake {
    async fn run(&self, mut stream: TcpStream, role: TlsRole) -> Result<StreamChannel> {
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| ProtocolError::from_io_error(e, "reading peer address"))?;
        let local_addr = stream
            .local_addr()
            .map_err(|e| ProtocolError::from_io_error(e, "reading local address"))?;

        let identity = self.local.identity.to_packet().to_bytes()?;
        stream
            .write_all(&identity)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "sending identity"))?;

        let packet = timeout(self.timeout, read_identity(&mut stream))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("identity from {}", remote_addr)))??;
        let peer_identity = DeviceIdentity::from_packet(&packet)?;

        debug!(
            "Starting TLS handshake as {:?} with {}",
            role, remote_addr
        );
        let (tls_stream, peer_certificate) = timeout(self.timeout, self.tls.handshake(stream, role))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {}", remote_addr)))??;

        let common_name = CertificateInfo::common_name(&peer_certificate)?;
        if common_name != peer_identity.device_id {
            return Err(ProtocolError::CertificateValidation(format!(
                "{} announced {} but its certificate names {}",
                remote_addr, peer_identity.device_id, common_name
            )));
        }

        info!(
            "Identified {} ({}) at {}, fingerprint {}",
            peer_identity.device_name,
            peer_identity.device_id,
            remote_addr,
            CertificateInfo::calculate_fingerprint(&peer_certificate)
        );

        let payloads = TlsPayloads {
            tls: self.tls.clone(),
            local_ip: local_addr.ip(),
            peer_ip: remote_addr.ip(),
            peer_certificate: peer_certificate.clone(),
            timeout: self.timeout,
        };

        let (reader, writer) = tokio::io::split(tls_stream);
        Ok(StreamChannel::new(
            self.local.clone(),
            Endpoint::new(peer_identity).with_certificate(peer_certificate),
            reader,
            writer,
            format!("tcp://{}", remote_addr),
        )
        .with_payloads(Arc::new(payloads)))
    }
}

/// Read the plain-text identity line one byte at a time
///
/// Nothing past the newline is consumed, so the TLS handshake that follows
/// sees every byte the peer sent.
async fn read_identity(stream: &mut TcpStream) -> Result<Packet> {
    let mut line = Vec::new();

    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "reading identity"))?;
        line.push(byte);

        if byte == b'\n' {
            break;
        }
        if line.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), MAX_PACKET_SIZE));
        }
    }

    Packet::from_bytes(&line)
}

/// Payload streams on side TCP connections, encrypted like the channel
struct TlsPayloads {
    tls: Arc<TlsConfig>,
    local_ip: IpAddr,
    peer_ip: IpAddr,
    peer_certificate: Vec<u8>,
    timeout: Duration,
}

async fn encrypt_payload(
    tls: &TlsConfig,
    peer_certificate: &[u8],
    handshake_timeout: Duration,
    stream: TcpStream,
    role: TlsRole,
) -> Result<SslStream<TcpStream>> {
    let (stream, certificate) = timeout(handshake_timeout, tls.handshake(stream, role))
        .await
        .map_err(|_| ProtocolError::Timeout("payload TLS handshake".to_string()))??;

    if certificate != peer_certificate {
        return Err(ProtocolError::CertificateValidation(
            "payload peer certificate does not match the channel".to_string(),
        ));
    }
    Ok(stream)
}

/// Bind the first free port of the payload range on `ip`
async fn bind_payload_listener(ip: IpAddr) -> Result<TcpListener> {
    for port in PAYLOAD_PORT_MIN..=PAYLOAD_PORT_MAX {
        match TcpListener::bind((ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
            Err(e) => return Err(ProtocolError::from_io_error(e, "binding payload port")),
        }
    }

    Err(ProtocolError::ResourceExhausted(format!(
        "no free payload port in {}-{}",
        PAYLOAD_PORT_MIN, PAYLOAD_PORT_MAX
    )))
}

#[async_trait]
impl PayloadTransport for TlsPayloads {
    async fn download(&self, packet: &Packet) -> Result<PayloadReader> {
        let port = packet
            .payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                ProtocolError::InvalidPacket(
                    "expected \"port\" field holding a uint16".to_string(),
                )
            })?;

        let addr = SocketAddr::new(self.peer_ip, port);
        debug!("Downloading payload from {}", addr);

        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "connecting for payload"))?;

        // The downloader is the TLS client
        let stream = encrypt_payload(
            &self.tls,
            &self.peer_certificate,
            self.timeout,
            stream,
            TlsRole::Client,
        )
        .await?;
        Ok(limit_payload(stream, packet))
    }

    async fn upload(&self, packet: &mut Packet) -> Result<PayloadUpload> {
        let listener = bind_payload_listener(self.local_ip).await?;
        let port = listener
            .local_addr()
            .map_err(|e| ProtocolError::from_io_error(e, "reading payload port"))?
            .port();

        let mut info = Map::new();
        info.insert("port".to_string(), json!(port));
        packet.payload_transfer_info = Some(info);

        debug!("Waiting for payload connection on port {}", port);

        let tls = self.tls.clone();
        let peer_certificate = self.peer_certificate.clone();
        let handshake_timeout = self.timeout;

        Ok(PayloadUpload::new(async move {
            let (stream, remote_addr) = listener
                .accept()
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "accepting payload connection"))?;
            drop(listener);
            debug!("Payload connection from {}", remote_addr);

            let stream = encrypt_payload(
                &tls,
                &peer_certificate,
                handshake_timeout,
                stream,
                TlsRole::Server,
            )
            .await?;
            let writer: PayloadWriter = Box::new(stream);
            Ok(writer)
        }))
    }
}

async fn accept_loop(listener: TcpListener, handshake: Handshake, channels: ChannelSender) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TCP connection: {}", e);
                continue;
            }
        };

        debug!("Incoming TCP connection from {}", remote_addr);

        let handshake = handshake.clone();
        let channels = channels.clone();
        tokio::spawn(async move {
            // We accepted the connection, so we are the TLS client
            match handshake.run(stream, TlsRole::Client).await {
                Ok(channel) => {
                    let channel: Arc<dyn Channel> = Arc::new(channel);
                    if channels.send(channel).is_err() {
                        debug!("Dropping channel from {}: manager stopped", remote_addr);
                    }
                }
                Err(e) => warn!("Handshake with {} failed: {}", remote_addr, e),
            }
        });
    }
}

#[async_trait]
impl ChannelService for TcpChannelService {
    fn scheme(&self) -> &str {
        TCP_SCHEME
    }

    async fn start(&self, channels: ChannelSender) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "binding TCP listener"))?;
        let local_addr = listener.local_addr()?;

        info!("TCP channel service listening on {}", local_addr);

        let task = tokio::spawn(accept_loop(
            listener,
            self.handshake.clone(),
            channels.clone(),
        ));

        let mut state = self.lock_state();
        if let Some(previous) = state.listener.replace(task) {
            previous.abort();
        }
        state.channels = Some(channels);
        state.local_addr = Some(local_addr);
        Ok(())
    }

    async fn identify(&self, target: Option<&str>) -> Result<()> {
        let Some(target) = target else {
            debug!("TCP channel service has no broadcast discovery");
            return Ok(());
        };

        let addr = parse_tcp_uri(target)?;
        let channels = self.sender()?;
        let channel = self.connect(&addr).await?;

        let channel: Arc<dyn Channel> = Arc::new(channel);
        channels
            .send(channel)
            .map_err(|_| ProtocolError::Cancelled("device manager stopped".to_string()))
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(task) = state.listener.take() {
            task.abort();
            info!("TCP channel service stopped");
        }
        state.channels = None;
        state.local_addr = None;
        Ok(())
    }
}
