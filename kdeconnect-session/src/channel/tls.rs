//! TLS Configuration
//!
//! Both ends of a channel present their self-signed device certificate.
//! Certificates are not checked against a CA: trust is established by
//! pairing, and the certificates feed the verification key.
//!
//! Uses OpenSSL directly to stay compatible with TLS 1.0 peers such as
//! older Android releases.

use crate::{CertificateInfo, ProtocolError, Result};
use openssl::pkey::PKey;
use openssl::ssl::{
    Ssl, SslAcceptor, SslConnector, SslContext, SslContextBuilder, SslMethod, SslVerifyMode,
    SslVersion,
};
use openssl::x509::X509;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;
use tracing::debug;

/// Cipher suites accepted by KDE Connect peers
///
/// `@SECLEVEL=1` keeps TLS 1.0 and `ECDHE-RSA-AES128-SHA` usable.
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// Which side of the TLS handshake we take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// TLS contexts for one local certificate
pub struct TlsConfig {
    certificate: Vec<u8>,
    client: SslContext,
    server: SslContext,
}

impl TlsConfig {
    /// Build client and server contexts presenting `certificate`
    pub fn new(certificate: &CertificateInfo) -> Result<Self> {
        let cert = X509::from_der(&certificate.certificate)?;
        let pkey = PKey::private_key_from_der(&certificate.private_key)?;

        let mut server = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        configure(&mut server, &cert, &pkey)?;

        let mut client = SslConnector::builder(SslMethod::tls_client())?;
        configure(&mut client, &cert, &pkey)?;

        debug!("Created TLS contexts for {}", certificate.device_id);

        Ok(Self {
            certificate: certificate.certificate.clone(),
            client: client.build().into_context(),
            server: server.build().into_context(),
        })
    }

    /// DER certificate presented to peers
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// Run the handshake over `stream` in `role`
    ///
    /// Returns the encrypted stream and the DER certificate the peer
    /// presented.
    pub async fn handshake<S>(&self, stream: S, role: TlsRole) -> Result<(SslStream<S>, Vec<u8>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let context = match role {
            TlsRole::Client => &self.client,
            TlsRole::Server => &self.server,
        };

        let ssl = Ssl::new(context)?;
        let mut tls_stream = SslStream::new(ssl, stream)?;

        match role {
            TlsRole::Client => Pin::new(&mut tls_stream).connect().await?,
            TlsRole::Server => Pin::new(&mut tls_stream).accept().await?,
        }

        let peer_certificate = tls_stream
            .ssl()
            .peer_certificate()
            .ok_or_else(|| {
                ProtocolError::CertificateValidation("peer sent no certificate".to_string())
            })?
            .to_der()?;

        debug!(
            "TLS handshake complete as {:?} using {}",
            role,
            tls_stream.ssl().version_str()
        );
        Ok((tls_stream, peer_certificate))
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field(
                "fingerprint",
                &CertificateInfo::calculate_fingerprint(&self.certificate),
            )
            .finish_non_exhaustive()
    }
}

fn configure(builder: &mut SslContextBuilder, cert: &X509, pkey: &PKey<openssl::pkey::Private>) -> Result<()> {
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    // Self-signed certificates are accepted here and compared after pairing,
    // but the peer must present one
    builder.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        |_, _| true,
    );

    builder.set_certificate(cert)?;
    builder.set_private_key(pkey)?;
    builder.check_private_key()?;
    Ok(())
}
