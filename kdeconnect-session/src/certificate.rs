//! Device Certificates
//!
//! Every device presents a self-signed certificate on its encrypted
//! channels. The certificate's Common Name is the device id, and the
//! verification key shown during pairing is derived from the certificates of
//! both ends.
//!
//! ## Certificate Layout
//!
//! - **Algorithm**: RSA 2048-bit, signed with SHA-256
//! - **Organization (O)**: "KDE"
//! - **Organizational Unit (OU)**: "Kde connect"
//! - **Common Name (CN)**: device id
//! - **Validity**: 10 years
//!
//! Certificates are stored as PEM next to each other in one directory, see
//! [`CertificateInfo::load_or_generate`].

use crate::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// File name of the PEM certificate inside the certificate directory
pub const CERTIFICATE_FILE_NAME: &str = "certificate.pem";

/// File name of the PEM private key inside the certificate directory
pub const PRIVATE_KEY_FILE_NAME: &str = "private.pem";

const CERT_VALIDITY_DAYS: u32 = 10 * 365;
const CERT_ORG: &str = "KDE";
const CERT_ORG_UNIT: &str = "Kde connect";

/// A device certificate with its private key
#[derive(Clone)]
pub struct CertificateInfo {
    /// Common Name of the certificate
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// DER-encoded private key
    pub private_key: Vec<u8>,

    /// SHA-256 fingerprint of the certificate, as `AB:CD:...`
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for `device_id`
    ///
    /// # Examples
    ///
    /// ```
    /// use kdeconnect_session::CertificateInfo;
    ///
    /// let info = CertificateInfo::generate("27456e3cfe5c420896a7c0caeec5e5a0").unwrap();
    /// assert_eq!(info.device_id, "27456e3cfe5c420896a7c0caeec5e5a0");
    /// assert_eq!(info.fingerprint.len(), 95);
    /// ```
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(2048)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("OU", CERT_ORG_UNIT)?;
        name.append_entry_by_text("CN", &device_id)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;
        builder.sign(&pkey, MessageDigest::sha256())?;

        let certificate = builder.build().to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Generated certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// SHA-256 fingerprint of a DER certificate as colon-separated hex bytes
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        Sha256::digest(cert_der)
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Common Name of a DER certificate
    pub fn common_name(cert_der: &[u8]) -> Result<String> {
        let cert = X509::from_der(cert_der)?;
        common_name(&cert)
    }

    /// Save certificate and private key as PEM files
    pub fn save_to_files(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)?;
        }

        let cert = X509::from_der(&self.certificate)?;
        fs::write(cert_path, cert.to_pem()?)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        fs::write(key_path, pkey.private_key_to_pem_pkcs8()?)?;

        info!(
            "Saved certificate to {:?} and private key to {:?}",
            cert_path, key_path
        );
        Ok(())
    }

    /// Load certificate and private key from PEM files
    pub fn load_from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        debug!("Loading certificate from {:?}", cert_path);

        let cert = X509::from_pem(&fs::read(cert_path)?)?;
        let pkey = PKey::private_key_from_pem(&fs::read(key_path)?)?;

        if !cert.public_key()?.public_eq(&pkey) {
            return Err(ProtocolError::CertificateValidation(format!(
                "private key {:?} does not match certificate {:?}",
                key_path, cert_path
            )));
        }

        let device_id = common_name(&cert)?;
        let certificate = cert.to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!(
            "Loaded certificate for device {} with fingerprint: {}",
            device_id, fingerprint
        );

        Ok(Self {
            device_id,
            certificate,
            private_key: pkey.private_key_to_der()?,
            fingerprint,
        })
    }

    /// Load the certificate for `device_id` from `dir`, generating it if needed
    ///
    /// A stored certificate that is unreadable or names another device is
    /// replaced.
    pub fn load_or_generate(device_id: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CERTIFICATE_FILE_NAME);
        let key_path = dir.join(PRIVATE_KEY_FILE_NAME);

        if cert_path.exists() && key_path.exists() {
            match Self::load_from_files(&cert_path, &key_path) {
                Ok(info) if info.device_id == device_id => return Ok(info),
                Ok(info) => warn!(
                    "Stored certificate belongs to {}, generating one for {}",
                    info.device_id, device_id
                ),
                Err(e) => warn!("Failed to load certificate from {:?}: {}", dir, e),
            }
        }

        let info = Self::generate(device_id)?;
        info.save_to_files(&cert_path, &key_path)?;
        Ok(info)
    }
}

impl std::fmt::Debug for CertificateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateInfo")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn common_name(cert: &X509) -> Result<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .ok_or_else(|| {
            ProtocolError::CertificateValidation(
                "certificate does not contain a Common Name".to_string(),
            )
        })
        .and_then(|entry| Ok(entry.data().as_utf8()?.to_string()))
}
