//! Certificate authority operations for the autoTls backend
//!
//! The CA key pair lives in a Kubernetes Secret; every publish loads it,
//! generates a fresh leaf key pair locally and signs a short-lived
//! certificate for the workload's addresses. Leaf keys are never stored
//! anywhere but the workload's tmpfs.

use std::net::IpAddr;
use std::time::Duration;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;

/// Validity of a generated CA
pub const CA_LIFETIME: Duration = Duration::from_secs(2 * 365 * 24 * 60 * 60);

/// How far issued certificates are backdated to absorb clock skew
pub const BACKDATE: Duration = Duration::from_secs(5 * 60);

/// Organization written into every subject
const ORGANIZATION: &str = "secret-csi";

/// Friendly name of the key entry in PKCS#12 bundles
pub const PKCS12_ALIAS: &str = "tls";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Stored material could not be parsed
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Requested SAN is not representable
    #[error("invalid subject alternative name {0:?}")]
    InvalidSan(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// `notAfter` of a PEM certificate as epoch seconds
pub fn not_after_epoch(cert_pem: &str) -> Result<i64> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    Ok(cert.validity().not_after.timestamp())
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

fn offset(d: Duration) -> ::time::Duration {
    ::time::Duration::seconds(i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// What to put into a leaf certificate
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafRequest {
    /// Subject common name
    pub common_name: String,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// IP SANs
    pub ips: Vec<IpAddr>,
    /// Requested validity, measured from now
    pub lifetime: Duration,
}

/// A signed leaf certificate and its private key
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    /// PEM certificate
    pub cert_pem: String,
    /// PEM PKCS#8 private key
    pub key_pem: String,
    /// Epoch seconds after which the certificate is invalid
    pub not_after: i64,
}

impl IssuedCertificate {
    /// Package key, certificate and CA certificate into a PKCS#12 bundle
    ///
    /// The key bag and the certificate bags are encrypted with `password`,
    /// which may be empty.
    pub fn to_pkcs12(&self, ca_cert_pem: &str, password: &str) -> Result<Vec<u8>> {
        let cert = parse_pem(&self.cert_pem)?;
        let key = parse_pem(&self.key_pem)?;
        let ca = parse_pem(ca_cert_pem)?;

        let pfx = p12::PFX::new(&cert, &key, Some(&ca), password, PKCS12_ALIAS).ok_or_else(|| {
            PkiError::CertificateGenerationFailed("failed to build PKCS#12 bundle".to_string())
        })?;
        Ok(pfx.to_der())
    }
}

/// Certificate Authority signing workload certificates
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate, distributed as `ca.crt`
    ca_cert_pem: String,
    /// CA `notAfter`; leaves never outlive it
    not_after: i64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - offset(BACKDATE);
        params.not_after = now + offset(CA_LIFETIME);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
            not_after: params.not_after.unix_timestamp(),
        })
    }

    /// Load a CA from stored PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let not_after = not_after_epoch(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
            not_after,
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format, for storing back into the Secret
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// CA expiry as epoch seconds
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Generate a key pair and sign a leaf certificate for it
    ///
    /// Validity starts [`BACKDATE`] before now and ends after the requested
    /// lifetime or at the CA's own expiry, whichever comes first.
    pub fn issue(&self, request: &LeafRequest) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(&request.common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let mut sans = Vec::with_capacity(request.dns_names.len() + request.ips.len());
        for name in &request.dns_names {
            let dns = Ia5String::try_from(name.as_str())
                .map_err(|_| PkiError::InvalidSan(name.clone()))?;
            sans.push(SanType::DnsName(dns));
        }
        sans.extend(request.ips.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        let now = OffsetDateTime::now_utc();
        let ca_not_after = OffsetDateTime::from_unix_timestamp(self.not_after)
            .map_err(|e| PkiError::ParseError(format!("CA expiry out of range: {}", e)))?;
        params.not_before = now - offset(BACKDATE);
        params.not_after = now
            .checked_add(offset(request.lifetime))
            .map_or(ca_not_after, |t| t.min(ca_not_after));

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            not_after: params.not_after.unix_timestamp(),
        })
    }
}
