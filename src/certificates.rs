//! X.509 certificate primitives: generation, validation and persistence
//! of the agent's ECDSA P-384 trust material.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P384_SHA384,
};
use time::{Duration, OffsetDateTime};

const CA_COMMON_NAME: &str = "Compute Blade Agent Root CA";
const CA_ORGANIZATION: &str = "Compute Blade CA";
const CA_VALIDITY_DAYS: i64 = 10 * 365;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Key usage of a generated leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    Client,
    Server,
}

/// A PEM-encoded certificate plus its private key.
#[derive(Debug, Clone)]
pub struct PemPair {
    pub cert: String,
    pub key: String,
}

/// Generates the self-signed root CA.
pub fn generate_ca() -> Result<PemPair> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
        .map_err(|e| anyhow!("failed to generate CA key: {e}"))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key)
        .map_err(|e| anyhow!("failed to create CA certificate: {e}"))?;

    Ok(PemPair {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

/// Generates a leaf certificate signed by the given CA.
///
/// `subject_alt_names` accepts DNS names and textual IP addresses; the
/// appropriate SAN type is derived from each entry.
pub fn generate_leaf(
    common_name: &str,
    usage: CertUsage,
    subject_alt_names: Vec<String>,
    ca: &PemPair,
) -> Result<PemPair> {
    let ca_key = KeyPair::from_pem(&ca.key)
        .map_err(|e| anyhow!("failed to parse CA private key: {e}"))?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert)
        .map_err(|e| anyhow!("failed to parse CA certificate: {e}"))?;
    let ca_cert: Certificate = ca_params
        .self_signed(&ca_key)
        .map_err(|e| anyhow!("failed to rebuild CA issuer: {e}"))?;

    let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
        .map_err(|e| anyhow!("failed to generate certificate key: {e}"))?;

    let mut params = CertificateParams::new(subject_alt_names)
        .map_err(|e| anyhow!("invalid subject alternative names: {e}"))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![match usage {
        CertUsage::Client => ExtendedKeyUsagePurpose::ClientAuth,
        CertUsage::Server => ExtendedKeyUsagePurpose::ServerAuth,
    }];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);

    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| anyhow!("failed to sign certificate: {e}"))?;

    Ok(PemPair {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

/// Validates that a PEM certificate parses and that its public key
/// matches the given private key. A mismatch on material that exists on
/// disk is fatal; it is never silently regenerated.
pub fn validate_keypair(cert_pem: &str, key_pem: &str) -> Result<()> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).map_err(|_| {
        anyhow!(
            "failed to decode certificate; verify it with: \
             openssl x509 -in <certificate.pem> -text -noout"
        )
    })?;
    let cert = pem.parse_x509().map_err(|_| {
        anyhow!(
            "failed to parse certificate; verify it with: \
             openssl x509 -in <certificate.pem> -text -noout"
        )
    })?;

    let key = KeyPair::from_pem(key_pem).map_err(|_| {
        anyhow!(
            "failed to parse private key; verify it with: \
             openssl pkey -in <keyfile.pem> -check"
        )
    })?;

    if cert.tbs_certificate.subject_pki.raw != key.public_key_der().as_slice() {
        bail!(
            "private key does not match certificate; verify the pair belongs together \
             before replacing either file"
        );
    }

    Ok(())
}

/// Loads a certificate/key pair from disk and validates it.
pub fn load_and_validate(cert_path: &Path, key_path: &Path) -> Result<PemPair> {
    let cert = fs::read_to_string(cert_path).with_context(|| {
        format!(
            "failed to read certificate; ensure {} exists and is readable by the agent user",
            cert_path.display()
        )
    })?;
    let key = fs::read_to_string(key_path).with_context(|| {
        format!(
            "failed to read private key; ensure {} exists and is readable by the agent user",
            key_path.display()
        )
    })?;

    validate_keypair(&cert, &key)?;
    Ok(PemPair { cert, key })
}

/// Writes a certificate/key pair to disk with mode 0600.
pub fn write_pair(cert_path: &Path, key_path: &Path, pair: &PemPair) -> Result<()> {
    write_private(cert_path, pair.cert.as_bytes())?;
    write_private(key_path, pair.key.as_bytes())?;
    Ok(())
}

/// Writes a file and restricts it to owner read/write.
pub fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    set_permission_0600(path)
}

#[cfg(unix)]
fn set_permission_0600(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_permission_0600(_path: &Path) -> Result<()> {
    Ok(())
}
