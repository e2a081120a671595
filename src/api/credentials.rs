//! Credential lifecycle: on startup the agent guarantees a coherent
//! trust triple (CA, server certificate, operator client bundle).
//!
//! Existing material is validated and reused; inconsistent material is a
//! fatal error and never silently regenerated.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::info;
use serde::{Deserialize, Serialize};

use crate::certificates::{
    generate_ca, generate_leaf, load_and_validate, validate_keypair, write_pair, write_private,
    CertUsage, PemPair,
};
use crate::config::ListenMode;

const DEFAULT_CERT_DIR: &str = "/etc/bladed";

/// Server identity plus the CA used to verify clients.
#[derive(Debug, Clone)]
pub struct ServerTlsMaterial {
    pub identity: PemPair,
    pub ca_cert: String,
}

/// Operator client configuration document consumed by bladectl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BladectlConfig {
    pub blades: Vec<NamedBlade>,
    #[serde(rename = "current-blade")]
    pub current_blade: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBlade {
    pub name: String,
    pub blade: Blade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blade {
    pub server: String,
    #[serde(rename = "cert", default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateData>,
}

/// Base64-encoded PEM material embedded in the client config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateData {
    #[serde(rename = "certificate-authority-data")]
    pub certificate_authority_data: String,
    #[serde(rename = "client-certificate-data")]
    pub client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    pub client_key_data: String,
}

impl BladectlConfig {
    /// Finds a blade by name; an empty name selects `current-blade`.
    pub fn find_blade(&self, name: &str) -> Result<&Blade> {
        let wanted = if name.is_empty() {
            &self.current_blade
        } else {
            name
        };

        self.blades
            .iter()
            .find(|blade| blade.name == wanted)
            .map(|named| &named.blade)
            .ok_or_else(|| {
                anyhow!(
                    "blade '{wanted}' not found in configuration; ensure current-blade \
                     names an entry in the blades list"
                )
            })
    }
}

/// Manages the on-disk trust material for the agent and its operator.
pub struct CredentialManager {
    cert_dir: PathBuf,
    bladectl_config_dir: PathBuf,
}

impl CredentialManager {
    /// Production locations: `/etc/bladed` and `~/.config/bladectl`.
    pub fn new() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("HOME is not set; cannot locate the bladectl config directory")?;

        Ok(Self {
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            bladectl_config_dir: home.join(".config").join("bladectl"),
        })
    }

    /// Custom locations, used by tests.
    pub fn with_dirs(cert_dir: PathBuf, bladectl_config_dir: PathBuf) -> Self {
        Self {
            cert_dir,
            bladectl_config_dir,
        }
    }

    fn ca_path(&self) -> PathBuf {
        self.cert_dir.join("ca.pem")
    }

    fn ca_key_path(&self) -> PathBuf {
        self.cert_dir.join("ca-key.pem")
    }

    fn server_cert_path(&self) -> PathBuf {
        self.cert_dir.join("server.pem")
    }

    fn server_key_path(&self) -> PathBuf {
        self.cert_dir.join("server-key.pem")
    }

    fn bladectl_config_path(&self) -> PathBuf {
        self.bladectl_config_dir.join("config.yaml")
    }

    /// Ensures a valid CA and server certificate exist, generating any
    /// missing piece. Existing-but-inconsistent material is fatal.
    pub fn ensure_server_certificate(&self) -> Result<ServerTlsMaterial> {
        let all_present = self.ca_path().exists()
            && self.ca_key_path().exists()
            && self.server_cert_path().exists()
            && self.server_key_path().exists();

        if all_present {
            load_and_validate(&self.ca_path(), &self.ca_key_path())?;
            let identity = load_and_validate(&self.server_cert_path(), &self.server_key_path())?;
            let ca_cert = fs::read_to_string(self.ca_path())
                .context("failed to re-read CA certificate")?;
            return Ok(ServerTlsMaterial { identity, ca_cert });
        }

        let ca = self.ensure_ca()?;

        info!("Generating new server certificate");
        let identity = generate_leaf(
            "Compute Blade Agent",
            CertUsage::Server,
            server_alt_names()?,
            &ca,
        )?;
        write_pair(&self.server_cert_path(), &self.server_key_path(), &identity)?;
        info!(
            "Generated new server certificate at {}",
            self.server_cert_path().display()
        );

        Ok(ServerTlsMaterial {
            identity,
            ca_cert: ca.cert,
        })
    }

    /// Reuses a valid on-disk CA or generates a fresh one.
    fn ensure_ca(&self) -> Result<PemPair> {
        if self.ca_path().exists() && self.ca_key_path().exists() {
            return load_and_validate(&self.ca_path(), &self.ca_key_path());
        }

        info!("Generating new agent root CA");
        let ca = generate_ca()?;

        ensure_private_dir(&self.cert_dir)?;
        write_pair(&self.ca_path(), &self.ca_key_path(), &ca)?;

        Ok(ca)
    }

    /// Generates a client certificate signed by the on-disk CA. Returns
    /// the CA certificate PEM alongside the new pair.
    pub fn generate_client_cert(&self, common_name: &str) -> Result<(String, PemPair)> {
        let ca = load_and_validate(&self.ca_path(), &self.ca_key_path())
            .context("no valid CA found to sign the client certificate")?;

        let pair = generate_leaf(common_name, CertUsage::Client, Vec::new(), &ca)?;
        Ok((ca.cert, pair))
    }

    /// Guarantees a usable operator config.
    ///
    /// An existing document is validated (embedded client pair must
    /// match) and kept; otherwise a fresh client certificate and config
    /// are materialised. With authentication disabled the same document
    /// shape is written without certificate data.
    pub fn ensure_bladectl_config(
        &self,
        server_addr: &str,
        mode: ListenMode,
        authenticated: bool,
    ) -> Result<()> {
        ensure_config_dir(&self.bladectl_config_dir)?;
        let config_path = self.bladectl_config_path();

        if config_path.exists() {
            if !authenticated {
                return Ok(());
            }
            return self.validate_existing_bladectl_config(&config_path);
        }

        let server = client_facing_address(server_addr, mode)?;
        let hostname = local_hostname()?;

        let certificate = if authenticated {
            info!("Generating new operator client certificate");
            let (ca_cert, pair) = self.generate_client_cert("localhost")?;
            Some(CertificateData {
                certificate_authority_data: BASE64.encode(ca_cert.as_bytes()),
                client_certificate_data: BASE64.encode(pair.cert.as_bytes()),
                client_key_data: BASE64.encode(pair.key.as_bytes()),
            })
        } else {
            None
        };

        let config = BladectlConfig {
            blades: vec![NamedBlade {
                name: hostname.clone(),
                blade: Blade {
                    server: server.clone(),
                    certificate,
                },
            }],
            current_blade: hostname,
        };

        let document =
            serde_yaml::to_string(&config).context("failed to serialise bladectl config")?;
        write_private(&config_path, document.as_bytes())?;

        info!(
            "Generated new bladectl config at {} (server {server}, authenticated: {authenticated})",
            config_path.display()
        );
        Ok(())
    }

    fn validate_existing_bladectl_config(&self, config_path: &Path) -> Result<()> {
        let content = fs::read_to_string(config_path).with_context(|| {
            format!(
                "failed to read bladectl config; ensure {} is readable by the agent user",
                config_path.display()
            )
        })?;

        let config: BladectlConfig = serde_yaml::from_str(&content)
            .context("failed to parse bladectl config; ensure it is valid YAML")?;

        let blade = config.find_blade("")?;
        let certificate = blade.certificate.as_ref().ok_or_else(|| {
            anyhow!(
                "bladectl config at {} carries no certificate data although \
                 authentication is enabled; remove the file to regenerate it",
                config_path.display()
            )
        })?;

        let cert_pem = BASE64
            .decode(&certificate.client_certificate_data)
            .context("failed to decode client certificate data")?;
        let key_pem = BASE64
            .decode(&certificate.client_key_data)
            .context("failed to decode client key data")?;

        validate_keypair(
            std::str::from_utf8(&cert_pem).context("client certificate data is not UTF-8")?,
            std::str::from_utf8(&key_pem).context("client key data is not UTF-8")?,
        )
    }
}

/// SAN material for the server certificate: localhost, the hostname and
/// its `.local` alias, plus every non-loopback non-link-local interface
/// address at generation time.
fn server_alt_names() -> Result<Vec<String>> {
    let hostname = local_hostname()?;
    let mut names = vec![
        "localhost".to_string(),
        hostname.clone(),
        format!("{hostname}.local"),
    ];

    for iface in if_addrs::get_if_addrs().context("failed to enumerate network interfaces")? {
        let ip = iface.ip();
        if ip.is_loopback() || ip.is_unspecified() || is_link_local(ip) {
            continue;
        }
        names.push(ip.to_string());
    }

    Ok(names)
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn local_hostname() -> Result<String> {
    let hostname = hostname::get().context("failed to read hostname")?;
    Ok(hostname.to_string_lossy().into_owned())
}

/// The address bladectl should dial: unix paths pass through, tcp
/// rewrites the host part to localhost.
fn client_facing_address(server_addr: &str, mode: ListenMode) -> Result<String> {
    match mode {
        ListenMode::Unix => Ok(server_addr.to_string()),
        ListenMode::Tcp => {
            let (_, port) = server_addr.rsplit_once(':').with_context(|| {
                format!("failed to extract port from gRPC address '{server_addr}'")
            })?;
            Ok(format!("localhost:{port}"))
        }
    }
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    create_dir_with_mode(dir, 0o700)
}

fn ensure_config_dir(dir: &Path) -> Result<()> {
    create_dir_with_mode(dir, 0o700)
}

#[cfg(unix)]
fn create_dir_with_mode(dir: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .with_context(|| {
            format!(
                "failed to create directory {}; ensure the parent is writable by the agent user",
                dir.display()
            )
        })
}

#[cfg(not(unix))]
fn create_dir_with_mode(dir: &Path, _mode: u32) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))
}
