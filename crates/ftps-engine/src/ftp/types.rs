//! Shared types for the FTP engine.

use crate::ftp::error::{FtpError, FtpResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

// ─── Connection / Session ────────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum EncryptionMode {
    /// Plain-text FTP (port 21).
    #[default]
    None,
    /// Implicit FTPS, TLS from the first byte (port 990).
    Implicit,
    /// Explicit FTPS, starts plain then upgrades via AUTH TLS (port 21).
    Explicit,
    /// Try AUTH TLS, carry on in plaintext when the server refuses it.
    Auto,
}

impl EncryptionMode {
    /// Port used when the configured port is 0.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Implicit => 990,
            _ => 21,
        }
    }

    /// Whether the mode ever attempts TLS.
    pub fn attempts_tls(self) -> bool {
        self != Self::None
    }
}

/// TLS protocol version offered during the handshake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum TlsProtocol {
    #[default]
    Tls12,
    Tls13,
}

impl fmt::Display for TlsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => f.write_str("TLSv1.2"),
            Self::Tls13 => f.write_str("TLSv1.3"),
        }
    }
}

/// Data channel style.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataConnectionType {
    /// EPSV first, PASV when the server refuses EPSV on IPv4.
    #[default]
    AutoPassive,
    Passive,
    ExtendedPassive,
    Active,
    ExtendedActive,
}

/// IP version of an established connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Which address families may be used while connecting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpVersions {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl IpVersions {
    pub const ANY: Self = Self { ipv4: true, ipv6: true };
    pub const V4_ONLY: Self = Self { ipv4: true, ipv6: false };
    pub const V6_ONLY: Self = Self { ipv4: false, ipv6: true };

    pub fn allows(&self, addr: &IpAddr) -> bool {
        match IpVersion::of(addr) {
            IpVersion::V4 => self.ipv4,
            IpVersion::V6 => self.ipv6,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.ipv4 && !self.ipv6
    }
}

impl Default for IpVersions {
    fn default() -> Self {
        Self::ANY
    }
}

/// What to do when the remote file already exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RemoteExists {
    /// Upload without checking; the server decides.
    NoCheck,
    /// Replace the remote file.
    #[default]
    Overwrite,
    /// Leave the remote file untouched.
    Skip,
    /// Continue the local file from the remote file's length.
    Resume,
    /// Resume without first asking the server for the size.
    ResumeNoCheck,
    /// Append the whole local file after the remote content.
    AddToEnd,
    /// Append without first asking the server for the size.
    AddToEndNoCheck,
}

impl RemoteExists {
    pub fn is_resume(self) -> bool {
        matches!(self, Self::Resume | Self::ResumeNoCheck)
    }

    pub fn is_add_to_end(self) -> bool {
        matches!(self, Self::AddToEnd | Self::AddToEndNoCheck)
    }

    pub fn is_append(self) -> bool {
        self.is_resume() || self.is_add_to_end()
    }
}

/// Hash algorithm selected via `OPTS HASH`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum HashAlgorithm {
    #[default]
    None,
    Sha1,
    Sha256,
    Sha512,
    Md5,
    Crc,
}

impl HashAlgorithm {
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Sha1 => Some("SHA-1"),
            Self::Sha256 => Some("SHA-256"),
            Self::Sha512 => Some("SHA-512"),
            Self::Md5 => Some("MD5"),
            Self::Crc => Some("CRC"),
        }
    }
}

/// Representation type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    #[default]
    Unknown,
    Ascii,
    Binary,
}

/// Listing flags that decide which listing command is sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Use LIST even when MLSD is available.
    pub force_list: bool,
    /// Use `STAT -l` over the control connection.
    pub use_stat: bool,
    /// Do not append the path to the command.
    pub no_path: bool,
    /// Use NLST.
    pub name_list: bool,
    /// Use LS.
    pub use_ls: bool,
    /// Add `-a` to LIST.
    pub all_files: bool,
    /// Add `-R` to LIST when the server can recurse.
    pub recursive: bool,
}

/// Username and password.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", "anonymous@")
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Configuration for a single FTP connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpConfig {
    pub host: String,
    /// 0 selects the encryption mode's default port.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub encryption: EncryptionMode,
    #[serde(default)]
    pub tls_protocol: TlsProtocol,
    #[serde(default)]
    pub data_connection_type: DataConnectionType,
    /// Send PBSZ/PROT P and encrypt data channels when TLS is active.
    #[serde(default = "default_true")]
    pub data_connection_encryption: bool,
    #[serde(default)]
    pub ip_versions: IpVersions,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub data_connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub data_read_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Idle time after which the liveness check probes the socket.
    #[serde(default = "default_poll_interval")]
    pub socket_poll_interval_ms: u64,
    #[serde(default = "default_chunk")]
    pub transfer_chunk_size: usize,
    /// KiB/s, 0 disables the limit.
    #[serde(default)]
    pub upload_rate_limit_kib: u64,
    /// KiB/s, 0 disables the limit.
    #[serde(default)]
    pub download_rate_limit_kib: u64,
    #[serde(default = "default_retries")]
    pub retry_attempts: u32,
    /// Keep-alive interval of the caller's NOOP schedule (0 = off). When set,
    /// the control channel may be checked for liveness between commands, so
    /// its TLS reads are not buffered. The engine sends no NOOPs on its own.
    #[serde(default)]
    pub noop_interval_ms: u64,
    /// The socket is tunnelled through a proxy.
    #[serde(default)]
    pub behind_proxy: bool,
    #[serde(default = "default_true")]
    pub check_capabilities: bool,
    /// Local address to bind for active-mode data connections.
    #[serde(default)]
    pub active_bind_address: Option<String>,
    /// Log resolved IP addresses.
    #[serde(default)]
    pub log_host: bool,
    /// Path to a PEM client certificate chain presented during the handshake.
    #[serde(default)]
    pub client_cert_pem: Option<String>,
    /// Path to the PEM private key for `client_cert_pem`.
    #[serde(default)]
    pub client_key_pem: Option<String>,
}

fn default_connect_timeout() -> u64 {
    15_000
}
fn default_read_timeout() -> u64 {
    15_000
}
fn default_handshake_timeout() -> u64 {
    15_000
}
fn default_poll_interval() -> u64 {
    15_000
}
fn default_chunk() -> usize {
    crate::ftp::tuner::DEFAULT_CHUNK_SIZE
}
fn default_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            credentials: Credentials::anonymous(),
            encryption: EncryptionMode::None,
            tls_protocol: TlsProtocol::Tls12,
            data_connection_type: DataConnectionType::AutoPassive,
            data_connection_encryption: true,
            ip_versions: IpVersions::ANY,
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            data_connect_timeout_ms: default_connect_timeout(),
            data_read_timeout_ms: default_read_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            socket_poll_interval_ms: default_poll_interval(),
            transfer_chunk_size: default_chunk(),
            upload_rate_limit_kib: 0,
            download_rate_limit_kib: 0,
            retry_attempts: default_retries(),
            noop_interval_ms: 0,
            behind_proxy: false,
            check_capabilities: true,
            active_bind_address: None,
            log_host: false,
            client_cert_pem: None,
            client_key_pem: None,
        }
    }
}

impl FtpConfig {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            credentials,
            ..Self::default()
        }
    }

    /// Parse `ftp://`, `ftps://` (implicit) or `ftpes://` (explicit) URLs.
    pub fn from_url(raw: &str) -> FtpResult<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| FtpError::invalid_config(format!("Invalid FTP URL '{}': {}", raw, e)))?;
        let encryption = match url.scheme() {
            "ftp" => EncryptionMode::None,
            "ftps" => EncryptionMode::Implicit,
            "ftpes" => EncryptionMode::Explicit,
            other => {
                return Err(FtpError::invalid_config(format!(
                    "Unsupported URL scheme '{}'",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| FtpError::invalid_config("FTP URL has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let credentials = if url.username().is_empty() {
            Credentials::anonymous()
        } else {
            Credentials::new(url.username(), url.password().unwrap_or(""))
        };
        Ok(Self {
            host,
            port: url.port().unwrap_or(0),
            credentials,
            encryption,
            ..Self::default()
        })
    }

    pub fn from_json(raw: &str) -> FtpResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| FtpError::invalid_config(format!("Invalid FTP config: {}", e)))
    }

    /// The port that will actually be dialled.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.encryption.default_port()
        } else {
            self.port
        }
    }

    /// Copy the profile's negotiated settings into this config.
    pub fn apply_profile(&mut self, profile: &ConnectionProfile) {
        self.host = profile.host.clone();
        self.credentials = profile.credentials.clone();
        self.encryption = profile.encryption;
        self.tls_protocol = profile.protocol;
        self.data_connection_type = profile.data_connection;
        if profile.timeout_ms != 0 {
            self.connect_timeout_ms = profile.timeout_ms;
            self.read_timeout_ms = profile.timeout_ms;
            self.data_connect_timeout_ms = profile.timeout_ms;
            self.data_read_timeout_ms = profile.timeout_ms;
        }
        if profile.socket_poll_interval_ms != 0 {
            self.socket_poll_interval_ms = profile.socket_poll_interval_ms;
        }
        if profile.retry_attempts != 0 {
            self.retry_attempts = profile.retry_attempts;
        }
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }
        if self.ip_versions.is_empty() {
            return Err(FtpError::invalid_config(
                "At least one IP version must be allowed",
            ));
        }
        if self.client_cert_pem.is_some() != self.client_key_pem.is_some() {
            return Err(FtpError::invalid_config(
                "Client certificate and key must be given together",
            ));
        }
        Ok(())
    }
}

/// A working connection configuration found by auto-detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub host: String,
    pub credentials: Credentials,
    pub encryption: EncryptionMode,
    pub protocol: TlsProtocol,
    pub data_connection: DataConnectionType,
    /// Character encoding of the control channel.
    pub encoding: String,
    /// The server confirmed UTF-8 (FEAT or `OPTS UTF8 ON`).
    pub encoding_verified: bool,
    /// 0 keeps the client's own timeouts.
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub socket_poll_interval_ms: u64,
}

/// Snapshot of a connected session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub encryption: EncryptionMode,
    pub tls_protocol: Option<TlsProtocol>,
    pub cipher_suite: Option<String>,
    pub ip_version: Option<IpVersion>,
    pub connected: bool,
    pub is_clone: bool,
    pub server_banner: Option<String>,
    pub system_type: Option<String>,
    pub features: Vec<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

// ─── FTP Reply ───────────────────────────────────────────────────────

/// A single FTP reply (may be multi-line).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpReply {
    pub fn new(code: u16, line: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![line.into()],
        }
    }

    /// Full reply text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the final line without the code prefix.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    /// Whether the reply code indicates success (1xx–3xx).
    pub fn is_success(&self) -> bool {
        (100..400).contains(&self.code)
    }

    /// Positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Transient (4xx) or permanent (5xx) negative completion.
    pub fn is_negative(&self) -> bool {
        self.code >= 400
    }

    pub fn into_error(self) -> FtpError {
        FtpError::from_reply(self.code, &self.text())
    }

    /// Turn a negative reply into an error.
    pub fn ensure_success(self) -> FtpResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }
}

// ─── Server Capabilities ─────────────────────────────────────────────

/// Parsed FEAT reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    pub mlsd: bool,
    pub size: bool,
    pub mdtm: bool,
    pub rest_stream: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub eprt: bool,
    pub auth_tls: bool,
    pub pbsz: bool,
    pub prot: bool,
    pub ccc: bool,
    pub pret: bool,
    pub hash: bool,
    pub raw_features: Vec<String>,
}

impl ServerFeatures {
    pub fn from_feat(reply: &FtpReply) -> Self {
        let raw: Vec<String> = reply
            .lines
            .iter()
            .skip(1)
            .filter(|l| !l.starts_with(&reply.code.to_string()))
            .map(|l| l.trim().to_uppercase())
            .filter(|l| !l.is_empty())
            .collect();

        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        Self {
            mlsd: has("MLSD") || has("MLST"),
            size: has("SIZE"),
            mdtm: has("MDTM"),
            rest_stream: has("REST STREAM"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            eprt: has("EPRT"),
            auth_tls: has("AUTH TLS") || has("AUTH SSL"),
            pbsz: has("PBSZ"),
            prot: has("PROT"),
            ccc: has("CCC"),
            pret: has("PRET"),
            hash: has("HASH"),
            raw_features: raw,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw_features.is_empty()
    }
}
