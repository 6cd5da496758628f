//! Stateful FTP client: owns the control connection and issues commands.
//!
//! Lifecycle: `connect()` → greeting → TLS (implicit, or `AUTH TLS`) →
//! USER/PASS → PBSZ/PROT → FEAT → `OPTS UTF8 ON` → SYST → PWD.
//!
//! The client exposes the command helpers used by `passive.rs` and
//! `file_ops.rs`, the data channel factory, cloning for parallel work and
//! auto-detection of a working profile.

use crate::ftp::data_channel::{DataChannel, ReplyChannel};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::negotiate::{self, AutoDetectConfig, ProbeAttempt, ProbeOutcome, ProbeTarget};
use crate::ftp::passive;
use crate::ftp::protocol;
use crate::ftp::state::ConnectionState;
use crate::ftp::tls::{self, CertValidator, EncryptionLayer, RustlsProvider, TlsProvider};
use crate::ftp::transport::{Transport, TransportOptions};
use crate::ftp::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// An FTP/FTPS control connection.
pub struct FtpClient {
    id: String,
    config: FtpConfig,
    provider: Arc<dyn TlsProvider>,
    validator: CertValidator,
    transport: Option<Transport>,
    encryption: Option<EncryptionLayer>,
    state: ConnectionState,
    features: ServerFeatures,
    /// Host of the parent connection, for clones.
    cloned_from: Option<String>,
    banner: Option<String>,
    system_type: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    /// Opening reply of a data channel dropped without `close`.
    pending_reply: Option<FtpReply>,
    cancel: CancellationToken,
}

impl FtpClient {
    /// Client using the built-in rustls provider and default certificate
    /// validation. Nothing is connected until [`FtpClient::connect`].
    pub fn new(config: FtpConfig) -> Self {
        Self::with_tls(
            config,
            Arc::new(RustlsProvider::new()),
            tls::default_validator(),
        )
    }

    pub fn with_tls(
        config: FtpConfig,
        provider: Arc<dyn TlsProvider>,
        validator: CertValidator,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            provider,
            validator,
            transport: None,
            encryption: None,
            state: ConnectionState::reset(),
            features: ServerFeatures::default(),
            cloned_from: None,
            banner: None,
            system_type: None,
            connected_at: None,
            pending_reply: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Negotiate profiles for `host` on a throwaway client.
    pub async fn negotiate(
        host: &str,
        credentials: Credentials,
        options: &AutoDetectConfig,
    ) -> FtpResult<Vec<ConnectionProfile>> {
        let mut client = Self::new(FtpConfig::new(host, credentials));
        client.auto_detect(options).await
    }

    pub fn set_certificate_validator(&mut self, validator: CertValidator) {
        self.validator = validator;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    /// Changes take effect on the next connect.
    pub fn config_mut(&mut self) -> &mut FtpConfig {
        &mut self.config
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    /// Declare that the server honours `LIST -R`.
    pub fn set_recursive_list_supported(&mut self, supported: bool) {
        self.state.recursive_list_supported = supported;
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn is_clone(&self) -> bool {
        self.cloned_from.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_connected)
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_encrypted)
    }

    /// Token that cancels every in-flight operation of the current session,
    /// data channels included.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn control_remote_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref()?.remote_addr()
    }

    pub(crate) fn control_local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref()?.local_addr()
    }

    fn control_transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_millis(self.config.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.config.read_timeout_ms),
            poll_interval: Duration::from_millis(self.config.socket_poll_interval_ms),
            ip_versions: self.config.ip_versions,
            log_host: self.config.log_host,
        }
    }

    /// Data addresses come from the server, so every IP version is allowed.
    pub(crate) fn data_transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_millis(self.config.data_connect_timeout_ms),
            read_timeout: Duration::from_millis(self.config.data_read_timeout_ms),
            poll_interval: Duration::from_millis(self.config.socket_poll_interval_ms),
            ip_versions: IpVersions::ANY,
            log_host: self.config.log_host,
        }
    }

    pub(crate) fn data_cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    // ── Connect / disconnect ─────────────────────────────────────

    /// Connect and log in from a clean state. A clone still pointed at its
    /// parent's host keeps the server capability flags it was created with.
    pub async fn connect(&mut self) -> FtpResult<()> {
        let state = match &self.cloned_from {
            Some(host) if *host == self.config.host => {
                ConnectionState::reset().copy_from(&self.state)
            }
            _ => ConnectionState::reset(),
        };
        self.connect_with_state(state).await
    }

    /// Apply a negotiated profile and connect with it.
    pub async fn connect_profile(&mut self, profile: &ConnectionProfile) -> FtpResult<()> {
        self.config.apply_profile(profile);
        self.connect().await
    }

    /// Reconnect the same session, restoring the working directory and the
    /// representation type in use before.
    pub async fn reconnect(&mut self) -> FtpResult<()> {
        let kept = self.state.reset_for_reconnect();
        self.connect_with_state(kept).await
    }

    async fn connect_with_state(&mut self, state: ConnectionState) -> FtpResult<()> {
        self.config.validate()?;
        self.close_transport();
        self.state = state;
        self.pending_reply = None;
        self.cancel = CancellationToken::new();

        let result = self.open_session().await;
        if let Err(e) = &result {
            log::debug!("Connect to {} failed: {}", self.config.host, e);
            self.close_transport();
        }
        result
    }

    async fn open_session(&mut self) -> FtpResult<()> {
        let host = self.config.host.clone();
        let port = self.config.effective_port();
        let mode = self.config.encryption;

        let mut layer = EncryptionLayer::from_config(
            &self.config,
            self.provider.clone(),
            self.validator.clone(),
        )?;
        let mut transport = Transport::connect(
            &host,
            port,
            self.control_transport_options(),
            self.cancel.child_token(),
        )
        .await?;
        if mode == EncryptionMode::Implicit {
            layer
                .activate(&mut transport, &host, &[self.config.tls_protocol], true)
                .await?;
        }
        self.transport = Some(transport);
        self.encryption = Some(layer);

        let greeting = self.read_reply().await?;
        if !greeting.is_success() {
            return Err(greeting.into_error());
        }
        if banner_supports_recursive_list(&greeting.text()) {
            self.state.recursive_list_supported = true;
        }
        self.banner = Some(greeting.text());

        if matches!(mode, EncryptionMode::Explicit | EncryptionMode::Auto) {
            let reply = self.execute("AUTH TLS").await?;
            if reply.is_success() {
                self.activate_control_tls().await?;
            } else {
                self.state.ftps_failure = true;
                if mode == EncryptionMode::Explicit {
                    return Err(FtpError::security_not_available(format!(
                        "Server refused AUTH TLS: {}",
                        reply.text()
                    ))
                    .with_code(reply.code));
                }
                log::info!("{} refused AUTH TLS, continuing without encryption", host);
            }
        }

        self.login().await?;

        if self.is_encrypted() && self.config.data_connection_encryption {
            self.execute("PBSZ 0").await?.ensure_success()?;
            self.execute("PROT P").await?.ensure_success()?;
        }

        if self.config.check_capabilities && !(self.is_clone() && !self.features.is_empty()) {
            let reply = self.execute("FEAT").await?;
            self.features = if reply.is_success() {
                ServerFeatures::from_feat(&reply)
            } else {
                ServerFeatures::default()
            };
        }

        if self.features.utf8 {
            let reply = self.execute("OPTS UTF8 ON").await?;
            self.state.utf8_success = reply.is_success();
        }

        let syst = self.execute("SYST").await?;
        self.system_type = syst.is_success().then(|| syst.message().to_string());

        self.restore_session().await?;

        self.connected_at = Some(Utc::now());
        log::info!(
            "Connected to {}:{} ({:?}{})",
            host,
            port,
            mode,
            if self.is_encrypted() { ", encrypted" } else { "" }
        );
        Ok(())
    }

    async fn activate_control_tls(&mut self) -> FtpResult<()> {
        let (Some(transport), Some(layer)) = (self.transport.as_mut(), self.encryption.as_mut())
        else {
            return Err(FtpError::not_connected());
        };
        layer
            .activate(transport, &self.config.host, &[self.config.tls_protocol], true)
            .await
    }

    async fn login(&mut self) -> FtpResult<()> {
        let user = format!("USER {}", self.config.credentials.username);
        let mut reply = self.execute(&user).await?;
        if reply.code == 331 {
            let pass = format!("PASS {}", self.config.credentials.password);
            reply = self.execute(&pass).await?;
        }
        match reply.code {
            332 => {
                Err(FtpError::auth_failed("Server requires an account (ACCT)").with_code(332))
            }
            _ if reply.is_success() => Ok(()),
            code => {
                let message = format!("Login failed: {}", reply.text());
                Err(FtpError::auth_failed(message).with_code(code))
            }
        }
    }

    /// Working directory and TYPE carried over by `reconnect`, or the
    /// initial PWD for a fresh connect.
    async fn restore_session(&mut self) -> FtpResult<()> {
        let wanted_type = std::mem::take(&mut self.state.current_data_type);
        if wanted_type != DataType::Unknown {
            self.set_data_type(wanted_type).await?;
        }
        match self.state.last_working_dir.clone() {
            Some(dir) => {
                self.execute(&format!("CWD {}", dir)).await?.ensure_success()?;
            }
            None => {
                if let Err(e) = self.current_directory().await {
                    log::debug!("PWD failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Send QUIT and close. Never fails.
    pub async fn disconnect(&mut self) {
        if self.is_connected() {
            if let Some(t) = self.transport.as_mut() {
                t.set_read_timeout(Duration::from_millis(self.config.read_timeout_ms.min(2000)));
            }
            if let Err(e) = self.execute("QUIT").await {
                log::debug!("QUIT failed: {}", e);
            }
            if let Some(t) = self.transport.as_mut() {
                let _ = t.shutdown().await;
            }
        }
        self.close_transport();
    }

    fn close_transport(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
        self.encryption = None;
        self.connected_at = None;
        self.pending_reply = None;
    }

    /// Whether the control connection still looks usable.
    pub async fn is_alive(&mut self) -> bool {
        match self.transport.as_mut() {
            Some(t) => t.is_alive().await,
            None => false,
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Send a command and return its reply, whatever the code.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.drain_pending_reply().await?;
        let transport = self.transport.as_mut().ok_or_else(FtpError::not_connected)?;
        protocol::execute(transport, cmd).await
    }

    async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        let transport = self.transport.as_mut().ok_or_else(FtpError::not_connected)?;
        protocol::read_reply(transport).await
    }

    /// Consume the final reply of a data channel dropped mid-transfer.
    async fn drain_pending_reply(&mut self) -> FtpResult<()> {
        if let Some(opening) = self.pending_reply.take() {
            if opening.is_preliminary() {
                let stale = self.read_reply().await?;
                log::debug!("Discarded stale reply: {}", stale.text());
            }
        }
        Ok(())
    }

    pub async fn noop(&mut self) -> FtpResult<()> {
        self.execute("NOOP").await?.ensure_success().map(|_| ())
    }

    /// Switch TYPE, skipping the command when it is already in effect.
    pub async fn set_data_type(&mut self, data_type: DataType) -> FtpResult<()> {
        if self.state.current_data_type == data_type {
            return Ok(());
        }
        let cmd = match data_type {
            DataType::Ascii => "TYPE A",
            DataType::Binary => "TYPE I",
            DataType::Unknown => return Ok(()),
        };
        self.execute(cmd).await?.ensure_success()?;
        self.state.current_data_type = data_type;
        Ok(())
    }

    /// Current directory, cached until the next CWD.
    pub async fn current_directory(&mut self) -> FtpResult<String> {
        if let Some(dir) = &self.state.last_working_dir {
            return Ok(dir.clone());
        }
        let reply = self.execute("PWD").await?.ensure_success()?;
        let dir = protocol::parse_pwd(&reply)
            .ok_or_else(|| {
                FtpError::protocol_error(format!("Cannot parse PWD reply: {}", reply.text()))
            })?;
        self.state.last_working_dir = Some(dir.clone());
        Ok(dir)
    }

    pub async fn change_directory(&mut self, path: &str) -> FtpResult<()> {
        self.state.last_working_dir = None;
        self.execute(&format!("CWD {}", path)).await?.ensure_success()?;
        Ok(())
    }

    /// Select the server's hash algorithm with `OPTS HASH`, skipped when
    /// already selected.
    pub async fn set_hash_algorithm(&mut self, algorithm: HashAlgorithm) -> FtpResult<()> {
        if self.state.last_hash_algorithm == algorithm {
            return Ok(());
        }
        let name = algorithm
            .wire_name()
            .ok_or_else(|| FtpError::invalid_config("No hash algorithm selected"))?;
        self.execute(&format!("OPTS HASH {}", name)).await?.ensure_success()?;
        self.state.last_hash_algorithm = algorithm;
        Ok(())
    }

    /// Send `CCC` and continue the control channel in plaintext. Data
    /// channels keep their PROT setting.
    pub async fn clear_command_channel(&mut self) -> FtpResult<()> {
        if !self.is_encrypted() {
            return Err(FtpError::tls_failed("Control channel is not encrypted"));
        }
        self.execute("CCC").await?.ensure_success()?;
        let (Some(transport), Some(layer)) = (self.transport.as_mut(), self.encryption.as_mut())
        else {
            return Err(FtpError::not_connected());
        };
        layer.deactivate(transport).await?;
        log::info!("Control channel to {} is now unencrypted", self.config.host);
        Ok(())
    }

    // ── Data channels ────────────────────────────────────────────

    /// Issue `command` over a fresh data connection.
    ///
    /// `restart` > 0 sends `REST` first. The returned channel must be closed
    /// before the next command; dropping it defers its final reply to the
    /// next command.
    pub async fn open_data_channel(
        &mut self,
        command: &str,
        restart: u64,
    ) -> FtpResult<DataChannel<'_>> {
        if !self.is_connected() {
            return Err(FtpError::not_connected());
        }
        self.drain_pending_reply().await?;

        let style = self.config.data_connection_type;
        let (mut transport, reply) = passive::open(self, style, command, restart).await?;

        if self.config.data_connection_encryption
            && self.config.encryption.attempts_tls()
            && !self.state.ftps_failure
        {
            let mut layer = self
                .encryption
                .as_ref()
                .ok_or_else(FtpError::not_connected)?
                .for_data_channel();
            if let Err(e) = layer
                .activate(&mut transport, &self.config.host, &[self.config.tls_protocol], false)
                .await
            {
                transport.close();
                if reply.is_preliminary() {
                    if let Err(drain) = self.read_reply().await {
                        log::debug!("No final reply after failed data handshake: {}", drain);
                    }
                }
                return Err(e);
            }
        }

        Ok(DataChannel::new(self, transport, reply))
    }

    // ── Cloning / auto-detection ─────────────────────────────────

    /// A new, unconnected client with the same configuration and TLS setup
    /// that starts out knowing this server's capability flags.
    pub fn clone_connection(&self) -> FtpClient {
        let mut clone =
            Self::with_tls(self.config.clone(), self.provider.clone(), self.validator.clone());
        clone.state = ConnectionState::reset().copy_from(&self.state);
        clone.features = self.features.clone();
        clone.cloned_from = Some(self.config.host.clone());
        clone
    }

    /// Find working connection profiles for this client's host.
    pub async fn auto_detect(
        &mut self,
        options: &AutoDetectConfig,
    ) -> FtpResult<Vec<ConnectionProfile>> {
        if options.clone_connection {
            let mut detector = self.clone_connection();
            let result = negotiate::auto_detect(&mut detector, options).await;
            detector.disconnect().await;
            result
        } else {
            negotiate::auto_detect(self, options).await
        }
    }

    /// Snapshot of this session.
    pub fn session_info(&self) -> SessionInfo {
        let layer = self.encryption.as_ref().filter(|_| self.is_encrypted());
        SessionInfo {
            id: self.id.clone(),
            host: self.config.host.clone(),
            port: self.config.effective_port(),
            encryption: self.config.encryption,
            tls_protocol: layer.and_then(|l| l.protocol()),
            cipher_suite: layer.and_then(|l| l.cipher_suite().map(str::to_string)),
            ip_version: self.transport.as_ref().and_then(Transport::ip_version),
            connected: self.is_connected(),
            is_clone: self.is_clone(),
            server_banner: self.banner.clone(),
            system_type: self.system_type.clone(),
            features: self.features.raw_features.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Servers known to honour `LIST -R`, recognised by their greeting.
fn banner_supports_recursive_list(banner: &str) -> bool {
    banner.contains("ProFTPD") || banner.contains("wuftpd")
}

#[async_trait]
impl ReplyChannel for FtpClient {
    async fn complete_transfer(&mut self, opening: FtpReply) -> FtpResult<FtpReply> {
        let last = if opening.is_preliminary() {
            self.read_reply().await?
        } else {
            opening
        };
        last.ensure_success()
    }

    fn mark_reply_pending(&mut self, opening: FtpReply) {
        self.pending_reply = Some(opening);
    }
}

#[async_trait]
impl ProbeTarget for FtpClient {
    fn host(&self) -> String {
        self.config.host.clone()
    }

    fn port(&self) -> u16 {
        self.config.port
    }

    fn credentials(&self) -> Credentials {
        self.config.credentials.clone()
    }

    async fn try_connect(&mut self, attempt: &ProbeAttempt) -> FtpResult<ProbeOutcome> {
        self.config.host = attempt.host.clone();
        self.config.credentials = attempt.credentials.clone();
        self.config.encryption = attempt.encryption;
        self.config.tls_protocol = attempt.protocol;
        self.config.data_connection_type = DataConnectionType::AutoPassive;
        if attempt.reset_port {
            self.config.port = 0;
        }
        if let Some(known) = &attempt.known_host {
            self.config.connect_timeout_ms = known.timeout_ms;
            self.config.retry_attempts = known.retry_attempts;
            self.config.socket_poll_interval_ms = known.socket_poll_interval_ms;
        }

        self.connect().await?;
        Ok(ProbeOutcome {
            ip_version: self
                .transport
                .as_ref()
                .and_then(Transport::ip_version)
                .unwrap_or(IpVersion::V4),
            ftps_failure: self.state.ftps_failure,
            utf8_verified: self.state.utf8_success || self.features.utf8,
        })
    }

    async fn disconnect(&mut self) {
        FtpClient::disconnect(self).await;
    }
}
