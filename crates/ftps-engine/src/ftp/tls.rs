//! TLS for implicit and explicit FTPS (RFC 4217).
//!
//! - `TlsProvider` / `SecureChannel` is the seam a TLS implementation plugs
//!   into; `RustlsProvider` is the built-in one.
//! - `EncryptionLayer` activates and deactivates TLS on a `Transport`, picks
//!   the buffering mode and shares one session cache between the control
//!   channel and its data channels so data handshakes can resume.
//! - Certificate trust is decided by a `CertValidator` callback.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::transport::{RawIo, Transport};
use crate::ftp::types::{FtpConfig, TlsProtocol};
use async_trait::async_trait;
use lazy_static::lazy_static;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{
    ClientSessionMemoryCache, ClientSessionStore, Resumption, WebPkiServerVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Duration;
use tokio_rustls::TlsConnector;

/// Sessions kept per cache for resumption.
const SESSION_CACHE_SIZE: usize = 32;

lazy_static! {
    static ref NATIVE_ROOTS: Arc<RootCertStore> = Arc::new(load_native_roots());
}

fn load_native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let found = rustls_native_certs::load_native_certs();
    for err in &found.errors {
        log::debug!("Skipping native certificate source: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(found.certs);
    log::debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
    roots
}

// ─── Certificate validation ──────────────────────────────────────────

/// Certificates presented by the server, DER encoded, end entity first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateChain {
    pub certificates: Vec<Vec<u8>>,
}

impl CertificateChain {
    pub fn end_entity(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }
}

/// Result of the standard chain and host name evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    Trusted,
    Rejected(String),
}

impl PolicyOutcome {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }
}

/// Decides whether to accept a server certificate.
pub type CertValidator = Arc<dyn Fn(&CertificateChain, &PolicyOutcome) -> bool + Send + Sync>;

/// Accept only what the policy evaluation trusted.
pub fn default_certificate_validation(_chain: &CertificateChain, outcome: &PolicyOutcome) -> bool {
    outcome.is_trusted()
}

/// Accept every certificate.
pub fn accept_any_certificate(_chain: &CertificateChain, _outcome: &PolicyOutcome) -> bool {
    true
}

pub fn default_validator() -> CertValidator {
    Arc::new(default_certificate_validation)
}

pub fn accept_any_validator() -> CertValidator {
    Arc::new(accept_any_certificate)
}

/// Runs the webpki evaluation, then hands the verdict to the callback.
///
/// One verifier serves every handshake of a `SharedSession`, so the callback
/// is swapped in per handshake.
struct CallbackVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    validator: Mutex<CertValidator>,
}

impl CallbackVerifier {
    fn set_validator(&self, validator: CertValidator) {
        if let Ok(mut current) = self.validator.lock() {
            *current = validator;
        }
    }
}

impl std::fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("webpki", &self.inner.is_some())
            .finish()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let outcome = match &self.inner {
            Some(webpki) => match webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(_) => PolicyOutcome::Trusted,
                Err(e) => PolicyOutcome::Rejected(e.to_string()),
            },
            None => PolicyOutcome::Rejected("no trust anchors available".into()),
        };

        let chain = CertificateChain {
            certificates: std::iter::once(end_entity)
                .chain(intermediates.iter())
                .map(|c| c.as_ref().to_vec())
                .collect(),
        };

        let validator = self
            .validator
            .lock()
            .map(|v| v.clone())
            .map_err(|_| rustls::Error::General("certificate validator lock poisoned".into()))?;
        if validator(&chain, &outcome) {
            if let PolicyOutcome::Rejected(reason) = &outcome {
                log::warn!("Accepting untrusted certificate for {:?}: {}", server_name, reason);
            }
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

// ─── Client identity ─────────────────────────────────────────────────

/// Client certificate chain and key presented during the handshake.
pub struct ClientIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certificates", &self.chain.len())
            .finish()
    }
}

impl ClientIdentity {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> FtpResult<Self> {
        let chain = rustls_pemfile::certs(&mut io::Cursor::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FtpError::invalid_config(format!("Invalid client certificate: {}", e)))?;
        if chain.is_empty() {
            return Err(FtpError::invalid_config("No certificate found in client certificate PEM"));
        }
        let key = rustls_pemfile::private_key(&mut io::Cursor::new(key_pem))
            .map_err(|e| FtpError::invalid_config(format!("Invalid client key: {}", e)))?
            .ok_or_else(|| FtpError::invalid_config("No private key found in client key PEM"))?;
        Ok(Self { chain, key })
    }

    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> FtpResult<Self> {
        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| {
                FtpError::invalid_config(format!("Cannot read {}: {}", p.display(), e))
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }
}

// ─── Provider seam ───────────────────────────────────────────────────

/// TLS state shared by a control channel and its data channels.
///
/// rustls only resumes a session with the verifier and client credentials
/// that created it, so the client configuration is built once per shared
/// session and reused by every later handshake.
pub struct SharedSession {
    store: Arc<dyn ClientSessionStore>,
    built: Mutex<Option<BuiltConfig>>,
}

struct BuiltConfig {
    protocols: Vec<TlsProtocol>,
    config: Arc<rustls::ClientConfig>,
    verifier: Arc<CallbackVerifier>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self {
            store: Arc::new(ClientSessionMemoryCache::new(SESSION_CACHE_SIZE)),
            built: Mutex::new(None),
        }
    }

    /// Resumption store handed to rustls.
    pub fn store(&self) -> &Arc<dyn ClientSessionStore> {
        &self.store
    }
}

impl Default for SharedSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a `SharedSession`.
pub type SessionCache = Arc<SharedSession>;

pub fn new_session_cache() -> SessionCache {
    Arc::new(SharedSession::new())
}

/// Everything a provider needs for one handshake.
#[derive(Clone)]
pub struct HandshakeParams {
    pub server_name: String,
    /// Versions to offer; empty offers every supported version.
    pub protocols: Vec<TlsProtocol>,
    pub validator: CertValidator,
    pub identity: Option<ClientIdentity>,
    pub session_cache: SessionCache,
}

/// An established TLS session over a `RawIo`.
pub trait SecureChannel: AsyncRead + AsyncWrite + Unpin + Send {
    fn protocol(&self) -> Option<TlsProtocol>;
    fn cipher_suite(&self) -> Option<String>;
    fn raw(&self) -> &RawIo;
    /// Queue a close_notify alert; it goes out on the next flush.
    fn send_close_notify(&mut self);
    /// Give back the plain socket, ending the session.
    fn into_raw(self: Box<Self>) -> RawIo;
}

/// Performs client handshakes. On failure the raw socket is handed back
/// so the caller can still close it cleanly.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    async fn handshake(
        &self,
        io: RawIo,
        params: &HandshakeParams,
    ) -> Result<Box<dyn SecureChannel>, (FtpError, RawIo)>;
}

// ─── rustls provider ─────────────────────────────────────────────────

/// Built-in provider backed by rustls with the ring crypto backend.
#[derive(Clone)]
pub struct RustlsProvider {
    roots: Arc<RootCertStore>,
}

impl Default for RustlsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RustlsProvider {
    /// Trust the platform's root certificates.
    pub fn new() -> Self {
        Self {
            roots: NATIVE_ROOTS.clone(),
        }
    }

    /// Trust only `roots`.
    pub fn with_roots(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }

    /// Configuration for this handshake, reusing the one already built for
    /// the shared session when the offered versions match.
    fn client_config(&self, params: &HandshakeParams) -> FtpResult<Arc<rustls::ClientConfig>> {
        let mut built = params
            .session_cache
            .built
            .lock()
            .map_err(|_| FtpError::tls_failed("TLS session state lock poisoned"))?;
        if let Some(b) = built.as_ref().filter(|b| b.protocols == params.protocols) {
            b.verifier.set_validator(params.validator.clone());
            return Ok(b.config.clone());
        }
        let (config, verifier) = self.build_config(params)?;
        let config = Arc::new(config);
        *built = Some(BuiltConfig {
            protocols: params.protocols.clone(),
            config: config.clone(),
            verifier,
        });
        Ok(config)
    }

    fn build_config(
        &self,
        params: &HandshakeParams,
    ) -> FtpResult<(rustls::ClientConfig, Arc<CallbackVerifier>)> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions: Vec<&'static rustls::SupportedProtocolVersion> =
            match params.protocols.as_slice() {
                [] => rustls::ALL_VERSIONS.to_vec(),
                offered => offered
                    .iter()
                    .map(|p| match p {
                        TlsProtocol::Tls12 => &rustls::version::TLS12,
                        TlsProtocol::Tls13 => &rustls::version::TLS13,
                    })
                    .collect(),
            };

        let inner = if self.roots.is_empty() {
            None
        } else {
            WebPkiServerVerifier::builder_with_provider(self.roots.clone(), provider.clone())
                .build()
                .ok()
        };
        let verifier = Arc::new(CallbackVerifier {
            inner,
            provider: provider.clone(),
            validator: Mutex::new(params.validator.clone()),
        });

        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone());
        let mut config = match &params.identity {
            Some(id) => builder.with_client_auth_cert(id.chain.clone(), id.key.clone_key())?,
            None => builder.with_no_client_auth(),
        };
        config.resumption = Resumption::store(params.session_cache.store().clone());
        Ok((config, verifier))
    }
}

#[async_trait]
impl TlsProvider for RustlsProvider {
    async fn handshake(
        &self,
        io: RawIo,
        params: &HandshakeParams,
    ) -> Result<Box<dyn SecureChannel>, (FtpError, RawIo)> {
        let config = match self.client_config(params) {
            Ok(c) => c,
            Err(e) => return Err((e, io)),
        };
        let name = match ServerName::try_from(params.server_name.clone()) {
            Ok(n) => n,
            Err(e) => {
                return Err((
                    FtpError::tls_failed(format!(
                        "Invalid server name '{}': {}",
                        params.server_name, e
                    )),
                    io,
                ))
            }
        };
        TlsConnector::from(config)
            .connect(name, io)
            .into_fallible()
            .await
            .map(|stream| Box::new(RustlsChannel { stream }) as Box<dyn SecureChannel>)
            .map_err(|(e, io)| (handshake_error(e), io))
    }
}

/// rustls reports protocol failures as `InvalidData` wrapping its own error.
fn handshake_error(e: io::Error) -> FtpError {
    if let Some(tls) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return tls.clone().into();
    }
    e.into()
}

struct RustlsChannel {
    stream: tokio_rustls::client::TlsStream<RawIo>,
}

impl AsyncRead for RustlsChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for RustlsChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl SecureChannel for RustlsChannel {
    fn protocol(&self) -> Option<TlsProtocol> {
        match self.stream.get_ref().1.protocol_version()? {
            rustls::ProtocolVersion::TLSv1_2 => Some(TlsProtocol::Tls12),
            rustls::ProtocolVersion::TLSv1_3 => Some(TlsProtocol::Tls13),
            _ => None,
        }
    }

    fn cipher_suite(&self) -> Option<String> {
        self.stream
            .get_ref()
            .1
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
    }

    fn raw(&self) -> &RawIo {
        self.stream.get_ref().0
    }

    fn send_close_notify(&mut self) {
        self.stream.get_mut().1.send_close_notify();
    }

    fn into_raw(self: Box<Self>) -> RawIo {
        self.stream.into_inner().0
    }
}

// ─── Encryption layer ────────────────────────────────────────────────

/// Buffered reads conflict with proxies and with keep-alive probing of the
/// control channel, so buffering is only used when neither applies.
pub fn use_buffering(
    behind_proxy: bool,
    is_control_channel: bool,
    keepalive_enabled: bool,
) -> bool {
    !(behind_proxy || (is_control_channel && keepalive_enabled))
}

/// TLS state for one connection (control or data).
#[derive(Clone)]
pub struct EncryptionLayer {
    provider: Arc<dyn TlsProvider>,
    validator: CertValidator,
    identity: Option<ClientIdentity>,
    session_cache: SessionCache,
    behind_proxy: bool,
    keepalive_enabled: bool,
    handshake_timeout: Duration,
    protocol: Option<TlsProtocol>,
    cipher_suite: Option<String>,
}

impl EncryptionLayer {
    pub fn new(provider: Arc<dyn TlsProvider>, validator: CertValidator) -> Self {
        Self {
            provider,
            validator,
            identity: None,
            session_cache: new_session_cache(),
            behind_proxy: false,
            keepalive_enabled: false,
            handshake_timeout: Duration::from_secs(15),
            protocol: None,
            cipher_suite: None,
        }
    }

    /// Layer for a control channel configured by `config`.
    pub fn from_config(
        config: &FtpConfig,
        provider: Arc<dyn TlsProvider>,
        validator: CertValidator,
    ) -> FtpResult<Self> {
        let identity = match (&config.client_cert_pem, &config.client_key_pem) {
            (Some(cert), Some(key)) => {
                Some(ClientIdentity::from_pem_files(Path::new(cert), Path::new(key))?)
            }
            _ => None,
        };
        Ok(Self {
            identity,
            behind_proxy: config.behind_proxy,
            keepalive_enabled: config.noop_interval_ms > 0,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            ..Self::new(provider, validator)
        })
    }

    /// Layer for a data channel: the server identity was already accepted on
    /// the control channel, so every certificate is accepted, and the session
    /// cache is shared so the handshake can resume the control session.
    pub fn for_data_channel(&self) -> Self {
        Self {
            validator: accept_any_validator(),
            keepalive_enabled: false,
            protocol: None,
            cipher_suite: None,
            ..self.clone()
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn session_cache(&self) -> &SessionCache {
        &self.session_cache
    }

    pub fn validator(&self) -> &CertValidator {
        &self.validator
    }

    pub fn protocol(&self) -> Option<TlsProtocol> {
        self.protocol
    }

    pub fn cipher_suite(&self) -> Option<&str> {
        self.cipher_suite.as_deref()
    }

    /// Handshake over `transport`.
    ///
    /// On handshake failure the transport keeps its plain socket so it can
    /// still be closed. A timeout or cancellation closes it.
    pub async fn activate(
        &mut self,
        transport: &mut Transport,
        target_host: &str,
        protocols: &[TlsProtocol],
        is_control_channel: bool,
    ) -> FtpResult<()> {
        let raw = transport.take_raw()?;
        let raw = raw.with_buffering(use_buffering(
            self.behind_proxy,
            is_control_channel,
            self.keepalive_enabled,
        ));
        let params = HandshakeParams {
            server_name: target_host.to_string(),
            protocols: protocols.to_vec(),
            validator: self.validator.clone(),
            identity: self.identity.clone(),
            session_cache: self.session_cache.clone(),
        };

        let cancel = transport.cancellation_token();
        let handshake =
            tokio::time::timeout(self.handshake_timeout, self.provider.handshake(raw, &params));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = handshake => Some(res),
        };

        match outcome {
            None => {
                transport.close();
                Err(FtpError::cancelled("TLS handshake cancelled"))
            }
            Some(Err(_)) => {
                transport.close();
                Err(FtpError::timeout(format!("TLS handshake with {} timed out", target_host)))
            }
            Some(Ok(Err((err, raw)))) => {
                transport.install_raw(raw);
                log::debug!("TLS handshake with {} failed: {}", target_host, err);
                Err(err)
            }
            Some(Ok(Ok(channel))) => {
                self.protocol = channel.protocol();
                self.cipher_suite = channel.cipher_suite();
                log::info!(
                    "TLS established with {} ({}, {})",
                    target_host,
                    self.protocol.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into()),
                    self.cipher_suite.as_deref().unwrap_or("unknown cipher")
                );
                transport.install_secure(channel);
                Ok(())
            }
        }
    }

    /// Send close_notify and continue in plaintext on the same socket.
    pub async fn deactivate(&mut self, transport: &mut Transport) -> FtpResult<()> {
        let mut channel = transport.take_secure()?;
        channel.send_close_notify();
        let flushed = tokio::time::timeout(self.handshake_timeout, channel.flush()).await;
        let mut raw = channel.into_raw();
        let _ = raw.flush().await;
        transport.install_raw(raw.with_buffering(false));
        self.protocol = None;
        self.cipher_suite = None;
        match flushed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FtpError::timeout("Sending close_notify timed out")),
        }
    }
}
