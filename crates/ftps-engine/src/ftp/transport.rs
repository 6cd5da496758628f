//! Byte-stream transport shared by the control and data channels.
//!
//! A `Transport` is created connected and dies on close: multi-address
//! connect with a per-address timeout, a process-wide host address cache,
//! an idle-aware liveness probe and read/write calls that report
//! cancellation and timeouts as distinct [`IoOutcome`]s.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::tls::SecureChannel;
use crate::ftp::types::{IpVersion, IpVersions};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound for a single liveness probe.
const LIVENESS_BUDGET: Duration = Duration::from_millis(50);
/// Upper bound for a graceful shutdown before the socket is dropped.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(2);

lazy_static! {
    /// Resolved addresses per host name, kept for the process lifetime.
    static ref HOST_CACHE: Mutex<HashMap<String, Vec<IpAddr>>> = Mutex::new(HashMap::new());
}

// ─── I/O outcome ─────────────────────────────────────────────────────

/// Result of one guarded I/O call.
#[derive(Debug)]
pub enum IoOutcome<T> {
    Done(T),
    /// The caller's cancellation token fired. The transport is closed.
    Cancelled,
    /// No progress within the configured timeout. The transport is closed.
    TimedOut,
    Failed(FtpError),
}

impl<T> IoOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Collapse into a `FtpResult`, naming the operation in the error.
    pub fn into_result(self, what: &str) -> FtpResult<T> {
        match self {
            Self::Done(v) => Ok(v),
            Self::Cancelled => Err(FtpError::cancelled(format!("{} cancelled", what))),
            Self::TimedOut => Err(FtpError::timeout(format!("{} timed out", what))),
            Self::Failed(e) => Err(e),
        }
    }
}

/// Run `fut` under a timeout and a cancellation token.
///
/// An I/O failure observed after cancellation is reported as `Cancelled`,
/// since tearing the socket down is how cancellation reaches in-flight calls.
pub async fn guard<T, F>(cancel: &CancellationToken, limit: Duration, fut: F) -> IoOutcome<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => IoOutcome::Cancelled,
        res = tokio::time::timeout(limit, fut) => match res {
            Err(_) => IoOutcome::TimedOut,
            Ok(Ok(v)) => IoOutcome::Done(v),
            Ok(Err(_)) if cancel.is_cancelled() => IoOutcome::Cancelled,
            Ok(Err(e)) => IoOutcome::Failed(e.into()),
        },
    }
}

// ─── Raw socket ──────────────────────────────────────────────────────

/// The plain socket, optionally behind a read/write buffer.
#[derive(Debug)]
pub enum RawIo {
    Direct(TcpStream),
    Buffered(BufStream<TcpStream>),
}

impl RawIo {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Self::Direct(s) => s,
            Self::Buffered(b) => b.get_ref(),
        }
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }

    /// Switch buffering on or off. Callers flush before removing a buffer.
    pub fn with_buffering(self, on: bool) -> Self {
        match (self, on) {
            (Self::Direct(s), true) => Self::Buffered(BufStream::new(s)),
            (Self::Buffered(b), false) => Self::Direct(b.into_inner()),
            (io, _) => io,
        }
    }
}

impl AsyncRead for RawIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_read(cx, buf),
            Self::Buffered(b) => Pin::new(b).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_write(cx, buf),
            Self::Buffered(b) => Pin::new(b).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_flush(cx),
            Self::Buffered(b) => Pin::new(b).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(s) => Pin::new(s).poll_shutdown(cx),
            Self::Buffered(b) => Pin::new(b).poll_shutdown(cx),
        }
    }
}

/// Plain or TLS stream currently carrying the transport's bytes.
enum Io {
    Raw(RawIo),
    Secure(Box<dyn SecureChannel>),
}

impl Io {
    fn tcp(&self) -> &TcpStream {
        match self {
            Io::Raw(r) => r.tcp(),
            Io::Secure(s) => s.raw().tcp(),
        }
    }
}

impl AsyncRead for Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Raw(r) => Pin::new(r).poll_read(cx, buf),
            Io::Secure(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Io::Raw(r) => Pin::new(r).poll_write(cx, buf),
            Io::Secure(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Raw(r) => Pin::new(r).poll_flush(cx),
            Io::Secure(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Io::Raw(r) => Pin::new(r).poll_shutdown(cx),
            Io::Secure(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────

/// Per-transport tunables.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Idle time before `is_alive` actually probes the socket.
    pub poll_interval: Duration,
    pub ip_versions: IpVersions,
    pub log_host: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(15),
            ip_versions: IpVersions::ANY,
            log_host: false,
        }
    }
}

/// A connected byte stream. Once closed it stays closed.
pub struct Transport {
    io: Option<Io>,
    host: String,
    tried: Vec<SocketAddr>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    last_activity: Instant,
    opts: TransportOptions,
    cancel: CancellationToken,
    line_buf: Vec<u8>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("host", &self.host)
            .field("connected", &self.is_connected())
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl Transport {
    /// Resolve `host`, keep the addresses allowed by `opts.ip_versions` and
    /// connect to the first one that answers. The last address's failure is
    /// returned when none does.
    pub async fn connect(
        host: &str,
        port: u16,
        opts: TransportOptions,
        cancel: CancellationToken,
    ) -> FtpResult<Self> {
        if opts.ip_versions.is_empty() {
            return Err(FtpError::invalid_config("No IP version allowed"));
        }
        let ips = resolve(host, port, &opts, &cancel).await?;
        let addrs: Vec<SocketAddr> = ips
            .into_iter()
            .filter(|ip| opts.ip_versions.allows(ip))
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if addrs.is_empty() {
            return Err(FtpError::host_not_found(format!(
                "{} has no address for the allowed IP versions",
                host
            )));
        }

        let (stream, addr) = connect_addrs(&addrs, &opts, &cancel).await?;
        narrow_cache(host, addr.ip());
        if opts.log_host {
            log::debug!("Connected to {} ({})", host, addr);
        } else {
            log::debug!("Connected to {}", host);
        }

        let mut transport = Self::from_stream(stream, host, opts, cancel);
        transport.tried = addrs;
        Ok(transport)
    }

    /// Wrap an already connected socket (accepted active-mode data channels).
    pub fn from_stream(
        stream: TcpStream,
        host: &str,
        opts: TransportOptions,
        cancel: CancellationToken,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        let remote = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        Self {
            io: Some(Io::Raw(RawIo::Direct(stream))),
            host: host.to_string(),
            tried: remote.into_iter().collect(),
            remote,
            local,
            last_activity: Instant::now(),
            opts,
            cancel,
            line_buf: Vec::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Every address attempted by `connect`, in order.
    pub fn tried_addresses(&self) -> &[SocketAddr] {
        &self.tried
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn ip_version(&self) -> Option<IpVersion> {
        self.remote.map(|a| IpVersion::of(&a.ip()))
    }

    pub fn options(&self) -> &TransportOptions {
        &self.opts
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.opts.read_timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.io, Some(Io::Secure(_)))
    }

    /// Token that cancels in-flight and future I/O on this transport.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel in-flight I/O. The transport closes itself when the pending
    /// call observes it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Negotiated TLS channel, if any.
    pub fn secure_channel(&self) -> Option<&dyn SecureChannel> {
        match &self.io {
            Some(Io::Secure(s)) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// Whether the peer still looks connected.
    ///
    /// A connection used within the poll interval is assumed alive. Past it,
    /// the socket is peeked for at most a short budget: end-of-stream means
    /// the peer is gone, pending data or no answer means it is still there.
    pub async fn is_alive(&mut self) -> bool {
        let Some(io) = &self.io else {
            return false;
        };
        if self.last_activity.elapsed() < self.opts.poll_interval {
            return true;
        }
        let mut probe = [0u8; 1];
        let alive = match tokio::time::timeout(LIVENESS_BUDGET, io.tcp().peek(&mut probe)).await {
            Err(_) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
        };
        if !alive {
            log::debug!("Liveness probe found {} closed", self.host);
            self.close();
        }
        alive
    }

    /// Read whatever is available into `buf`. `Done(0)` is end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> IoOutcome<usize> {
        let limit = self.opts.read_timeout;
        if !self.line_buf.is_empty() {
            let n = buf.len().min(self.line_buf.len());
            buf[..n].copy_from_slice(&self.line_buf[..n]);
            self.line_buf.drain(..n);
            return IoOutcome::Done(n);
        }
        let Some(io) = self.io.as_mut() else {
            return IoOutcome::Failed(FtpError::not_connected());
        };
        let secure = matches!(io, Io::Secure(_));
        let read = async {
            match io.read(buf).await {
                // Many FTPS servers end data connections without close_notify.
                Err(e) if secure && e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
                other => other,
            }
        };
        let outcome = guard(&self.cancel, limit, read).await;
        self.settle(outcome)
    }

    /// Write all of `data`.
    pub async fn write_all(&mut self, data: &[u8]) -> IoOutcome<()> {
        let limit = self.opts.read_timeout;
        let Some(io) = self.io.as_mut() else {
            return IoOutcome::Failed(FtpError::not_connected());
        };
        let outcome = guard(&self.cancel, limit, io.write_all(data)).await;
        self.settle(outcome)
    }

    pub async fn flush(&mut self) -> IoOutcome<()> {
        let limit = self.opts.read_timeout;
        let Some(io) = self.io.as_mut() else {
            return IoOutcome::Failed(FtpError::not_connected());
        };
        let outcome = guard(&self.cancel, limit, io.flush()).await;
        self.settle(outcome)
    }

    /// Read one CRLF/LF terminated line without the terminator.
    pub async fn read_line(&mut self) -> FtpResult<String> {
        loop {
            if let Some(pos) = self.line_buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end_matches(['\r', '\n']).to_string());
            }
            let mut chunk = [0u8; 1024];
            let limit = self.opts.read_timeout;
            let Some(io) = self.io.as_mut() else {
                return Err(FtpError::not_connected());
            };
            let outcome = guard(&self.cancel, limit, io.read(&mut chunk)).await;
            match self.settle(outcome).into_result("Control channel read")? {
                0 => {
                    self.close();
                    return Err(FtpError::disconnected("Server closed connection"));
                }
                n => self.line_buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Flush, shut down the write side (TLS close_notify included) and close.
    pub async fn shutdown(&mut self) -> FtpResult<()> {
        let Some(mut io) = self.io.take() else {
            return Ok(());
        };
        let res = tokio::time::timeout(SHUTDOWN_BUDGET, async {
            io.flush().await?;
            io.shutdown().await
        })
        .await;
        self.close();
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FtpError::timeout("Shutdown timed out")),
        }
    }

    /// Drop the socket. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.io.take().is_some() {
            log::trace!("Transport to {} closed", self.host);
        }
        self.line_buf.clear();
    }

    /// Timeouts and cancellation close the transport. So do hard failures.
    fn settle<T>(&mut self, outcome: IoOutcome<T>) -> IoOutcome<T> {
        match &outcome {
            IoOutcome::Done(_) => self.last_activity = Instant::now(),
            IoOutcome::Cancelled | IoOutcome::TimedOut | IoOutcome::Failed(_) => self.close(),
        }
        outcome
    }

    // ── Encryption layer hand-off ────────────────────────────────

    pub(crate) fn take_raw(&mut self) -> FtpResult<RawIo> {
        match self.io.take() {
            Some(Io::Raw(raw)) => Ok(raw),
            Some(other) => {
                self.io = Some(other);
                Err(FtpError::tls_failed("Encryption is already active on this transport"))
            }
            None => Err(FtpError::not_connected()),
        }
    }

    pub(crate) fn take_secure(&mut self) -> FtpResult<Box<dyn SecureChannel>> {
        match self.io.take() {
            Some(Io::Secure(s)) => Ok(s),
            Some(other) => {
                self.io = Some(other);
                Err(FtpError::tls_failed("Encryption is not active on this transport"))
            }
            None => Err(FtpError::not_connected()),
        }
    }

    pub(crate) fn install_raw(&mut self, raw: RawIo) {
        self.io = Some(Io::Raw(raw));
        self.last_activity = Instant::now();
    }

    pub(crate) fn install_secure(&mut self, secure: Box<dyn SecureChannel>) {
        self.io = Some(Io::Secure(secure));
        self.last_activity = Instant::now();
    }
}

// ─── Resolution & multi-address connect ──────────────────────────────

async fn resolve(
    host: &str,
    port: u16,
    opts: &TransportOptions,
    cancel: &CancellationToken,
) -> FtpResult<Vec<IpAddr>> {
    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    if let Some(cached) = cached_addresses(host) {
        return Ok(cached);
    }

    let lookup = async {
        tokio::net::lookup_host((host, port))
            .await
            .map(|it| it.collect::<Vec<_>>())
    };
    let found = match guard(cancel, opts.connect_timeout, lookup).await {
        IoOutcome::Done(addrs) => addrs,
        IoOutcome::Cancelled => return Err(FtpError::cancelled("Host lookup cancelled")),
        IoOutcome::TimedOut => {
            return Err(FtpError::timeout(format!("Host lookup for {} timed out", host)))
        }
        IoOutcome::Failed(e) => {
            return Err(FtpError::host_not_found(format!("Cannot resolve {}: {}", host, e.message)))
        }
    };

    let mut ips: Vec<IpAddr> = Vec::with_capacity(found.len());
    for addr in found {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    if ips.is_empty() {
        return Err(FtpError::host_not_found(format!("{} resolved to no address", host)));
    }
    if let Ok(mut cache) = HOST_CACHE.lock() {
        cache.insert(host.to_string(), ips.clone());
    }
    Ok(ips)
}

fn cached_addresses(host: &str) -> Option<Vec<IpAddr>> {
    HOST_CACHE.lock().ok()?.get(host).cloned()
}

/// Keep only the address that worked for later connects to `host`.
fn narrow_cache(host: &str, ip: IpAddr) {
    if let Ok(mut cache) = HOST_CACHE.lock() {
        if let Some(entry) = cache.get_mut(host) {
            *entry = vec![ip];
        }
    }
}

/// Try each address in order with its own connect timeout.
pub(crate) async fn connect_addrs(
    addrs: &[SocketAddr],
    opts: &TransportOptions,
    cancel: &CancellationToken,
) -> FtpResult<(TcpStream, SocketAddr)> {
    let mut last_err = FtpError::host_not_found("No address to connect to");
    for addr in addrs {
        let shown = if opts.log_host { addr.to_string() } else { "***".to_string() };
        log::debug!("Connecting to {}", shown);
        match guard(cancel, opts.connect_timeout, TcpStream::connect(addr)).await {
            IoOutcome::Done(stream) => return Ok((stream, *addr)),
            IoOutcome::Cancelled => return Err(FtpError::cancelled("Connect cancelled")),
            IoOutcome::TimedOut => {
                log::debug!("Connect to {} timed out", shown);
                last_err = FtpError::timeout(format!("Timed out connecting to {}", shown));
            }
            IoOutcome::Failed(e) => {
                log::debug!("Connect to {} failed: {}", shown, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
pub(crate) fn forget_host(host: &str) {
    if let Ok(mut cache) = HOST_CACHE.lock() {
        cache.remove(host);
    }
}
