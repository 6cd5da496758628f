//! Auto-detection of a working connection profile.
//!
//! Walks encryption modes × TLS versions in priority order against a
//! [`ProbeTarget`], classifying every failure:
//! - an FTPS failure blacklists the whole encryption mode,
//! - a permanent failure (credentials rejected, unknown host, TLS failure,
//!   connect timeout) aborts the search with that error,
//! - anything else moves on to the next combination.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::types::{
    ConnectionProfile, Credentials, DataConnectionType, EncryptionMode, IpVersion, TlsProtocol,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Options for [`auto_detect`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoDetectConfig {
    /// Probe on a disposable clone instead of the caller's connection.
    #[serde(default = "default_true")]
    pub clone_connection: bool,
    /// Stop at the first working profile.
    #[serde(default = "default_true")]
    pub first_only: bool,
    /// Also try implicit FTPS.
    #[serde(default = "default_true")]
    pub include_implicit: bool,
    /// Treat a connect timeout as fatal for the whole search.
    #[serde(default = "default_true")]
    pub abort_on_timeout: bool,
    /// Never fall back to plaintext.
    #[serde(default)]
    pub require_encryption: bool,
    /// TLS versions in the order they are tried.
    #[serde(default = "default_protocols")]
    pub protocol_priority: Vec<TlsProtocol>,
    /// Explicit mode order; empty derives it from the flags above.
    #[serde(default)]
    pub encryption_priority: Vec<EncryptionMode>,
    /// Extra known hosts, checked before the built-in table.
    #[serde(default)]
    pub known_hosts: Vec<KnownHostProfile>,
}

fn default_true() -> bool {
    true
}

fn default_protocols() -> Vec<TlsProtocol> {
    vec![TlsProtocol::Tls12, TlsProtocol::Tls13]
}

impl Default for AutoDetectConfig {
    fn default() -> Self {
        Self {
            clone_connection: true,
            first_only: true,
            include_implicit: true,
            abort_on_timeout: true,
            require_encryption: false,
            protocol_priority: default_protocols(),
            encryption_priority: Vec::new(),
            known_hosts: Vec::new(),
        }
    }
}

impl AutoDetectConfig {
    /// Modes to try: Auto, then None unless encryption is required, then
    /// Implicit when included.
    pub fn encryption_order(&self) -> Vec<EncryptionMode> {
        if !self.encryption_priority.is_empty() {
            return self.encryption_priority.clone();
        }
        let mut order = vec![EncryptionMode::Auto];
        if !self.require_encryption {
            order.push(EncryptionMode::None);
        }
        if self.include_implicit {
            order.push(EncryptionMode::Implicit);
        }
        order
    }
}

/// Hosts whose working configuration is known up front.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnownHostProfile {
    /// Case-insensitive substring of the host name.
    pub host_pattern: String,
    /// Modes worth trying for this host, replacing the normal order.
    pub encryptions: Vec<EncryptionMode>,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub socket_poll_interval_ms: u64,
}

impl KnownHostProfile {
    pub fn matches(&self, host: &str) -> bool {
        host.to_lowercase().contains(&self.host_pattern.to_lowercase())
    }
}

/// Built-in table of known hosts.
pub fn builtin_known_hosts() -> Vec<KnownHostProfile> {
    vec![
        // Azure App Service only answers implicit FTPS and is slow to accept.
        KnownHostProfile {
            host_pattern: "azurewebsites.windows.net".into(),
            encryptions: vec![EncryptionMode::Implicit],
            timeout_ms: 2000,
            retry_attempts: 5,
            socket_poll_interval_ms: 1000,
        },
    ]
}

fn find_known_host(host: &str, extra: &[KnownHostProfile]) -> Option<KnownHostProfile> {
    extra
        .iter()
        .cloned()
        .chain(builtin_known_hosts())
        .find(|k| k.matches(host))
}

// ─── Probe seam ──────────────────────────────────────────────────────

/// One trial connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeAttempt {
    pub host: String,
    pub credentials: Credentials,
    pub encryption: EncryptionMode,
    pub protocol: TlsProtocol,
    /// Use the mode's default port instead of the configured one.
    pub reset_port: bool,
    /// Timeouts and retries to apply for this host, if known.
    pub known_host: Option<KnownHostProfile>,
}

/// What a successful trial connection negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ip_version: IpVersion,
    /// `AUTH TLS` was refused and the session carried on in plaintext.
    pub ftps_failure: bool,
    /// UTF-8 was confirmed by FEAT or `OPTS UTF8 ON`.
    pub utf8_verified: bool,
}

/// Something that can make trial connections, usually an `FtpClient`.
#[async_trait]
pub trait ProbeTarget: Send {
    fn host(&self) -> String;
    fn port(&self) -> u16;
    fn credentials(&self) -> Credentials;
    /// Connect with the attempt's settings.
    async fn try_connect(&mut self, attempt: &ProbeAttempt) -> FtpResult<ProbeOutcome>;
    /// Drop the trial connection. Must be safe when not connected.
    async fn disconnect(&mut self);
}

// ─── Classification ──────────────────────────────────────────────────

/// How a failed attempt affects the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The encryption mode itself is unavailable on this server.
    FtpsFailure,
    /// No other combination can succeed.
    Permanent,
    Transient,
}

pub fn classify_failure(
    mode: EncryptionMode,
    err: &FtpError,
    abort_on_timeout: bool,
) -> FailureClass {
    match mode {
        EncryptionMode::Auto | EncryptionMode::Explicit
            if err.is(FtpErrorKind::SecurityNotAvailable) =>
        {
            return FailureClass::FtpsFailure
        }
        EncryptionMode::Implicit
            if err.is(FtpErrorKind::ConnectionRefused) || err.is(FtpErrorKind::Timeout) =>
        {
            return FailureClass::FtpsFailure
        }
        _ => {}
    }
    match err.kind {
        FtpErrorKind::AuthFailed if err.code == Some(530) => FailureClass::Permanent,
        FtpErrorKind::UnsupportedProtocol
        | FtpErrorKind::TlsFailed
        | FtpErrorKind::HostNotFound
        | FtpErrorKind::Cancelled => FailureClass::Permanent,
        FtpErrorKind::Timeout if abort_on_timeout => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}

/// Result of one attempt, consumed by the search loop.
#[derive(Debug)]
pub enum Step {
    /// Try the next protocol version (or mode).
    Continue,
    /// Blacklist the mode and skip its remaining protocol versions.
    SkipMode,
    Abort(FtpError),
    Success(ConnectionProfile),
}

/// Turn an attempt's result into the next search step.
pub fn step(
    attempt: &ProbeAttempt,
    result: FtpResult<ProbeOutcome>,
    abort_on_timeout: bool,
) -> Step {
    match result {
        Ok(outcome) => Step::Success(build_profile(attempt, &outcome)),
        Err(err) => match classify_failure(attempt.encryption, &err, abort_on_timeout) {
            FailureClass::FtpsFailure => {
                log::debug!("{:?} is not available: {}", attempt.encryption, err);
                Step::SkipMode
            }
            FailureClass::Permanent => Step::Abort(err),
            FailureClass::Transient => {
                log::debug!(
                    "{:?}/{} failed, trying next: {}",
                    attempt.encryption,
                    attempt.protocol,
                    err
                );
                Step::Continue
            }
        },
    }
}

fn build_profile(attempt: &ProbeAttempt, outcome: &ProbeOutcome) -> ConnectionProfile {
    let fell_back = outcome.ftps_failure
        && matches!(attempt.encryption, EncryptionMode::Auto | EncryptionMode::Explicit);
    let known = attempt.known_host.as_ref();
    ConnectionProfile {
        host: attempt.host.clone(),
        credentials: attempt.credentials.clone(),
        encryption: if fell_back { EncryptionMode::None } else { attempt.encryption },
        protocol: attempt.protocol,
        data_connection: match outcome.ip_version {
            IpVersion::V6 => DataConnectionType::ExtendedPassive,
            IpVersion::V4 => DataConnectionType::Passive,
        },
        encoding: "utf-8".into(),
        encoding_verified: outcome.utf8_verified,
        timeout_ms: known.map_or(0, |k| k.timeout_ms),
        retry_attempts: known.map_or(0, |k| k.retry_attempts),
        socket_poll_interval_ms: known.map_or(0, |k| k.socket_poll_interval_ms),
    }
}

// ─── Driver ──────────────────────────────────────────────────────────

/// Search for working profiles on `target`.
///
/// With `config.clone_connection` the target is disconnected after every
/// successful attempt; otherwise the last success is left connected.
pub async fn auto_detect<T: ProbeTarget + ?Sized>(
    target: &mut T,
    config: &AutoDetectConfig,
) -> FtpResult<Vec<ConnectionProfile>> {
    let host = target.host();
    let credentials = target.credentials();
    let known_host = find_known_host(&host, &config.known_hosts);
    let modes = match &known_host {
        Some(k) => {
            log::debug!("{} matches known host pattern '{}'", host, k.host_pattern);
            k.encryptions.clone()
        }
        None => config.encryption_order(),
    };
    let reset_port = matches!(target.port(), 21 | 990);

    let mut blacklist: Vec<EncryptionMode> = Vec::new();
    let mut profiles = Vec::new();

    target.disconnect().await;

    'modes: for mode in modes {
        if blacklist.contains(&mode) {
            continue;
        }
        for (index, protocol) in config.protocol_priority.iter().enumerate() {
            // Plaintext does not depend on the TLS version.
            if mode == EncryptionMode::None && index > 0 {
                continue;
            }
            if mode == EncryptionMode::None {
                log::debug!("Auto-detect trying {:?}", mode);
            } else {
                log::debug!("Auto-detect trying {:?} with {}", mode, protocol);
            }

            let attempt = ProbeAttempt {
                host: host.clone(),
                credentials: credentials.clone(),
                encryption: mode,
                protocol: *protocol,
                reset_port,
                known_host: known_host.clone(),
            };
            let result = target.try_connect(&attempt).await;
            if result.is_err() || config.clone_connection {
                target.disconnect().await;
            }

            match step(&attempt, result, config.abort_on_timeout) {
                Step::Continue => continue,
                Step::SkipMode => {
                    blacklist.push(mode);
                    continue 'modes;
                }
                Step::Abort(err) => {
                    log::debug!("Auto-detect aborted: {}", err);
                    return Err(err);
                }
                Step::Success(profile) => {
                    log::info!(
                        "Auto-detect found {:?} / {} / {:?} for {}",
                        profile.encryption,
                        profile.protocol,
                        profile.data_connection,
                        host
                    );
                    if profile.encryption != mode {
                        blacklist.push(mode);
                    }
                    profiles.push(profile);
                    if config.first_only {
                        break 'modes;
                    }
                    if blacklist.contains(&mode) {
                        continue 'modes;
                    }
                }
            }
        }
    }

    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Script = Box<dyn FnMut(&ProbeAttempt) -> FtpResult<ProbeOutcome> + Send>;

    struct FakeTarget {
        host: String,
        port: u16,
        script: Script,
        attempts: Vec<ProbeAttempt>,
        disconnects: usize,
    }

    impl FakeTarget {
        fn new(host: &str, port: u16, script: Script) -> Self {
            Self {
                host: host.into(),
                port,
                script,
                attempts: Vec::new(),
                disconnects: 0,
            }
        }

        fn tried(&self) -> Vec<(EncryptionMode, TlsProtocol)> {
            self.attempts.iter().map(|a| (a.encryption, a.protocol)).collect()
        }
    }

    #[async_trait]
    impl ProbeTarget for FakeTarget {
        fn host(&self) -> String {
            self.host.clone()
        }
        fn port(&self) -> u16 {
            self.port
        }
        fn credentials(&self) -> Credentials {
            Credentials::new("user", "pass")
        }
        async fn try_connect(&mut self, attempt: &ProbeAttempt) -> FtpResult<ProbeOutcome> {
            self.attempts.push(attempt.clone());
            (self.script)(attempt)
        }
        async fn disconnect(&mut self) {
            self.disconnects += 1;
        }
    }

    fn ok_v4() -> FtpResult<ProbeOutcome> {
        Ok(ProbeOutcome {
            ip_version: IpVersion::V4,
            ftps_failure: false,
            utf8_verified: true,
        })
    }

    #[test]
    fn default_encryption_order() {
        let cfg = AutoDetectConfig::default();
        assert_eq!(
            cfg.encryption_order(),
            vec![EncryptionMode::Auto, EncryptionMode::None, EncryptionMode::Implicit]
        );
        let strict = AutoDetectConfig {
            require_encryption: true,
            include_implicit: false,
            ..AutoDetectConfig::default()
        };
        assert_eq!(strict.encryption_order(), vec![EncryptionMode::Auto]);
    }

    #[tokio::test]
    async fn refused_implicit_is_blacklisted_and_explicit_tls12_wins() {
        let mut target = FakeTarget::new(
            "ftp.example.com",
            21,
            Box::new(|a| match a.encryption {
                EncryptionMode::Implicit => Err(FtpError::connection_refused("refused")),
                EncryptionMode::Explicit if a.protocol == TlsProtocol::Tls12 => ok_v4(),
                _ => Err(FtpError::connection_failed("nope")),
            }),
        );
        let cfg = AutoDetectConfig {
            encryption_priority: vec![EncryptionMode::Implicit, EncryptionMode::Explicit],
            ..AutoDetectConfig::default()
        };

        let profiles = auto_detect(&mut target, &cfg).await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].encryption, EncryptionMode::Explicit);
        assert_eq!(profiles[0].protocol, TlsProtocol::Tls12);
        assert_eq!(profiles[0].data_connection, DataConnectionType::Passive);
        assert_eq!(
            target.tried(),
            vec![
                (EncryptionMode::Implicit, TlsProtocol::Tls12),
                (EncryptionMode::Explicit, TlsProtocol::Tls12),
            ]
        );
    }

    #[tokio::test]
    async fn credential_rejection_aborts_immediately() {
        let mut target = FakeTarget::new(
            "ftp.example.com",
            21,
            Box::new(|_| Err(FtpError::from_reply(530, "530 Login incorrect."))),
        );
        let err = auto_detect(&mut target, &AutoDetectConfig::default()).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::AuthFailed);
        assert_eq!(err.code, Some(530));
        assert_eq!(target.attempts.len(), 1);
    }

    #[tokio::test]
    async fn auth_failure_without_530_is_transient() {
        let mut target = FakeTarget::new(
            "ftp.example.com",
            21,
            Box::new(|a| match a.encryption {
                EncryptionMode::Auto => {
                    Err(FtpError::auth_failed("connection dropped during login"))
                }
                _ => ok_v4(),
            }),
        );
        let profiles = auto_detect(&mut target, &AutoDetectConfig::default()).await.unwrap();
        assert_eq!(profiles[0].encryption, EncryptionMode::None);
        assert_eq!(
            target.tried(),
            vec![
                (EncryptionMode::Auto, TlsProtocol::Tls12),
                (EncryptionMode::Auto, TlsProtocol::Tls13),
                (EncryptionMode::None, TlsProtocol::Tls12),
            ]
        );
    }

    #[tokio::test]
    async fn auto_that_fell_back_to_plaintext_is_recorded_as_none() {
        let mut target = FakeTarget::new(
            "ftp.example.com",
            21,
            Box::new(|_| {
                Ok(ProbeOutcome {
                    ip_version: IpVersion::V6,
                    ftps_failure: true,
                    utf8_verified: false,
                })
            }),
        );
        let cfg = AutoDetectConfig {
            first_only: false,
            include_implicit: false,
            ..AutoDetectConfig::default()
        };
        let profiles = auto_detect(&mut target, &cfg).await.unwrap();

        // Auto is blacklisted after its first success, so Tls13 is not retried.
        assert_eq!(
            target.tried(),
            vec![
                (EncryptionMode::Auto, TlsProtocol::Tls12),
                (EncryptionMode::None, TlsProtocol::Tls12),
            ]
        );
        assert_eq!(profiles.len(), 2);
        assert!(profiles.iter().all(|p| p.encryption == EncryptionMode::None));
        assert!(profiles.iter().all(|p| p.data_connection == DataConnectionType::ExtendedPassive));
        assert!(!profiles[0].encoding_verified);
    }

    #[tokio::test]
    async fn timeouts_follow_abort_flag_but_always_blacklist_implicit() {
        let script = || -> Script {
            Box::new(|a| match a.encryption {
                EncryptionMode::Auto => Err(FtpError::timeout("connect timed out")),
                EncryptionMode::Implicit => Err(FtpError::timeout("connect timed out")),
                _ => Err(FtpError::connection_failed("reset")),
            })
        };

        let mut aborting = FakeTarget::new("h", 21, script());
        let err = auto_detect(&mut aborting, &AutoDetectConfig::default()).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Timeout);
        assert_eq!(aborting.attempts.len(), 1);

        let mut patient = FakeTarget::new("h", 21, script());
        let cfg = AutoDetectConfig {
            abort_on_timeout: false,
            ..AutoDetectConfig::default()
        };
        let profiles = auto_detect(&mut patient, &cfg).await.unwrap();
        assert!(profiles.is_empty());
        assert_eq!(
            patient.tried(),
            vec![
                (EncryptionMode::Auto, TlsProtocol::Tls12),
                (EncryptionMode::Auto, TlsProtocol::Tls13),
                (EncryptionMode::None, TlsProtocol::Tls12),
                (EncryptionMode::Implicit, TlsProtocol::Tls12),
            ]
        );

        let mut implicit_first = FakeTarget::new("h", 21, script());
        let cfg = AutoDetectConfig {
            encryption_priority: vec![EncryptionMode::Implicit, EncryptionMode::None],
            ..AutoDetectConfig::default()
        };
        assert!(auto_detect(&mut implicit_first, &cfg).await.unwrap().is_empty());
        assert_eq!(implicit_first.attempts.len(), 2);
    }

    #[tokio::test]
    async fn security_not_available_skips_the_mode() {
        let mut target = FakeTarget::new(
            "h",
            2121,
            Box::new(|a| match a.encryption {
                EncryptionMode::Explicit => {
                    Err(FtpError::security_not_available("AUTH TLS refused"))
                }
                _ => ok_v4(),
            }),
        );
        let cfg = AutoDetectConfig {
            encryption_priority: vec![EncryptionMode::Explicit, EncryptionMode::None],
            ..AutoDetectConfig::default()
        };
        let profiles = auto_detect(&mut target, &cfg).await.unwrap();
        assert_eq!(profiles[0].encryption, EncryptionMode::None);
        assert_eq!(target.attempts.len(), 2);
        assert!(target.attempts.iter().all(|a| !a.reset_port));
    }

    #[tokio::test]
    async fn known_host_restricts_modes_and_seeds_timeouts() {
        let mut target = FakeTarget::new(
            "waws-prod-xyz.ftp.AzureWebsites.windows.net",
            990,
            Box::new(|_| ok_v4()),
        );
        let profiles = auto_detect(&mut target, &AutoDetectConfig::default()).await.unwrap();
        assert_eq!(target.tried(), vec![(EncryptionMode::Implicit, TlsProtocol::Tls12)]);
        assert!(target.attempts[0].reset_port);
        assert!(target.attempts[0].known_host.is_some());

        let p = &profiles[0];
        assert_eq!(p.encryption, EncryptionMode::Implicit);
        assert_eq!(p.timeout_ms, 2000);
        assert_eq!(p.retry_attempts, 5);
        assert_eq!(p.socket_poll_interval_ms, 1000);
    }

    #[tokio::test]
    async fn caller_known_hosts_take_precedence() {
        let mut target = FakeTarget::new("files.internal.corp", 21, Box::new(|_| ok_v4()));
        let cfg = AutoDetectConfig {
            known_hosts: vec![KnownHostProfile {
                host_pattern: "internal.corp".into(),
                encryptions: vec![EncryptionMode::Explicit],
                timeout_ms: 500,
                retry_attempts: 1,
                socket_poll_interval_ms: 0,
            }],
            ..AutoDetectConfig::default()
        };
        let profiles = auto_detect(&mut target, &cfg).await.unwrap();
        assert_eq!(profiles[0].encryption, EncryptionMode::Explicit);
        assert_eq!(profiles[0].timeout_ms, 500);
    }

    #[tokio::test]
    async fn tls_failure_is_permanent() {
        let mut target = FakeTarget::new(
            "h",
            21,
            Box::new(|_| Err(FtpError::tls_failed("certificate rejected"))),
        );
        let err = auto_detect(&mut target, &AutoDetectConfig::default()).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::TlsFailed);
        assert_eq!(target.attempts.len(), 1);
    }

    #[test]
    fn classification_table() {
        use EncryptionMode::*;
        let refused = FtpError::connection_refused("refused");
        assert_eq!(classify_failure(Implicit, &refused, true), FailureClass::FtpsFailure);
        assert_eq!(classify_failure(Auto, &refused, true), FailureClass::Transient);
        let unsupported = FtpError::unsupported_protocol("alert");
        assert_eq!(classify_failure(Explicit, &unsupported, false), FailureClass::Permanent);
        let host = FtpError::host_not_found("nx");
        assert_eq!(classify_failure(None, &host, false), FailureClass::Permanent);
        let rejected = FtpError::command_rejected(500, "odd");
        assert_eq!(classify_failure(None, &rejected, true), FailureClass::Transient);
    }
}
