//! # FTP/FTPS engine
//!
//! Implements the client side of RFC 959 with the extensions the engine
//! needs to talk to real servers:
//! - **RFC 2228 / 4217** — AUTH TLS, PBSZ/PROT, CCC, implicit FTPS
//! - **RFC 2428** — EPSV / EPRT
//! - **RFC 3659** — SIZE, MLSD, REST STREAM
//! - **RFC 2389** — FEAT negotiation
//!
//! Architecture:
//! - `types` — data structures, enums, config
//! - `error` — FTP-specific error type
//! - `transport` — resolved multi-address TCP socket, timeouts, cancellation
//! - `tls` — TLS activation/deactivation over a transport
//! - `state` — runtime capability memo
//! - `protocol` — reply reading over a transport
//! - `passive` — PASV/EPSV/PORT/EPRT negotiation
//! - `data_channel` — data connection tied to its command
//! - `tuner` — chunk size and append offset computation
//! - `client` — stateful control connection
//! - `file_ops` — uploads, downloads, listings
//! - `negotiate` — auto-detection of a working connection profile

pub mod types;
pub mod error;
pub mod transport;
pub mod tls;
pub mod state;
pub mod protocol;
pub mod passive;
pub mod data_channel;
pub mod tuner;
pub mod client;
pub mod file_ops;
pub mod negotiate;

pub use client::FtpClient;
pub use data_channel::{DataChannel, ReplyChannel};
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use file_ops::{listing_command, ListingCommand, TransferStatus};
pub use negotiate::{
    auto_detect, AutoDetectConfig, KnownHostProfile, ProbeAttempt, ProbeOutcome, ProbeTarget,
};
pub use state::ConnectionState;
pub use tls::{
    accept_any_certificate, default_certificate_validation, CertValidator, CertificateChain,
    ClientIdentity, EncryptionLayer, PolicyOutcome, RustlsProvider, SecureChannel, TlsProvider,
};
pub use transport::{IoOutcome, Transport};
pub use tuner::{compute_append_offset, compute_chunk_size, RateLimiter};
pub use types::*;
