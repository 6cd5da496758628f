//! **ftps-engine** — FTP/FTPS client connection and transfer engine.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`ftp::types`] | Enums, configuration, profiles, replies |
//! | [`ftp::error`] | FTP error type and reply classification |
//! | [`ftp::transport`] | Multi-address TCP transport with liveness and guarded I/O |
//! | [`ftp::tls`] | Encryption layer, TLS provider boundary, certificate validation |
//! | [`ftp::state`] | Per-connection capability memo |
//! | [`ftp::data_channel`] | Per-command data connection |
//! | [`ftp::tuner`] | Chunk sizing, append offsets, rate limiting |
//! | [`ftp::negotiate`] | FTPS auto-detection |
//! | [`ftp::client`] | The control connection |

pub mod ftp;

pub use ftp::*;
