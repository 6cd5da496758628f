//! Runtime capability memo for one logical control connection.
//!
//! Everything here is learned from the server while connected. A fresh
//! connect starts from [`ConnectionState::reset`]; a parallel clone starts
//! from [`ConnectionState::copy_from`], which only carries over the flags
//! that describe the remote server itself.

use crate::ftp::types::{DataType, HashAlgorithm};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// EPSV was refused, AutoPassive goes straight to PASV.
    pub epsv_not_supported: bool,
    /// SIZE is refused in ASCII mode, switch to binary first.
    pub file_size_ascii_not_supported: bool,
    /// `LIST -R` is honoured by the server.
    pub recursive_list_supported: bool,
    /// Cached PWD result, cleared on CWD.
    pub last_working_dir: Option<String>,
    /// Algorithm last selected with `OPTS HASH`.
    pub last_hash_algorithm: HashAlgorithm,
    /// AUTH TLS was attempted and failed during the last connect.
    pub ftps_failure: bool,
    /// `OPTS UTF8 ON` was accepted.
    pub utf8_success: bool,
    /// TYPE currently in effect on the server.
    pub current_data_type: DataType,
}

impl ConnectionState {
    /// State for a brand new connect attempt.
    pub fn reset() -> Self {
        Self::default()
    }

    /// State for reconnecting the same session: keeps the working
    /// directory and the TYPE the caller was using.
    pub fn reset_for_reconnect(&self) -> Self {
        Self {
            last_working_dir: self.last_working_dir.clone(),
            current_data_type: self.current_data_type,
            ..Self::default()
        }
    }

    /// `self` with the three server capability flags taken from `source`.
    pub fn copy_from(&self, source: &ConnectionState) -> Self {
        Self {
            epsv_not_supported: source.epsv_not_supported,
            file_size_ascii_not_supported: source.file_size_ascii_not_supported,
            recursive_list_supported: source.recursive_list_supported,
            ..self.clone()
        }
    }
}
