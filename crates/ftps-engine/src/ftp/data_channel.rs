//! A data connection opened for exactly one command.
//!
//! The channel mutably borrows its control connection, so a second data
//! operation cannot start on the same control connection until this one is
//! closed or dropped. Closing always hands the opening reply back to the
//! control connection so it can consume the command's final status reply.

use crate::ftp::client::FtpClient;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::transport::{IoOutcome, Transport};
use crate::ftp::types::FtpReply;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The control-connection side of a data transfer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplyChannel: Send {
    /// Read the final reply for the command whose opening reply is
    /// `opening`. A completion reply (2xx) is already final.
    async fn complete_transfer(&mut self, opening: FtpReply) -> FtpResult<FtpReply>;

    /// The channel was dropped without `close`; the final reply must be
    /// drained before the next command.
    fn mark_reply_pending(&mut self, opening: FtpReply);
}

pub struct DataChannel<'a, C: ReplyChannel = FtpClient> {
    control: &'a mut C,
    transport: Transport,
    opening: Option<FtpReply>,
    position: u64,
}

impl<'a, C: ReplyChannel> DataChannel<'a, C> {
    pub fn new(control: &'a mut C, transport: Transport, opening: FtpReply) -> Self {
        Self {
            control,
            transport,
            opening: Some(opening),
            position: 0,
        }
    }

    /// Bytes moved through this channel so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Start counting from `offset` (restarted transfers).
    pub fn set_position(&mut self, offset: u64) {
        self.position = offset;
    }

    pub fn is_open(&self) -> bool {
        self.opening.is_some()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.transport.cancellation_token()
    }

    /// Read into `buf`. `Done(0)` means the server finished sending.
    pub async fn read(&mut self, buf: &mut [u8]) -> IoOutcome<usize> {
        let outcome = self.transport.read(buf).await;
        if let IoOutcome::Done(n) = outcome {
            self.position += n as u64;
        }
        outcome
    }

    pub async fn write(&mut self, data: &[u8]) -> IoOutcome<()> {
        let outcome = self.transport.write_all(data).await;
        if let IoOutcome::Done(()) = outcome {
            self.position += data.len() as u64;
        }
        outcome
    }

    /// Read until end-of-stream.
    pub async fn read_to_end(&mut self) -> FtpResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match self.read(&mut buf).await.into_result("Data channel read")? {
                0 => return Ok(out),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Close the socket, then let the control connection consume the final
    /// reply. Returns that reply on the first call and `None` afterwards.
    ///
    /// A failure to shut the socket down is logged; the final reply decides
    /// the outcome.
    pub async fn close(&mut self) -> FtpResult<Option<FtpReply>> {
        let Some(opening) = self.opening.take() else {
            return Ok(None);
        };
        if let Err(e) = self.transport.shutdown().await {
            log::warn!("Data channel shutdown failed: {}", e);
        }
        self.control.complete_transfer(opening).await.map(Some)
    }

    /// Close and require a final reply.
    pub async fn finish(mut self) -> FtpResult<FtpReply> {
        self.close()
            .await?
            .ok_or_else(|| FtpError::protocol_error("Data channel was already closed"))
    }
}

impl<'a, C: ReplyChannel> Drop for DataChannel<'a, C> {
    fn drop(&mut self) {
        if let Some(opening) = self.opening.take() {
            self.transport.close();
            self.control.mark_reply_pending(opening);
        }
    }
}
