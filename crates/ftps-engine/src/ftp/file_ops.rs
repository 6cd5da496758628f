//! File-level operations: size, listing, upload, download, append, resume.
//!
//! Streaming loops size their chunks with `compute_chunk_size` and pace
//! themselves with a `RateLimiter` when a rate limit is configured.

use crate::ftp::client::FtpClient;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::state::ConnectionState;
use crate::ftp::tuner::{
    compute_append_offset, compute_chunk_size, RateLimiter, RATE_CONTROL_RESOLUTION_MS,
};
use crate::ftp::types::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// What an upload or download ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    /// Bytes moved over the data connection.
    Transferred(u64),
    /// Nothing to do: the remote file exists or is already complete.
    Skipped,
}

/// Listing command chosen for a set of [`ListOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingCommand {
    /// Answered on the control connection (`STAT -l`).
    Control(String),
    /// Needs a data connection.
    Data(String),
}

impl ListingCommand {
    pub fn command(&self) -> &str {
        match self {
            Self::Control(c) | Self::Data(c) => c,
        }
    }
}

/// Pick the listing command for `path`.
pub fn listing_command(
    path: &str,
    options: ListOptions,
    features: &ServerFeatures,
    state: &ConnectionState,
) -> ListingCommand {
    let recursive = options.recursive && state.recursive_list_supported;

    let mut cmd = if options.use_stat {
        "STAT -l".to_string()
    } else if features.mlsd && !options.force_list {
        "MLSD".to_string()
    } else if options.use_ls {
        "LS".to_string()
    } else if options.name_list {
        "NLST".to_string()
    } else {
        let mut flags = String::new();
        if options.all_files {
            flags.push('a');
        }
        if recursive {
            flags.push('R');
        }
        if flags.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST -{}", flags)
        }
    };

    if !options.no_path && !path.is_empty() {
        cmd.push(' ');
        cmd.push_str(path);
    }

    if options.use_stat {
        ListingCommand::Control(cmd)
    } else {
        ListingCommand::Data(cmd)
    }
}

/// Reply text meaning SIZE only works in binary mode.
fn size_refused_in_ascii(message: &str) -> bool {
    message.to_lowercase().contains("not allowed in ascii")
}

fn is_resumable(e: &FtpError) -> bool {
    matches!(
        e.kind,
        FtpErrorKind::Disconnected | FtpErrorKind::Timeout | FtpErrorKind::DataChannelFailed
    )
}

/// How an upload will be sent.
#[derive(Debug, Default)]
struct UploadPlan {
    append: bool,
    local_offset: u64,
    remote_len: Option<u64>,
}

impl FtpClient {
    // ─── SIZE ────────────────────────────────────────────────────

    /// Remote file size, or `None` when the server does not advertise SIZE
    /// or refuses it for this path.
    ///
    /// Servers that refuse SIZE in ASCII mode are remembered; later calls
    /// switch to binary first.
    pub async fn file_size(&mut self, path: &str) -> FtpResult<Option<u64>> {
        if !self.features().size {
            return Ok(None);
        }
        if self.state().file_size_ascii_not_supported {
            self.set_data_type(DataType::Binary).await?;
        }

        let mut reply = self.execute(&format!("SIZE {}", path)).await?;
        if !reply.is_success()
            && !self.state().file_size_ascii_not_supported
            && size_refused_in_ascii(reply.message())
        {
            self.state_mut().file_size_ascii_not_supported = true;
            self.set_data_type(DataType::Binary).await?;
            reply = self.execute(&format!("SIZE {}", path)).await?;
        }

        if !reply.is_success() {
            return Ok(None);
        }
        Ok(reply.message().trim().parse::<u64>().ok())
    }

    // ─── LISTING ─────────────────────────────────────────────────

    /// Raw listing lines for `path`, for an external parser.
    pub async fn get_listing(
        &mut self,
        path: &str,
        options: ListOptions,
    ) -> FtpResult<Vec<String>> {
        let cmd = listing_command(path, options, self.features(), self.state());
        log::debug!("Listing {} with {}", path, cmd.command());

        match cmd {
            ListingCommand::Control(c) => {
                let reply = self.execute(&c).await?.ensure_success()?;
                let n = reply.lines.len();
                let body = if n > 2 { &reply.lines[1..n - 1] } else { &[][..] };
                Ok(body
                    .iter()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect())
            }
            ListingCommand::Data(c) => {
                self.set_data_type(DataType::Ascii).await?;
                let mut channel = match self.open_data_channel(&c, 0).await {
                    Ok(ch) => ch,
                    // Some servers answer NLST on an empty directory with 550.
                    Err(e)
                        if c.starts_with("NLST")
                            && e.code == Some(550)
                            && e.message.contains("No files found") =>
                    {
                        return Ok(Vec::new())
                    }
                    Err(e) => return Err(e),
                };
                let read = channel.read_to_end().await;
                let closed = channel.close().await;
                let raw = read?;
                closed?;
                Ok(String::from_utf8_lossy(&raw)
                    .lines()
                    .map(|l| l.trim_end_matches('\r').to_string())
                    .filter(|l| !l.is_empty())
                    .collect())
            }
        }
    }

    // ─── DOWNLOAD (RETR) ─────────────────────────────────────────

    /// Download a remote file to a local path, creating parent directories.
    ///
    /// With `resume`, an existing local file is continued with `REST`.
    /// Returns the bytes received by this call.
    pub async fn download_file(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
    ) -> FtpResult<u64> {
        let offset = if resume {
            fs::metadata(local_path).await.map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let mut file = if offset > 0 {
            fs::OpenOptions::new().append(true).open(local_path).await?
        } else {
            if let Some(parent) = local_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::File::create(local_path).await?
        };

        let received = self.download_stream(&mut file, remote_path, offset).await?;
        file.flush().await?;
        Ok(received)
    }

    /// Download into `writer`, starting at `restart` on the server side.
    ///
    /// A connection lost midway is resumed from the bytes already written,
    /// up to `retry_attempts` times.
    pub async fn download_stream<W>(
        &mut self,
        writer: &mut W,
        remote_path: &str,
        restart: u64,
    ) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.set_data_type(DataType::Binary).await?;

        let mut written = 0u64;
        let mut retries = 0;
        loop {
            match self.receive_once(writer, remote_path, restart + written, &mut written).await {
                Ok(()) => return Ok(written),
                Err(e) if retries < self.config().retry_attempts && is_resumable(&e) => {
                    retries += 1;
                    log::warn!(
                        "Download of {} interrupted after {} bytes, resuming ({}/{}): {}",
                        remote_path,
                        written,
                        retries,
                        self.config().retry_attempts,
                        e
                    );
                    if !self.is_alive().await {
                        self.reconnect().await?;
                        self.set_data_type(DataType::Binary).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn receive_once<W>(
        &mut self,
        writer: &mut W,
        remote_path: &str,
        offset: u64,
        written: &mut u64,
    ) -> FtpResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut limiter = RateLimiter::new(self.config().download_rate_limit_kib);
        let chunk = compute_chunk_size(
            self.config().transfer_chunk_size,
            limiter.bytes_per_sec(),
            RATE_CONTROL_RESOLUTION_MS,
        );
        let mut channel = self.open_data_channel(&format!("RETR {}", remote_path), offset).await?;
        channel.set_position(offset);

        let mut buf = vec![0u8; chunk];
        let copied = async {
            loop {
                let n = channel.read(&mut buf).await.into_result("Data channel read")?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).await?;
                *written += n as u64;
                limiter.throttle(n).await;
            }
            writer.flush().await?;
            Ok::<(), FtpError>(())
        }
        .await;

        log::debug!("{} received up to byte {}", remote_path, channel.position());
        let closed = channel.close().await;
        copied?;
        closed?;
        Ok(())
    }

    // ─── UPLOAD (STOR / APPE) ────────────────────────────────────

    /// Upload a local file, handling an existing remote file per `exists`.
    pub async fn upload_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        exists: RemoteExists,
    ) -> FtpResult<TransferStatus> {
        let mut file = fs::File::open(local_path).await?;
        let local_len = file.metadata().await?.len();

        let Some(plan) = self.plan_upload(remote_path, exists).await? else {
            log::info!("Skipping {}, it already exists", remote_path);
            return Ok(TransferStatus::Skipped);
        };
        if exists.is_resume() && plan.remote_len == Some(local_len) {
            log::info!("Skipping {}, it is already fully uploaded", remote_path);
            return Ok(TransferStatus::Skipped);
        }
        if plan.local_offset > local_len {
            return Err(FtpError::transfer_failed(format!(
                "Remote file {} is larger than the local file",
                remote_path
            )));
        }
        if plan.local_offset > 0 {
            file.seek(std::io::SeekFrom::Start(plan.local_offset)).await?;
        }

        let sent = self.send_stream(&mut file, remote_path, plan.append).await?;
        Ok(TransferStatus::Transferred(sent))
    }

    /// Upload from a reader. Resuming needs a seekable source, so
    /// `Resume` modes are rejected here.
    pub async fn upload_stream<R>(
        &mut self,
        reader: &mut R,
        remote_path: &str,
        exists: RemoteExists,
    ) -> FtpResult<TransferStatus>
    where
        R: AsyncRead + Unpin + Send,
    {
        if exists.is_resume() {
            return Err(FtpError::invalid_config(
                "Resuming an upload needs a seekable source, use upload_file",
            ));
        }
        let Some(plan) = self.plan_upload(remote_path, exists).await? else {
            log::info!("Skipping {}, it already exists", remote_path);
            return Ok(TransferStatus::Skipped);
        };
        let sent = self.send_stream(reader, remote_path, plan.append).await?;
        Ok(TransferStatus::Transferred(sent))
    }

    /// `None` means skip the upload.
    async fn plan_upload(
        &mut self,
        remote_path: &str,
        exists: RemoteExists,
    ) -> FtpResult<Option<UploadPlan>> {
        self.set_data_type(DataType::Binary).await?;

        let mut plan = UploadPlan::default();
        match exists {
            RemoteExists::Skip => {
                if self.file_size(remote_path).await?.is_some() {
                    return Ok(None);
                }
            }
            _ if exists.is_append() => {
                let remote_len = self.file_size(remote_path).await?;
                let position = remote_len.unwrap_or(0);
                plan.remote_len = remote_len;
                plan.local_offset = compute_append_offset(exists, position);
                plan.append = position > 0
                    || matches!(
                        exists,
                        RemoteExists::ResumeNoCheck | RemoteExists::AddToEndNoCheck
                    );
            }
            _ => {}
        }
        Ok(Some(plan))
    }

    async fn send_stream<R>(
        &mut self,
        reader: &mut R,
        remote_path: &str,
        append: bool,
    ) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut limiter = RateLimiter::new(self.config().upload_rate_limit_kib);
        let chunk = compute_chunk_size(
            self.config().transfer_chunk_size,
            limiter.bytes_per_sec(),
            RATE_CONTROL_RESOLUTION_MS,
        );
        let verb = if append { "APPE" } else { "STOR" };
        let mut channel = self.open_data_channel(&format!("{} {}", verb, remote_path), 0).await?;

        let mut buf = vec![0u8; chunk];
        let copied = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                channel.write(&buf[..n]).await.into_result("Data channel write")?;
                limiter.throttle(n).await;
            }
            Ok::<(), FtpError>(())
        }
        .await;

        let sent = channel.position();
        let closed = channel.close().await;
        copied?;
        closed?;
        Ok(sent)
    }
}
