//! Control-channel codec (RFC 959 §4) on top of a `Transport`.
//!
//! Handles:
//! - Sending commands terminated with `\r\n` (passwords masked in logs)
//! - Reading single-line and multi-line replies
//! - Parsing the 3-digit reply code and the PWD reply

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::transport::Transport;
use crate::ftp::types::FtpReply;
use std::borrow::Cow;

/// Send a raw FTP command (without trailing CRLF, we add it).
pub async fn send_command(transport: &mut Transport, cmd: &str) -> FtpResult<()> {
    log::trace!(">>> {}", mask_command(cmd));
    let line = format!("{}\r\n", cmd);
    transport
        .write_all(line.as_bytes())
        .await
        .into_result("Control channel write")?;
    transport.flush().await.into_result("Control channel flush")
}

/// Read a complete FTP reply (possibly multi-line).
///
/// Multi-line replies look like:
/// ```text
/// 220-Welcome to my FTP server
/// 220-This is line 2
/// 220 End of greeting
/// ```
pub async fn read_reply(transport: &mut Transport) -> FtpResult<FtpReply> {
    let first = transport.read_line().await?;
    let code = parse_code(&first)?;
    let mut lines = vec![first];

    if lines[0].as_bytes().get(3) == Some(&b'-') {
        let terminator = format!("{} ", code);
        loop {
            let next = transport.read_line().await?;
            let done = next.starts_with(&terminator) || next == code.to_string();
            lines.push(next);
            if done {
                break;
            }
        }
    }

    let reply = FtpReply { code, lines };
    log::trace!("<<< {}", reply.lines.last().map(String::as_str).unwrap_or(""));
    Ok(reply)
}

/// Send a command and return the reply, whatever its code.
pub async fn execute(transport: &mut Transport, cmd: &str) -> FtpResult<FtpReply> {
    send_command(transport, cmd).await?;
    read_reply(transport).await
}

/// Parse the 3-digit reply code from the start of a line.
pub fn parse_code(line: &str) -> FtpResult<u16> {
    let digits = line
        .get(..3)
        .ok_or_else(|| FtpError::protocol_error(format!("Reply too short: '{}'", line)))?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)));
    }
    digits
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}

/// Extract the quoted directory from a `257 "/path" is current` reply.
pub fn parse_pwd(reply: &FtpReply) -> Option<String> {
    let text = reply.lines.last()?;
    let start = text.find('"')?;
    let rest = &text[start + 1..];
    // Embedded quotes are doubled.
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                out.push('"');
                chars.next();
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}

/// Command text safe to log.
pub fn mask_command(cmd: &str) -> Cow<'_, str> {
    if cmd.get(..5).is_some_and(|verb| verb.eq_ignore_ascii_case("PASS ")) {
        Cow::Borrowed("PASS ***")
    } else {
        Cow::Borrowed(cmd)
    }
}
