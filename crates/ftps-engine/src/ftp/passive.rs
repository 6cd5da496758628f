//! Data connection negotiation.
//!
//! Supports the four modes (RFC 959 + RFC 2428) plus the automatic one:
//! - **PASV**: server opens a port, client connects
//! - **EPSV**: extended passive (IPv6-ready)
//! - **AutoPassive**: EPSV, falling back to PASV when an IPv4 server refuses it
//! - **PORT**: client opens a port, tells server
//! - **EPRT**: extended active (IPv6-ready)
//!
//! Each function issues `REST` (when restarting) and the transfer command
//! itself, returning the connected data transport and the command's reply.

use crate::ftp::client::FtpClient;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::transport::{guard, IoOutcome, Transport};
use crate::ftp::types::{DataConnectionType, FtpReply, IpVersion};
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;

/// Open a data connection in the style given by `style`.
pub(crate) async fn open(
    client: &mut FtpClient,
    style: DataConnectionType,
    command: &str,
    restart: u64,
) -> FtpResult<(Transport, FtpReply)> {
    match style {
        DataConnectionType::Active | DataConnectionType::ExtendedActive => {
            open_active(client, style, command, restart).await
        }
        _ => open_passive(client, style, command, restart).await,
    }
}

// ─── Passive ─────────────────────────────────────────────────────────

async fn open_passive(
    client: &mut FtpClient,
    style: DataConnectionType,
    command: &str,
    restart: u64,
) -> FtpResult<(Transport, FtpReply)> {
    let control_ip = client
        .control_remote_addr()
        .ok_or_else(FtpError::not_connected)?
        .ip();
    let on_ipv4 = IpVersion::of(&control_ip) == IpVersion::V4;
    let mut style = style;

    let target = loop {
        let extended = matches!(
            style,
            DataConnectionType::ExtendedPassive | DataConnectionType::AutoPassive
        );
        if extended && !client.state().epsv_not_supported {
            let reply = client.execute("EPSV").await?;
            if !reply.is_success() {
                if reply.is_negative() && style == DataConnectionType::AutoPassive && on_ipv4 {
                    log::debug!("EPSV refused ({}), using PASV from now on", reply.code);
                    client.state_mut().epsv_not_supported = true;
                    style = DataConnectionType::Passive;
                    continue;
                }
                return Err(reply.into_error());
            }
            let port = parse_epsv_reply(&reply.text())?;
            break SocketAddr::new(control_ip, port);
        }

        if !on_ipv4 {
            return Err(FtpError::data_channel(
                "Only IPv4 is supported by the PASV command, use EPSV instead",
            ));
        }
        if client.features().pret {
            client.execute(&format!("PRET {}", command)).await?;
        }
        let reply = client.execute("PASV").await?.ensure_success()?;
        let addr = parse_pasv_reply(&reply.text())?;
        // Servers behind NAT often advertise an unroutable address.
        let ip = if addr.ip().is_unspecified() || client.config().behind_proxy {
            control_ip
        } else {
            addr.ip()
        };
        break SocketAddr::new(ip, addr.port());
    };

    let opts = client.data_transport_options();
    let transport = Transport::connect(
        &target.ip().to_string(),
        target.port(),
        opts,
        client.data_cancel_token(),
    )
    .await
    .map_err(|e| {
        if e.is(crate::ftp::error::FtpErrorKind::Cancelled) {
            e
        } else {
            FtpError::data_channel(format!("Data connection failed: {}", e.message))
        }
    })?;

    let reply = send_transfer_command(client, command, restart).await?;
    Ok((transport, reply))
}

// ─── Active ──────────────────────────────────────────────────────────

async fn open_active(
    client: &mut FtpClient,
    style: DataConnectionType,
    command: &str,
    restart: u64,
) -> FtpResult<(Transport, FtpReply)> {
    let bind_ip: IpAddr = match &client.config().active_bind_address {
        Some(addr) => addr
            .parse()
            .map_err(|_| {
                FtpError::invalid_config(format!("Invalid active bind address '{}'", addr))
            })?,
        None => client
            .control_local_addr()
            .ok_or_else(FtpError::not_connected)?
            .ip(),
    };
    let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))
        .await
        .map_err(|e| FtpError::data_channel(format!("Active bind: {}", e)))?;
    let local = listener
        .local_addr()
        .map_err(|e| FtpError::data_channel(format!("Active local_addr: {}", e)))?;

    let cmd = match style {
        DataConnectionType::Active => format_port_command(local)?,
        _ => format_eprt_command(local),
    };
    client.execute(&cmd).await?.ensure_success()?;

    let reply = send_transfer_command(client, command, restart).await?;

    let opts = client.data_transport_options();
    let cancel = client.data_cancel_token();
    let (stream, peer) = match guard(&cancel, opts.connect_timeout, listener.accept()).await {
        IoOutcome::Done(accepted) => accepted,
        IoOutcome::Cancelled => {
            return Err(FtpError::cancelled("Waiting for data connection cancelled"))
        }
        IoOutcome::TimedOut => {
            return Err(FtpError::data_channel("Server did not open the data connection in time"))
        }
        IoOutcome::Failed(e) => {
            return Err(FtpError::data_channel(format!("Active accept: {}", e.message)))
        }
    };
    log::debug!("Accepted data connection from port {}", peer.port());
    let host = client.config().host.clone();
    Ok((Transport::from_stream(stream, &host, opts, cancel), reply))
}

async fn send_transfer_command(
    client: &mut FtpClient,
    command: &str,
    restart: u64,
) -> FtpResult<FtpReply> {
    if restart > 0 {
        client.execute(&format!("REST {}", restart)).await?.ensure_success()?;
    }
    client.execute(command).await?.ensure_success()
}

// ─── Reply parsing / command formatting ──────────────────────────────

/// Parse `(h1,h2,h3,h4,p1,p2)` from a 227 reply.
pub fn parse_pasv_reply(text: &str) -> FtpResult<SocketAddr> {
    let re = Regex::new(r"(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+),\s*(\d+)")
        .map_err(|e| FtpError::protocol_error(e.to_string()))?;
    let caps = re
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;

    let nums = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + (nums[5] as u16);
    Ok(SocketAddr::new(ip, port))
}

/// Parse the port from `229 Entering Extended Passive Mode (|||port|)`.
pub fn parse_epsv_reply(text: &str) -> FtpResult<u16> {
    let re = Regex::new(r"\((.)(.)(.)(\d+)(.)\)")
        .map_err(|e| FtpError::protocol_error(e.to_string()))?;
    let caps = re
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse EPSV: {}", text)))?;
    caps[4]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error("EPSV port out of range"))
}

/// `PORT h1,h2,h3,h4,p1,p2`. IPv4 only.
pub fn format_port_command(addr: SocketAddr) -> FtpResult<String> {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .ok_or_else(|| FtpError::data_channel("PORT requires IPv4, use EPRT instead"))?,
    };
    let o = ip.octets();
    let port = addr.port();
    Ok(format!(
        "PORT {},{},{},{},{},{}",
        o[0],
        o[1],
        o[2],
        o[3],
        port / 256,
        port % 256
    ))
}

/// `EPRT |af|ip|port|` (1 = IPv4, 2 = IPv6).
pub fn format_eprt_command(addr: SocketAddr) -> String {
    let af = match IpVersion::of(&addr.ip()) {
        IpVersion::V4 => 1,
        IpVersion::V6 => 2,
    };
    format!("EPRT |{}|{}|{}|", af, addr.ip(), addr.port())
}
