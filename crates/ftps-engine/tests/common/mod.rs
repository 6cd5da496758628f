//! Scripted loopback FTP server for integration tests.
//!
//! Speaks enough RFC 959 for the client flows under test: login, FEAT,
//! PASV/EPSV/PORT/EPRT, REST, SIZE, RETR, STOR, APPE, LIST/NLST/MLSD. With
//! a TLS config it also does `AUTH TLS` (or implicit TLS), PBSZ/PROT, TLS
//! data channels and `CCC`; without one `AUTH TLS` is refused.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub const USER: &str = "demo";
pub const PASSWORD: &str = "secret";

/// TLS 1.2 server config with the self-signed certificate in `tests/data`.
pub fn tls_config() -> Arc<rustls::ServerConfig> {
    let mut cert_pem = &include_bytes!("../data/server.crt")[..];
    let mut key_pem = &include_bytes!("../data/server.key")[..];
    let certs = rustls_pemfile::certs(&mut cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut key_pem).unwrap().unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    Arc::new(config)
}

#[derive(Debug, Clone)]
pub struct Script {
    pub epsv: bool,
    pub features: Vec<&'static str>,
    /// Refuse SIZE while TYPE A is in effect.
    pub size_binary_only: bool,
    pub greeting: &'static str,
    /// Offer TLS with this config.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// TLS from the first byte instead of `AUTH TLS`.
    pub implicit: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            epsv: true,
            features: vec!["SIZE", "UTF8", "REST STREAM", "EPSV"],
            size_binary_only: false,
            greeting: "220 Loopback test server ready",
            tls: None,
            implicit: false,
        }
    }
}

pub type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

pub struct MockFtpServer {
    pub port: u16,
    pub files: Files,
    commands: Arc<Mutex<Vec<String>>>,
    listing: Arc<Mutex<Vec<String>>>,
    data_handshakes: Arc<Mutex<Vec<Option<rustls::HandshakeKind>>>>,
    task: JoinHandle<()>,
}

impl MockFtpServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let files: Files = Arc::default();
        let commands: Arc<Mutex<Vec<String>>> = Arc::default();
        let data_handshakes: Arc<Mutex<Vec<Option<rustls::HandshakeKind>>>> = Arc::default();
        let listing = Arc::new(Mutex::new(vec![
            "-rw-r--r-- 1 ftp ftp 5 Jan 01 00:00 a.txt".to_string(),
            "drwxr-xr-x 2 ftp ftp 0 Jan 01 00:00 pub".to_string(),
        ]));

        let task = {
            let files = files.clone();
            let commands = commands.clone();
            let listing = listing.clone();
            let data_handshakes = data_handshakes.clone();
            tokio::spawn(async move {
                while let Ok((sock, _)) = listener.accept().await {
                    let session = Session {
                        acceptor: script.tls.clone().map(TlsAcceptor::from),
                        script: script.clone(),
                        files: files.clone(),
                        commands: commands.clone(),
                        listing: listing.clone(),
                        data_handshakes: data_handshakes.clone(),
                        cwd: "/".into(),
                        ascii: true,
                        rest: 0,
                        protected: false,
                        passive: None,
                        active: None,
                    };
                    tokio::spawn(session.run(sock));
                }
            })
        };

        Self {
            port,
            files,
            commands,
            listing,
            data_handshakes,
            task,
        }
    }

    /// How each TLS data connection was negotiated, in order.
    pub fn data_handshakes(&self) -> Vec<Option<rustls::HandshakeKind>> {
        self.data_handshakes.lock().unwrap().clone()
    }

    pub fn put_file(&self, path: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), data);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Every command received so far, across sessions.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
    }
}

impl Drop for MockFtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A plain or TLS socket, control or data.
enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type Control = BufReader<Conn>;

struct Session {
    script: Script,
    acceptor: Option<TlsAcceptor>,
    files: Files,
    commands: Arc<Mutex<Vec<String>>>,
    listing: Arc<Mutex<Vec<String>>>,
    data_handshakes: Arc<Mutex<Vec<Option<rustls::HandshakeKind>>>>,
    cwd: String,
    ascii: bool,
    rest: u64,
    /// `PROT P` is in effect.
    protected: bool,
    passive: Option<TcpListener>,
    active: Option<SocketAddr>,
}

impl Session {
    async fn run(mut self, sock: TcpStream) {
        let _ = self.serve(sock).await;
    }

    async fn serve(&mut self, sock: TcpStream) -> io::Result<()> {
        let conn = match &self.acceptor {
            Some(acceptor) if self.script.implicit => {
                Conn::Tls(Box::new(acceptor.accept(sock).await?))
            }
            _ => Conn::Plain(sock),
        };
        let mut w: Control = BufReader::new(conn);
        reply(&mut w, self.script.greeting).await?;

        loop {
            let mut line = String::new();
            if w.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            self.commands.lock().unwrap().push(line.clone());
            let (verb, arg) = match line.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
                None => (line.to_ascii_uppercase(), String::new()),
            };

            match verb.as_str() {
                "AUTH" if self.acceptor.is_some() => {
                    reply(&mut w, "234 Proceed with negotiation").await?;
                    w = BufReader::new(self.secure(w.into_inner()).await?);
                }
                "AUTH" => reply(&mut w, "500 AUTH not understood").await?,
                "PBSZ" => reply(&mut w, "200 PBSZ=0").await?,
                "PROT" => {
                    self.protected = arg.eq_ignore_ascii_case("P");
                    reply(&mut w, "200 Protection level set").await?
                }
                "CCC" => {
                    reply(&mut w, "200 Control channel cleared").await?;
                    w = BufReader::new(clear(w.into_inner()).await?);
                }
                "USER" => reply(&mut w, "331 Password required").await?,
                "PASS" if arg == PASSWORD => reply(&mut w, "230 Logged in").await?,
                "PASS" => reply(&mut w, "530 Login incorrect").await?,
                "FEAT" => {
                    let mut text = String::from("211-Features:\r\n");
                    for f in &self.script.features {
                        text.push_str(&format!(" {}\r\n", f));
                    }
                    text.push_str("211 End");
                    reply(&mut w, &text).await?;
                }
                "OPTS" => reply(&mut w, "200 Always in UTF8 mode").await?,
                "SYST" => reply(&mut w, "215 UNIX Type: L8").await?,
                "PWD" => {
                    let text = format!("257 \"{}\" is the current directory", self.cwd);
                    reply(&mut w, &text).await?
                }
                "CWD" => {
                    self.cwd = arg;
                    reply(&mut w, "250 Directory changed").await?
                }
                "TYPE" => {
                    self.ascii = arg.eq_ignore_ascii_case("A");
                    reply(&mut w, "200 Type set").await?
                }
                "NOOP" => reply(&mut w, "200 NOOP ok").await?,
                "EPSV" if !self.script.epsv => reply(&mut w, "502 EPSV not implemented").await?,
                "EPSV" => {
                    let port = self.listen().await?;
                    let text = format!("229 Entering Extended Passive Mode (|||{}|)", port);
                    reply(&mut w, &text).await?
                }
                "PASV" => {
                    let port = self.listen().await?;
                    reply(
                        &mut w,
                        &format!(
                            "227 Entering Passive Mode (127,0,0,1,{},{})",
                            port / 256,
                            port % 256
                        ),
                    )
                    .await?
                }
                "PORT" => {
                    let n: Vec<u16> =
                        arg.split(',').filter_map(|p| p.trim().parse().ok()).collect();
                    let addr = format!("{}.{}.{}.{}:{}", n[0], n[1], n[2], n[3], n[4] * 256 + n[5]);
                    self.active = addr.parse().ok();
                    reply(&mut w, "200 PORT command successful").await?
                }
                "EPRT" => {
                    let parts: Vec<&str> = arg.split('|').collect();
                    self.active = format!("{}:{}", parts[2], parts[3]).parse().ok();
                    reply(&mut w, "200 EPRT command successful").await?
                }
                "REST" => {
                    self.rest = arg.parse().unwrap_or(0);
                    reply(&mut w, &format!("350 Restarting at {}", self.rest)).await?
                }
                "SIZE" if self.ascii && self.script.size_binary_only => {
                    reply(&mut w, "550 SIZE not allowed in ASCII mode").await?
                }
                "SIZE" => {
                    let len = self.files.lock().unwrap().get(&arg).map(Vec::len);
                    match len {
                        Some(len) => reply(&mut w, &format!("213 {}", len)).await?,
                        None => reply(&mut w, "550 No such file").await?,
                    }
                }
                "RETR" => {
                    let data = self.files.lock().unwrap().get(&arg).cloned();
                    let Some(data) = data else {
                        self.passive = None;
                        reply(&mut w, "550 No such file").await?;
                        continue;
                    };
                    let start = (self.rest as usize).min(data.len());
                    self.rest = 0;
                    reply(&mut w, "150 Opening BINARY mode data connection").await?;
                    if let Some(mut data_sock) = self.data_connection().await {
                        let _ = data_sock.write_all(&data[start..]).await;
                        let _ = data_sock.shutdown().await;
                    }
                    reply(&mut w, "226 Transfer complete").await?
                }
                "STOR" | "APPE" => {
                    reply(&mut w, "150 Ok to send data").await?;
                    let mut received = Vec::new();
                    if let Some(mut data_sock) = self.data_connection().await {
                        let _ = data_sock.read_to_end(&mut received).await;
                    }
                    {
                        let mut files = self.files.lock().unwrap();
                        let entry = files.entry(arg).or_default();
                        if verb == "STOR" {
                            *entry = received;
                        } else {
                            entry.extend_from_slice(&received);
                        }
                    }
                    reply(&mut w, "226 Transfer complete").await?
                }
                "LIST" | "NLST" | "MLSD" => {
                    reply(&mut w, "150 Here comes the directory listing").await?;
                    let body: String = self
                        .listing
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|l| format!("{}\r\n", l))
                        .collect();
                    if let Some(mut data_sock) = self.data_connection().await {
                        let _ = data_sock.write_all(body.as_bytes()).await;
                        let _ = data_sock.shutdown().await;
                    }
                    reply(&mut w, "226 Directory send OK").await?
                }
                "QUIT" => {
                    reply(&mut w, "221 Goodbye").await?;
                    return Ok(());
                }
                _ => reply(&mut w, "502 Command not implemented").await?,
            }
        }
    }

    async fn secure(&self, conn: Conn) -> io::Result<Conn> {
        match (conn, &self.acceptor) {
            (Conn::Plain(sock), Some(acceptor)) => {
                Ok(Conn::Tls(Box::new(acceptor.accept(sock).await?)))
            }
            (conn, _) => Ok(conn),
        }
    }

    async fn listen(&mut self) -> io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        self.passive = Some(listener);
        Ok(port)
    }

    async fn data_connection(&mut self) -> Option<Conn> {
        let sock = match self.passive.take() {
            Some(listener) => listener.accept().await.ok().map(|(s, _)| s)?,
            None => TcpStream::connect(self.active.take()?).await.ok()?,
        };
        match &self.acceptor {
            Some(acceptor) if self.protected => {
                let tls = acceptor.accept(sock).await.ok()?;
                self.data_handshakes.lock().unwrap().push(tls.get_ref().1.handshake_kind());
                Some(Conn::Tls(Box::new(tls)))
            }
            _ => Some(Conn::Plain(sock)),
        }
    }
}

/// Drop TLS after `CCC`: consume the client's close_notify record straight
/// off the socket and carry on in plaintext.
async fn clear(conn: Conn) -> io::Result<Conn> {
    let Conn::Tls(tls) = conn else {
        return Ok(conn);
    };
    let (mut sock, _) = tls.into_inner();
    let mut header = [0u8; 5];
    sock.read_exact(&mut header).await?;
    let mut record = vec![0u8; u16::from_be_bytes([header[3], header[4]]) as usize];
    sock.read_exact(&mut record).await?;
    Ok(Conn::Plain(sock))
}

async fn reply(w: &mut Control, text: &str) -> io::Result<()> {
    let conn = w.get_mut();
    conn.write_all(format!("{}\r\n", text).as_bytes()).await?;
    conn.flush().await
}
