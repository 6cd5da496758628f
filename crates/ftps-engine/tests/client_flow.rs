mod common;

use common::{MockFtpServer, Script, PASSWORD, USER};
use ftps_engine::*;
use std::time::Instant;

fn config(server: &MockFtpServer, encryption: EncryptionMode) -> FtpConfig {
    FtpConfig {
        port: server.port,
        encryption,
        read_timeout_ms: 5_000,
        data_read_timeout_ms: 5_000,
        ..FtpConfig::new("127.0.0.1", Credentials::new(USER, PASSWORD))
    }
}

async fn connected(server: &MockFtpServer) -> FtpClient {
    let mut client = FtpClient::new(config(server, EncryptionMode::None));
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn plain_connect_runs_full_login_sequence() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut client = connected(&server).await;

    assert!(client.is_connected());
    assert!(!client.is_encrypted());
    assert!(client.features().size);
    assert!(client.state().utf8_success);
    assert_eq!(client.state().last_working_dir.as_deref(), Some("/"));

    let commands = server.commands();
    let verbs: Vec<&str> = commands.iter().map(|c| c.split(' ').next().unwrap()).collect();
    assert_eq!(verbs, ["USER", "PASS", "FEAT", "OPTS", "SYST", "PWD"]);

    let info = client.session_info();
    assert!(info.connected);
    assert_eq!(info.port, server.port);
    assert_eq!(info.system_type.as_deref(), Some("UNIX Type: L8"));
    assert_eq!(info.server_banner.as_deref(), Some("220 Loopback test server ready"));
    assert!(info.connected_at.is_some());
    assert_eq!(info.ip_version, Some(IpVersion::V4));

    client.disconnect().await;
    assert!(!client.is_connected());
    assert_eq!(server.count("QUIT"), 1);
}

#[tokio::test]
async fn auto_mode_continues_in_plaintext_when_auth_tls_is_refused() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut client = FtpClient::new(config(&server, EncryptionMode::Auto));
    client.connect().await.unwrap();

    assert!(client.state().ftps_failure);
    assert!(!client.is_encrypted());
    assert_eq!(server.count("AUTH TLS"), 1);
    assert_eq!(server.count("PBSZ"), 0);

    // Data channels stay in plaintext too.
    let lines = client.get_listing("/", ListOptions::default()).await.unwrap();
    assert_eq!(lines.len(), 2);
}

#[tokio::test]
async fn explicit_mode_fails_when_auth_tls_is_refused() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut client = FtpClient::new(config(&server, EncryptionMode::Explicit));
    let err = client.connect().await.unwrap_err();

    assert_eq!(err.kind, FtpErrorKind::SecurityNotAvailable);
    assert!(client.state().ftps_failure);
    assert!(!client.is_connected());
    assert_eq!(server.count("USER"), 0);
}

#[tokio::test]
async fn wrong_password_is_reported_with_its_code() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut cfg = config(&server, EncryptionMode::None);
    cfg.credentials = Credentials::new(USER, "wrong");
    let mut client = FtpClient::new(cfg);

    let err = client.connect().await.unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::AuthFailed);
    assert_eq!(err.code, Some(530));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn refused_epsv_falls_back_to_pasv_once() {
    let server = MockFtpServer::start(Script {
        epsv: false,
        ..Script::default()
    })
    .await;
    let mut client = connected(&server).await;

    let first = client.get_listing("/", ListOptions::default()).await.unwrap();
    assert!(client.state().epsv_not_supported);
    let second = client.get_listing("/", ListOptions::default()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first[1], "drwxr-xr-x 2 ftp ftp 0 Jan 01 00:00 pub");
    assert_eq!(server.count("EPSV"), 1);
    assert_eq!(server.count("PASV"), 2);
    assert_eq!(server.count("LIST /"), 2);
    // ASCII is sent once and then remembered.
    assert_eq!(server.count("TYPE A"), 1);
}

#[tokio::test]
async fn clone_remembers_epsv_fallback_after_connecting() {
    let server = MockFtpServer::start(Script {
        epsv: false,
        ..Script::default()
    })
    .await;
    let mut parent = connected(&server).await;
    parent.get_listing("/", ListOptions::default()).await.unwrap();
    assert!(parent.state().epsv_not_supported);
    server.clear_commands();

    let mut clone = parent.clone_connection();
    clone.connect().await.unwrap();
    assert!(clone.state().epsv_not_supported);
    assert!(!clone.state().ftps_failure);
    let lines = clone.get_listing("/", ListOptions::default()).await.unwrap();

    assert_eq!(lines.len(), 2);
    assert_eq!(server.count("EPSV"), 0);
    assert_eq!(server.count("PASV"), 1);
    // Features are inherited, not asked for again.
    assert_eq!(server.count("FEAT"), 0);
}

#[tokio::test]
async fn active_mode_listing() {
    let server = MockFtpServer::start(Script::default()).await;
    for style in [DataConnectionType::Active, DataConnectionType::ExtendedActive] {
        let mut cfg = config(&server, EncryptionMode::None);
        cfg.data_connection_type = style;
        let mut client = FtpClient::new(cfg);
        client.connect().await.unwrap();
        let lines = client.get_listing("/", ListOptions::default()).await.unwrap();
        assert_eq!(lines.len(), 2);
    }
    assert_eq!(server.count("PORT "), 1);
    assert_eq!(server.count("EPRT |1|127.0.0.1|"), 1);
}

#[tokio::test]
async fn download_and_resume() {
    let server = MockFtpServer::start(Script::default()).await;
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    server.put_file("/a.bin", payload.clone());
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("nested").join("a.bin");

    let mut client = connected(&server).await;
    let received = client.download_file("/a.bin", &local, false).await.unwrap();
    assert_eq!(received, payload.len() as u64);
    assert_eq!(std::fs::read(&local).unwrap(), payload);

    std::fs::write(&local, &payload[..1000]).unwrap();
    let received = client.download_file("/a.bin", &local, true).await.unwrap();
    assert_eq!(received, payload.len() as u64 - 1000);
    assert_eq!(std::fs::read(&local).unwrap(), payload);
    assert_eq!(server.count("REST 1000"), 1);

    let err = client
        .download_file("/missing.bin", &dir.path().join("m"), false)
        .await
        .unwrap_err();
    assert_eq!(err.code, Some(550));
    client.noop().await.unwrap();
}

#[tokio::test]
async fn upload_honours_remote_exists_modes() {
    let server = MockFtpServer::start(Script::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("up.txt");
    std::fs::write(&local, b"hello").unwrap();

    let mut client = connected(&server).await;

    let status = client.upload_file(&local, "/up.txt", RemoteExists::Overwrite).await.unwrap();
    assert_eq!(status, TransferStatus::Transferred(5));
    assert_eq!(server.file("/up.txt").unwrap(), b"hello");

    let status = client.upload_file(&local, "/up.txt", RemoteExists::Skip).await.unwrap();
    assert_eq!(status, TransferStatus::Skipped);

    let status = client.upload_file(&local, "/up.txt", RemoteExists::AddToEnd).await.unwrap();
    assert_eq!(status, TransferStatus::Transferred(5));
    assert_eq!(server.file("/up.txt").unwrap(), b"hellohello");

    server.put_file("/resume.txt", b"hello".to_vec());
    std::fs::write(&local, b"hello world").unwrap();
    let status = client.upload_file(&local, "/resume.txt", RemoteExists::Resume).await.unwrap();
    assert_eq!(status, TransferStatus::Transferred(6));
    assert_eq!(server.file("/resume.txt").unwrap(), b"hello world");

    let status = client.upload_file(&local, "/resume.txt", RemoteExists::Resume).await.unwrap();
    assert_eq!(status, TransferStatus::Skipped);

    assert_eq!(server.count("STOR /up.txt"), 1);
    assert_eq!(server.count("APPE "), 2);
}

#[tokio::test]
async fn upload_stream_rejects_resume_and_sends_reader() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut client = connected(&server).await;

    let mut reader: &[u8] = b"streamed body";
    let err = client
        .upload_stream(&mut reader, "/s.txt", RemoteExists::Resume)
        .await
        .unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::InvalidConfig);

    let status = client
        .upload_stream(&mut reader, "/s.txt", RemoteExists::NoCheck)
        .await
        .unwrap();
    assert_eq!(status, TransferStatus::Transferred(13));
    assert_eq!(server.file("/s.txt").unwrap(), b"streamed body");
}

#[tokio::test]
async fn upload_rate_limit_slows_the_transfer() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut cfg = config(&server, EncryptionMode::None);
    cfg.upload_rate_limit_kib = 10;
    let mut client = FtpClient::new(cfg);
    client.connect().await.unwrap();

    let body = vec![7u8; 20 * 1024];
    let mut reader: &[u8] = &body;
    let started = Instant::now();
    client
        .upload_stream(&mut reader, "/slow.bin", RemoteExists::Overwrite)
        .await
        .unwrap();
    assert!(started.elapsed().as_millis() >= 1_500);
    assert_eq!(server.file("/slow.bin").unwrap().len(), body.len());
}

#[tokio::test]
async fn size_switches_to_binary_when_refused_in_ascii() {
    let server = MockFtpServer::start(Script {
        size_binary_only: true,
        ..Script::default()
    })
    .await;
    server.put_file("/a.txt", b"12345".to_vec());
    let mut client = connected(&server).await;
    client.set_data_type(DataType::Ascii).await.unwrap();

    assert_eq!(client.file_size("/a.txt").await.unwrap(), Some(5));
    assert!(client.state().file_size_ascii_not_supported);
    assert_eq!(client.state().current_data_type, DataType::Binary);
    assert_eq!(client.file_size("/missing").await.unwrap(), None);
    assert_eq!(server.count("SIZE /a.txt"), 2);
}

#[tokio::test]
async fn dropped_data_channel_reply_is_drained_by_next_command() {
    let server = MockFtpServer::start(Script::default()).await;
    server.put_file("/a.bin", vec![1u8; 4096]);
    let mut client = connected(&server).await;

    let channel = client.open_data_channel("RETR /a.bin", 0).await.unwrap();
    assert!(channel.is_open());
    drop(channel);

    client.noop().await.unwrap();
    assert_eq!(client.current_directory().await.unwrap(), "/");
}

#[tokio::test]
async fn reconnect_restores_directory_and_type() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut client = connected(&server).await;
    client.change_directory("/pub").await.unwrap();
    assert_eq!(client.current_directory().await.unwrap(), "/pub");
    client.set_data_type(DataType::Binary).await.unwrap();

    server.clear_commands();
    client.reconnect().await.unwrap();

    let commands = server.commands();
    assert!(commands.contains(&"CWD /pub".to_string()));
    assert!(commands.contains(&"TYPE I".to_string()));
    assert_eq!(server.count("PWD"), 0);
    assert_eq!(client.state().last_working_dir.as_deref(), Some("/pub"));
}

#[tokio::test]
async fn clear_command_channel_needs_tls() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut client = connected(&server).await;
    let err = client.clear_command_channel().await.unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::TlsFailed);
    assert_eq!(server.count("CCC"), 0);
}

#[tokio::test]
async fn auto_detect_finds_plaintext_profile_on_a_clone() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut client = FtpClient::new(config(&server, EncryptionMode::Auto));

    let profiles = client.auto_detect(&AutoDetectConfig::default()).await.unwrap();
    assert_eq!(profiles.len(), 1);
    let profile = &profiles[0];
    assert_eq!(profile.encryption, EncryptionMode::None);
    assert_eq!(profile.protocol, TlsProtocol::Tls12);
    assert_eq!(profile.data_connection, DataConnectionType::Passive);
    assert!(profile.encoding_verified);

    // The probe ran on a clone; the caller's client is untouched.
    assert!(!client.is_connected());
    assert_eq!(client.config().encryption, EncryptionMode::Auto);

    client.connect_profile(profile).await.unwrap();
    assert_eq!(client.config().encryption, EncryptionMode::None);
    assert!(client.is_connected());
}

#[tokio::test]
async fn negotiate_reports_bad_credentials_without_trying_further() {
    let server = MockFtpServer::start(Script::default()).await;
    let mut cfg = config(&server, EncryptionMode::Auto);
    cfg.credentials = Credentials::new(USER, "nope");
    let mut client = FtpClient::new(cfg);

    let err = client.auto_detect(&AutoDetectConfig::default()).await.unwrap_err();
    assert_eq!(err.kind, FtpErrorKind::AuthFailed);
    assert_eq!(server.count("USER"), 1);
}
