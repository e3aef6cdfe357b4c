use bitrep::checksum::{checksum_bytes, ChecksumAlgorithm};
use bitrep::config::{SessionSettings, TransferSettings, TransportKind};
use bitrep::error::TransferError;
use bitrep::session::{RunningSessionServer, SessionClient, SessionServer};
use bitrep::transfer::{RetryPolicy, TransferFactory, TransferOptions, TransferRegistry, TransportStats};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

async fn start_server(temp: &TempDir) -> anyhow::Result<(SessionServer, RunningSessionServer)> {
    let server = SessionServer::new(temp.path().join("blobs")).with_user("archive", "s3cret");
    let running = server.clone().start("127.0.0.1:0".parse()?).await?;
    Ok((server, running))
}

fn login(running: &RunningSessionServer, password: &str) -> SessionSettings {
    SessionSettings {
        host: "127.0.0.1".into(),
        port: running.local_addr().port(),
        user: "archive".into(),
        password: password.into(),
    }
}

fn client(settings: SessionSettings, stats: Arc<TransportStats>) -> SessionClient {
    SessionClient::new(
        settings,
        RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20)),
        Duration::from_secs(10),
        stats,
    )
}

#[tokio::test]
async fn test_client_upload_download_delete() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let (server, running) = start_server(&temp).await?;
    let stats = Arc::new(TransportStats::new());
    let client = client(login(&running, "s3cret"), Arc::clone(&stats));

    let source = temp.path().join("capture.warc");
    let data = b"WARC/1.0\r\nWARC-Type: response\r\n".repeat(500);
    std::fs::write(&source, &data)?;

    let uploaded = client
        .upload("capture.warc-1-2", &source, Some(ChecksumAlgorithm::Md5))
        .await?;
    assert_eq!(uploaded, Some(checksum_bytes(ChecksumAlgorithm::Md5, &data)));
    assert!(server.root().join("capture.warc-1-2").exists());

    let mut blob = client.download("capture.warc-1-2").await?;
    assert_eq!(blob.remaining(), data.len() as u64);
    let mut fetched = Vec::new();
    blob.read_to_end(&mut fetched).await?;
    assert_eq!(fetched, data);

    client.delete("capture.warc-1-2").await?;
    assert!(!server.root().join("capture.warc-1-2").exists());

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.uploads, 1);
    assert_eq!(snapshot.downloads, 1);
    assert_eq!(snapshot.deletes, 1);
    assert_eq!(snapshot.connects, 3);

    running.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_login_exhausts_budget_and_keeps_last_error() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let (_server, running) = start_server(&temp).await?;
    let stats = Arc::new(TransportStats::new());
    let client = client(login(&running, "wrong"), Arc::clone(&stats));

    let source = temp.path().join("capture.warc");
    std::fs::write(&source, b"bytes")?;
    let err = client.upload("capture.warc", &source, None).await.unwrap_err();
    assert!(matches!(err, TransferError::Login { .. }));
    assert_eq!(stats.snapshot().connects, 3);
    assert_eq!(stats.snapshot().uploads, 0);
    let last = client.last_error().unwrap();
    assert!(last.contains("530"), "unexpected last error: {}", last);

    running.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_blob_reports_remote_error() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let (_server, running) = start_server(&temp).await?;
    let client = client(login(&running, "s3cret"), Arc::new(TransportStats::new()));

    let err = client.download("no-such-blob").await.unwrap_err();
    assert!(matches!(err, TransferError::Remote { code: 550, .. }));
    assert!(client.last_error().unwrap().starts_with("Error 550:"));

    running.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_session_handle_lifecycle() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let (server, running) = start_server(&temp).await?;
    let settings = TransferSettings {
        kind: TransportKind::Session,
        session: Some(login(&running, "s3cret")),
        backoff_min_ms: 5,
        backoff_max_ms: 20,
        ..TransferSettings::default()
    };
    let factory = TransferFactory::new(settings, TransferRegistry::new());

    let source = temp.path().join("capture-010.warc");
    let data = vec![42u8; 100_000];
    std::fs::write(&source, &data)?;

    let handle = factory
        .create(&source, TransferOptions::default().deletable(true))
        .await?;
    // Deletable producer copies go away once the server holds the bytes
    assert!(!source.exists());
    assert_eq!(handle.retry_budget(), 3);
    assert_eq!(handle.checksum(), Some(&checksum_bytes(ChecksumAlgorithm::Md5, &data)));
    let remote = handle.remote_name().unwrap().to_string();
    assert!(remote.starts_with("capture-010.warc-"));
    assert!(server.root().join(&remote).exists());

    let mut stream = handle.open().await?;
    let mut fetched = Vec::new();
    stream.read_to_end(&mut fetched).await?;
    assert_eq!(stream.bytes_read(), data.len() as u64);
    stream.close().await?;
    assert_eq!(fetched, data);

    // Single use: closing cleaned up the remote blob
    assert!(handle.is_consumed());
    assert!(handle.is_cleaned_up());
    assert!(!server.root().join(&remote).exists());
    assert!(matches!(handle.open().await, Err(TransferError::Consumed(_))));

    let deletes = factory.stats().snapshot().deletes;
    handle.cleanup().await;
    handle.cleanup().await;
    assert_eq!(factory.stats().snapshot().deletes, deletes);

    running.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_http_handle_pulled_by_remote_consumer() -> anyhow::Result<()> {
    let temp = TempDir::new()?;
    let mut settings = TransferSettings {
        kind: TransportKind::Http,
        ..TransferSettings::default()
    };
    settings.http.bind = "127.0.0.1:0".parse()?;
    settings.http.advertised_host = Some("127.0.0.1".into());
    let registry = TransferRegistry::with_hostname("producer.invalid");
    let factory = TransferFactory::new(settings, Arc::clone(&registry));

    let source = temp.path().join("capture-011.warc");
    std::fs::write(&source, b"pulled over http")?;
    let handle = factory
        .create(&source, TransferOptions::default().deletable(true))
        .await?;
    assert!(!handle.is_local());
    assert_eq!(registry.len(), 1);

    let mut sink = Vec::new();
    let copied = handle.append_to(&mut sink).await?;
    assert_eq!(copied, 16);
    assert_eq!(sink, b"pulled over http");

    // The cleanup URL unregistered the file and removed the deletable source
    assert!(handle.is_cleaned_up());
    assert!(registry.is_empty());
    assert!(!source.exists());
    let snapshot = factory.stats().snapshot();
    assert_eq!(snapshot.downloads, 1);
    assert_eq!(snapshot.deletes, 1);

    registry.shutdown().await;
    Ok(())
}
