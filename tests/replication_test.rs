use async_trait::async_trait;
use bitrep::bus::{BusEvent, LocalBus, MessageBus, Subscription};
use bitrep::checksum::{checksum_bytes, checksum_file, ChecksumAlgorithm};
use bitrep::config::{SessionSettings, TransferSettings, TransportKind};
use bitrep::coordinator::{IngestionCoordinator, ReplicaTarget};
use bitrep::error::{CoordinatorError, Error, TransferError};
use bitrep::ledger::{ReplicaId, ReplicaLedger, StoreState};
use bitrep::replica::{DirectoryReplica, ReplicaSink};
use bitrep::session::SessionServer;
use bitrep::transfer::{TransferFactory, TransferHandle, TransferRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(30);

fn session(port: u16, user: &str, password: &str) -> SessionSettings {
    SessionSettings {
        host: "127.0.0.1".to_string(),
        port,
        user: user.to_string(),
        password: password.to_string(),
    }
}

fn fast_settings(kind: TransportKind) -> TransferSettings {
    TransferSettings {
        kind,
        retries: 3,
        backoff_min_ms: 10,
        backoff_max_ms: 50,
        data_timeout_secs: 10,
        ..TransferSettings::default()
    }
}

fn capture(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

fn directory_replica(id: &str, root: PathBuf, bus: &Arc<dyn MessageBus>) -> Arc<DirectoryReplica> {
    Arc::new(DirectoryReplica::new(
        ReplicaId::from(id),
        root,
        ChecksumAlgorithm::Md5,
        Arc::clone(bus),
    ))
}

async fn next_reply(events: &mut Subscription) -> BusEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event @ BusEvent::StoreReply { .. }) => return event,
                Some(_) => continue,
                None => panic!("bus closed"),
            }
        }
    })
    .await
    .expect("no store reply")
}

async fn wait_for_state(ledger: &ReplicaLedger, filename: &str, replica: &ReplicaId, state: StoreState) {
    tokio::time::timeout(WAIT, async {
        while ledger.get_state(filename, replica).ok() != Some(state) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {} in {}", filename, state, replica));
}

#[tokio::test]
async fn test_failed_replica_is_isolated_and_reingested() {
    let temp = TempDir::new().unwrap();
    let server = SessionServer::new(temp.path().join("blobs")).with_user("r1", "pw1");
    let running = server
        .clone()
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let port = running.local_addr().port();

    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let mut events = bus.subscribe();
    let ledger = Arc::new(ReplicaLedger::in_memory());
    let r1 = directory_replica("R1", temp.path().join("r1"), &bus);
    let r2 = directory_replica("R2", temp.path().join("r2"), &bus);
    let targets = vec![
        ReplicaTarget::new(r1.clone(), TransportKind::Session)
            .with_session(Some(session(port, "r1", "pw1"))),
        // R2's account does not exist yet; every log-on is refused
        ReplicaTarget::new(r2.clone(), TransportKind::Session)
            .with_session(Some(session(port, "r2", "pw2"))),
    ];
    let factory = TransferFactory::new(fast_settings(TransportKind::Session), TransferRegistry::new());
    let stats = factory.stats();
    let coordinator = IngestionCoordinator::start(Arc::clone(&ledger), bus.clone(), factory, targets);

    let source = capture(temp.path(), "capture-001.warc", 1024);
    let expected = checksum_file(ChecksumAlgorithm::Md5, &source).await.unwrap();
    let (id1, id2) = (ReplicaId::from("R1"), ReplicaId::from("R2"));

    let mut submission = coordinator
        .submit(&source, &[id1.clone(), id2.clone()])
        .await
        .unwrap();
    assert!(!submission.token().is_empty());
    assert_eq!(ledger.get_checksum("capture-001.warc").unwrap(), expected);

    let result = tokio::time::timeout(WAIT, submission.wait()).await.unwrap();
    match result {
        Err(CoordinatorError::Failed { replicas, .. }) => assert_eq!(replicas, vec!["R2"]),
        other => panic!("expected R2 to fail, got {:?}", other),
    }
    assert_eq!(
        ledger.get_state("capture-001.warc", &id1).unwrap(),
        StoreState::UploadCompleted
    );
    assert_eq!(
        ledger.get_state("capture-001.warc", &id2).unwrap(),
        StoreState::UploadFailed
    );
    assert!(ledger
        .file_names_in(&id2, StoreState::UploadFailed)
        .unwrap()
        .contains("capture-001.warc"));
    assert_eq!(
        checksum_file(ChecksumAlgorithm::Md5, &r1.path_of("capture-001.warc"))
            .await
            .unwrap(),
        expected
    );
    assert!(!r2.path_of("capture-001.warc").exists());
    // R1 connects to upload, download and delete; R2 makes three refused log-ons
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.connects, 6);
    assert_eq!(snapshot.uploads, 1);
    assert_eq!(snapshot.deletes, 1);

    match next_reply(&mut events).await {
        BusEvent::StoreReply { filename, failed, .. } => {
            assert_eq!(filename, "capture-001.warc");
            assert_eq!(failed, vec![id2.clone()]);
        }
        other => unreachable!("{:?}", other),
    }
    assert!(!ledger.has_reply_info("capture-001.warc").unwrap());

    // Completed replicas cannot be re-ingested
    let err = coordinator.reingest("capture-001.warc", &id1).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Coordinator(CoordinatorError::NotReingestable { .. })
    ));

    server.add_user("r2", "pw2");
    let mut retry = coordinator.reingest("capture-001.warc", &id2).await.unwrap();
    let report = tokio::time::timeout(WAIT, retry.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(
        ledger.get_state("capture-001.warc", &id2).unwrap(),
        StoreState::UploadCompleted
    );
    assert_eq!(
        std::fs::read(r2.path_of("capture-001.warc")).unwrap(),
        std::fs::read(&source).unwrap()
    );
    // Every uploaded blob was cleaned up from the session server
    let leftover = std::fs::read_dir(temp.path().join("blobs")).unwrap().count();
    assert_eq!(leftover, 0);

    coordinator.shutdown().await;
    running.shutdown().await;
}

#[tokio::test]
async fn test_zero_length_file_completes_without_network() {
    let temp = TempDir::new().unwrap();
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let ledger = Arc::new(ReplicaLedger::in_memory());
    let r1 = directory_replica("R1", temp.path().join("r1"), &bus);
    let r2 = directory_replica("R2", temp.path().join("r2"), &bus);
    // No session server exists; an empty file must not need one
    let targets = vec![
        ReplicaTarget::new(r1.clone(), TransportKind::Session)
            .with_session(Some(session(1, "nobody", "x"))),
        ReplicaTarget::new(r2.clone(), TransportKind::Http),
    ];
    let factory = TransferFactory::new(fast_settings(TransportKind::Session), TransferRegistry::new());
    let stats = factory.stats();
    let coordinator = IngestionCoordinator::start(Arc::clone(&ledger), bus, factory, targets);

    let source = capture(temp.path(), "empty.warc", 0);
    let ids = coordinator.replica_ids();
    let mut submission = coordinator.submit(&source, &ids).await.unwrap();

    // Settled before submit returned
    for id in &ids {
        assert_eq!(
            ledger.get_state("empty.warc", id).unwrap(),
            StoreState::UploadCompleted
        );
    }
    let report = submission.wait().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(coordinator.pending(), 0);
    assert_eq!(stats.snapshot().network_calls(), 0);
    assert!(coordinator.factory().registry().is_empty());
    assert_eq!(std::fs::metadata(r1.path_of("empty.warc")).unwrap().len(), 0);
    assert_eq!(std::fs::metadata(r2.path_of("empty.warc")).unwrap().len(), 0);
    assert!(source.exists());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_http_pull_from_another_host() {
    let temp = TempDir::new().unwrap();
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let ledger = Arc::new(ReplicaLedger::in_memory());
    let r1 = directory_replica("R1", temp.path().join("r1"), &bus);

    let mut settings = fast_settings(TransportKind::Http);
    settings.http.bind = "127.0.0.1:0".parse().unwrap();
    settings.http.advertised_host = Some("127.0.0.1".to_string());
    // Pretend the producer lives elsewhere so the bytes go over HTTP
    let registry = TransferRegistry::with_hostname("producer.invalid");
    let factory = TransferFactory::new(settings, Arc::clone(&registry));
    let stats = factory.stats();
    let coordinator = IngestionCoordinator::start(
        Arc::clone(&ledger),
        bus,
        factory,
        vec![ReplicaTarget::new(r1.clone(), TransportKind::Http)],
    );

    let source = capture(temp.path(), "capture-002.warc", 70_000);
    let mut submission = coordinator
        .submit(&source, &[ReplicaId::from("R1")])
        .await
        .unwrap();
    let report = tokio::time::timeout(WAIT, submission.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(
        std::fs::read(r1.path_of("capture-002.warc")).unwrap(),
        std::fs::read(&source).unwrap()
    );

    let snapshot = stats.snapshot();
    assert!(snapshot.downloads >= 1);
    assert!(snapshot.deletes >= 1);
    assert!(registry.is_empty());
    // The producer's copy is shared between replicas and never deleted
    assert!(source.exists());

    coordinator.shutdown().await;
    registry.shutdown().await;
}

/// Takes the bytes but never confirms, leaving confirmation to the test.
struct SilentReplica {
    id: ReplicaId,
    received: parking_lot::Mutex<Vec<u8>>,
}

#[async_trait]
impl ReplicaSink for SilentReplica {
    fn id(&self) -> &ReplicaId {
        &self.id
    }

    async fn store(&self, handle: &TransferHandle) -> Result<(), TransferError> {
        let mut buf = Vec::new();
        handle.append_to(&mut buf).await?;
        *self.received.lock() = buf;
        Ok(())
    }
}

fn silent(id: &str) -> Arc<SilentReplica> {
    Arc::new(SilentReplica {
        id: ReplicaId::from(id),
        received: parking_lot::Mutex::new(Vec::new()),
    })
}

#[tokio::test]
async fn test_confirmations_drive_final_state() {
    let temp = TempDir::new().unwrap();
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let ledger = Arc::new(ReplicaLedger::in_memory());
    let (good, bad, lost) = (silent("R1"), silent("R2"), silent("R3"));
    let targets = vec![
        ReplicaTarget::new(good.clone(), TransportKind::Local),
        ReplicaTarget::new(bad.clone(), TransportKind::Local),
        ReplicaTarget::new(lost.clone(), TransportKind::Local),
    ];
    let factory = TransferFactory::new(fast_settings(TransportKind::Local), TransferRegistry::new());
    let coordinator = IngestionCoordinator::start(Arc::clone(&ledger), bus.clone(), factory, targets);

    let source = capture(temp.path(), "capture-003.warc", 4096);
    let checksum = checksum_file(ChecksumAlgorithm::Md5, &source).await.unwrap();
    let ids = coordinator.replica_ids();
    let mut submission = coordinator.submit(&source, &ids).await.unwrap();

    for id in &ids {
        wait_for_state(&ledger, "capture-003.warc", id, StoreState::DataUploaded).await;
    }
    assert_eq!(good.received.lock().len(), 4096);

    bus.publish(BusEvent::ReplicaConfirmed {
        filename: "capture-003.warc".into(),
        replica: good.id.clone(),
        checksum: checksum.clone(),
    });
    bus.publish(BusEvent::ReplicaConfirmed {
        filename: "capture-003.warc".into(),
        replica: bad.id.clone(),
        checksum: checksum_bytes(ChecksumAlgorithm::Md5, b"corrupted"),
    });
    bus.publish(BusEvent::ReplicaRejected {
        filename: "capture-003.warc".into(),
        replica: lost.id.clone(),
        reason: "disk full".into(),
    });
    // Duplicate delivery is harmless
    bus.publish(BusEvent::ReplicaConfirmed {
        filename: "capture-003.warc".into(),
        replica: good.id.clone(),
        checksum: checksum.clone(),
    });

    let result = tokio::time::timeout(WAIT, submission.wait()).await.unwrap();
    match result {
        Err(CoordinatorError::Failed { replicas, .. }) => assert_eq!(replicas, vec!["R2", "R3"]),
        other => panic!("expected R2 and R3 to fail, got {:?}", other),
    }
    assert_eq!(
        ledger.get_state("capture-003.warc", &good.id).unwrap(),
        StoreState::UploadCompleted
    );
    assert_eq!(
        ledger.get_state("capture-003.warc", &bad.id).unwrap(),
        StoreState::UploadFailed
    );
    assert_eq!(
        ledger.get_state("capture-003.warc", &lost.id).unwrap(),
        StoreState::UploadFailed
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_resubmission_rules() {
    let temp = TempDir::new().unwrap();
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let ledger = Arc::new(ReplicaLedger::in_memory());
    let replica = silent("R1");
    let factory = TransferFactory::new(fast_settings(TransportKind::Local), TransferRegistry::new());
    let coordinator = IngestionCoordinator::start(
        Arc::clone(&ledger),
        bus,
        factory,
        vec![ReplicaTarget::new(replica.clone(), TransportKind::Local)],
    );
    let id = ReplicaId::from("R1");

    let err = coordinator.submit(&capture(temp.path(), "a.warc", 10), &[]).await.unwrap_err();
    assert!(matches!(err, Error::Coordinator(CoordinatorError::NoReplicas(_))));
    let err = coordinator
        .submit(&capture(temp.path(), "a.warc", 10), &[ReplicaId::from("R9")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Coordinator(CoordinatorError::UnknownReplica(_))));

    let source = capture(temp.path(), "capture-004.warc", 100);
    let _submission = coordinator.submit(&source, &[id.clone()]).await.unwrap();
    wait_for_state(&ledger, "capture-004.warc", &id, StoreState::DataUploaded).await;

    // Still waiting for the replica's confirmation
    let err = coordinator.submit(&source, &[id.clone()]).await.unwrap_err();
    assert!(matches!(err, Error::Coordinator(CoordinatorError::InProgress { .. })));

    // Different content under an existing name is refused
    let other = temp.path().join("elsewhere");
    std::fs::create_dir(&other).unwrap();
    let changed = capture(&other, "capture-004.warc", 101);
    let err = coordinator.submit(&changed, &[id.clone()]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Coordinator(CoordinatorError::ChecksumMismatch { .. })
    ));

    coordinator.shutdown().await;
    assert!(matches!(
        coordinator.submit(&source, &[id]).await,
        Err(Error::Coordinator(CoordinatorError::Shutdown))
    ));
}

#[tokio::test]
async fn test_redelivered_store_request_is_answered_once() {
    let temp = TempDir::new().unwrap();
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let mut events = bus.subscribe();
    let ledger = Arc::new(ReplicaLedger::in_memory());
    let replica = silent("R1");
    let factory = TransferFactory::new(fast_settings(TransportKind::Local), TransferRegistry::new());
    let coordinator = IngestionCoordinator::start(
        Arc::clone(&ledger),
        bus.clone(),
        factory,
        vec![ReplicaTarget::new(replica.clone(), TransportKind::Local)],
    );

    let source = capture(temp.path(), "capture-006.warc", 2048);
    let checksum = checksum_file(ChecksumAlgorithm::Md5, &source).await.unwrap();
    let request = BusEvent::StoreRequested {
        path: source.clone(),
        checksum: None,
        replicas: vec![replica.id.clone()],
        reply_to: Some("harvester-1".into()),
    };
    // The bus may deliver the same request twice
    bus.publish(request.clone());
    bus.publish(request);

    wait_for_state(&ledger, "capture-006.warc", &replica.id, StoreState::DataUploaded).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.publish(BusEvent::ReplicaConfirmed {
        filename: "capture-006.warc".into(),
        replica: replica.id.clone(),
        checksum,
    });

    match next_reply(&mut events).await {
        BusEvent::StoreReply {
            filename,
            reply_to,
            failed,
            ..
        } => {
            assert_eq!(filename, "capture-006.warc");
            assert_eq!(reply_to.as_deref(), Some("harvester-1"));
            assert!(failed.is_empty(), "unexpected failures {:?}", failed);
        }
        other => unreachable!("{:?}", other),
    }
    assert_eq!(
        ledger.get_state("capture-006.warc", &replica.id).unwrap(),
        StoreState::UploadCompleted
    );

    // No second answer for the redelivered copy
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Some(event) = events.try_recv() {
        assert!(
            !matches!(event, BusEvent::StoreReply { .. }),
            "second reply {:?}",
            event
        );
    }

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_cancel_leaves_ledger_untouched() {
    let temp = TempDir::new().unwrap();
    // A port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let ledger = Arc::new(ReplicaLedger::in_memory());
    let replica = directory_replica("R1", temp.path().join("r1"), &bus);

    let mut settings = fast_settings(TransportKind::Session);
    settings.retries = 10;
    settings.backoff_min_ms = 5_000;
    settings.backoff_max_ms = 5_000;
    let factory = TransferFactory::new(settings, TransferRegistry::new());
    let coordinator = IngestionCoordinator::start(
        Arc::clone(&ledger),
        bus,
        factory,
        vec![ReplicaTarget::new(replica, TransportKind::Session)
            .with_session(Some(session(port, "u", "p")))],
    );

    let source = capture(temp.path(), "capture-005.warc", 512);
    let id = ReplicaId::from("R1");
    let mut submission = coordinator.submit(&source, &[id.clone()]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    submission.cancel();
    assert!(submission.is_cancelled());
    assert!(matches!(
        submission.wait().await,
        Err(CoordinatorError::Cancelled(_))
    ));

    tokio::time::timeout(WAIT, async {
        while coordinator.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        ledger.get_state("capture-005.warc", &id).unwrap(),
        StoreState::UploadStarted
    );
    coordinator.shutdown().await;
}
