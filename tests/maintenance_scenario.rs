//! End-to-end maintenance scenarios against a simulated cluster

use std::collections::HashSet;
use std::sync::Arc;

use tessera_core::cluster::ServerStatus;
use tessera_core::crypto::EncryptionKey;
use tessera_core::files::{Caller, UploadRequest};
use tessera_core::maintenance::{CheckType, FindingKind, JobRecord, JobStatus, MaintenanceConfig, MaintenanceRequest};
use tessera_core::storage::{FragmentBackend, MemoryFragmentStore};
use tessera_core::{TesseraConfig, TesseraNode};

struct Cluster {
    node: TesseraNode,
    stores: Vec<Arc<MemoryFragmentStore>>,
}

impl Cluster {
    async fn start(servers: usize) -> Self {
        let config = TesseraConfig {
            maintenance: MaintenanceConfig {
                server_attempts: 1,
                orphan_confirmation_gap_secs: 0,
                ..MaintenanceConfig::default()
            },
            ..TesseraConfig::default()
        };
        let node = TesseraNode::open(config, EncryptionKey::generate()).unwrap();
        node.metadata().register_user("alice").unwrap();

        let mut stores = Vec::new();
        for i in 0..servers {
            let store = Arc::new(MemoryFragmentStore::new(format!("srv-{}", i), 1 << 30));
            node.attach_server(store.clone(), &format!("host-{}", i), None)
                .await
                .unwrap();
            stores.push(store);
        }
        Self { node, stores }
    }

    fn store(&self, name: &str) -> &Arc<MemoryFragmentStore> {
        self.stores
            .iter()
            .find(|s| s.server_name() == name)
            .unwrap()
    }

    fn kill(&self, name: &str) {
        self.store(name).set_reachable(false);
        self.node.registry().set_status(name, ServerStatus::Offline).unwrap();
    }

    async fn run(&self, request: MaintenanceRequest) -> JobRecord {
        let engine = self.node.maintenance();
        let job = engine.start(request).unwrap();
        let record = engine.wait(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed, "{}", record.status_msg);
        record
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_two_lost_servers_are_detected_and_repaired() {
    let cluster = Cluster::start(8).await;
    let alice = Caller::user("alice");
    let data = payload(10 * 1024 * 1024);

    let entry = cluster
        .node
        .files()
        .upload(&alice, UploadRequest::new(None, "big.bin", data.clone()))
        .await
        .unwrap();
    let fragments = entry.current_version().unwrap().fragments.clone();
    assert_eq!(fragments.len(), 6);

    let dead: HashSet<String> = [fragments[0].server_name.clone(), fragments[4].server_name.clone()]
        .into_iter()
        .collect();
    for name in &dead {
        cluster.kill(name);
    }

    // detection
    let quick = cluster.run(MaintenanceRequest::new([CheckType::QuickShards])).await;
    assert_eq!(quick.count(FindingKind::MissingFragment), 2);
    assert_eq!(quick.errors, 2);
    assert_eq!(quick.percent_complete, 100.0);

    let read = cluster.node.files().read(&alice, entry.file_id, None).await.unwrap();
    assert_eq!(read, data);

    // repair onto the two servers that held nothing
    let repair = cluster
        .run(MaintenanceRequest::new([CheckType::MissingShards]).with_repair())
        .await;
    assert_eq!(repair.count(FindingKind::RepairedFragment), 2);

    let repaired = cluster.node.metadata().entry(entry.file_id).unwrap();
    let holders: HashSet<String> = repaired
        .current_version()
        .unwrap()
        .fragments
        .iter()
        .map(|f| f.server_name.clone())
        .collect();
    assert_eq!(holders.len(), 6);
    assert!(holders.is_disjoint(&dead));

    let after = cluster.run(MaintenanceRequest::new([CheckType::QuickShards])).await;
    assert_eq!(after.count(FindingKind::MissingFragment), 0);

    let full = cluster.run(MaintenanceRequest::new([CheckType::FullShards])).await;
    assert_eq!(full.count(FindingKind::CorruptFragment), 0);
    assert_eq!(full.count(FindingKind::ReconstructionMismatch), 0);
}

#[tokio::test]
async fn test_orphans_need_two_jobs_before_deletion() {
    let cluster = Cluster::start(6).await;
    cluster
        .node
        .files()
        .upload(&Caller::user("alice"), UploadRequest::new(None, "a.txt", payload(5_000)))
        .await
        .unwrap();
    tokio_test::assert_ok!(cluster.store("srv-3").put("left-behind", b"stale bytes").await);

    let first = cluster.run(MaintenanceRequest::new([CheckType::DeleteFragments])).await;
    assert_eq!(first.count(FindingKind::OrphanedFragment), 1);
    assert_eq!(first.count(FindingKind::DeletedOrphan), 0);
    assert!(tokio_test::assert_ok!(cluster.store("srv-3").stat("left-behind").await).is_some());

    let second = cluster.run(MaintenanceRequest::new([CheckType::DeleteFragments])).await;
    assert_eq!(second.count(FindingKind::DeletedOrphan), 1);
    assert!(tokio_test::assert_ok!(cluster.store("srv-3").stat("left-behind").await).is_none());

    let read = cluster
        .node
        .files()
        .metadata(&Caller::user("alice"), cluster.node.metadata().files()[0].file_id)
        .unwrap();
    assert_eq!(read.file_name, "a.txt");
}

#[tokio::test]
async fn test_rotation_then_full_check_is_clean() {
    let cluster = Cluster::start(6).await;
    let alice = Caller::user("alice");
    let entry = cluster
        .node
        .files()
        .upload(&alice, UploadRequest::new(None, "doc.txt", payload(20_000)))
        .await
        .unwrap();

    let report = cluster
        .node
        .rotation()
        .rotate(EncryptionKey::generate())
        .await
        .unwrap();
    assert_eq!(report.resealed, 6);

    let full = cluster.run(MaintenanceRequest::new([CheckType::FullShards])).await;
    assert!(full.findings.is_empty());
    assert_eq!(
        cluster.node.files().read(&alice, entry.file_id, None).await.unwrap(),
        payload(20_000)
    );
}
