//! End-to-end wire-up tests over the loopback fabric.
//!
//! # Test Strategy
//!
//! 1. **Handshake**: two workers wire up, traffic sent early is delivered in order
//! 2. **Auxiliary selection**: deterministic choice, ties, failures
//! 3. **Endpoint queries**: auxiliary index and remote-connected contracts
//! 4. **Resource pressure**: replay with a single transmit credit
//! 5. **Lifecycle**: create failures leave nothing behind, close

use parking_lot::Mutex;
use std::sync::Arc;
use transport::{CapFlags, IfaceAttr, LoopbackConfig, LoopbackFabric, LoopbackIface, ResourceIndex, TlResource};
use wireup::{
    select_transport, AuxScore, EpConfig, EpOp, Error, Resource, TransportScore, Worker, WorkerConfig,
};

const AM_ID_DATA: u8 = 7;

fn am_config() -> EpConfig {
    EpConfig::new().with_resource(EpOp::Am, ResourceIndex(0))
}

fn worker_on(fabric: &LoopbackFabric, name: &str, ep_config: EpConfig, config: LoopbackConfig) -> (Arc<Worker>, Arc<LoopbackIface>) {
    let iface = fabric.open_iface(config);
    let worker = Worker::new(
        WorkerConfig::new(name),
        ep_config,
        vec![Resource::new(TlResource::new("loopback", "lo0"), iface.clone())],
    );
    (worker, iface)
}

fn recorder(worker: &Worker) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    worker.set_am_handler(AM_ID_DATA, Arc::new(move |data: &[u8]| sink.lock().push(data.to_vec())));
    log
}

fn pump(workers: &[&Arc<Worker>], rounds: usize) {
    for _ in 0..rounds {
        for worker in workers {
            worker.progress();
        }
    }
}

/// Progresses both workers until each has a fully wired endpoint to the other.
fn wire_up(a: &Arc<Worker>, b: &Arc<Worker>) {
    for _ in 0..100 {
        pump(&[a, b], 1);
        let ab = a.ep_find(b.uuid());
        let ba = b.ep_find(a.uuid());
        if let (Some(ab), Some(ba)) = (ab, ba) {
            ab.progress_wireup();
            ba.progress_wireup();
            if ab.is_wired_up() && ba.is_wired_up() {
                return;
            }
        }
    }
    panic!("wire-up did not complete");
}

// ============================================================================
// Handshake Tests
// ============================================================================

#[test]
fn test_wire_up_two_workers() {
    // Test that both sides end up with the real transport installed
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());

    let ep = a.create_ep(&b.address()).unwrap();
    assert!(ep.slot(EpOp::Am).is_stub());
    assert!(!ep.is_wired_up());

    wire_up(&a, &b);

    assert!(ep.is_wired_up());
    let back = b.ep_find(a.uuid()).unwrap();
    assert_eq!(back.peer_name(), "alpha");
    assert_eq!(a.stub_pending_count(), 0);
    assert_eq!(b.stub_pending_count(), 0);

    a.close();
    b.close();
    assert_eq!(a.endpoint_count(), 0);
    assert_eq!(b.endpoint_count(), 0);
}

#[test]
fn test_early_traffic_is_delivered_in_order() {
    // Test that messages sent before wire-up are parked and replayed FIFO
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());
    let received = recorder(&b);

    let ep = a.create_ep(&b.address()).unwrap();
    let handles: Vec<_> = (0u8..5).map(|i| ep.send_am(AM_ID_DATA, vec![i])).collect();

    assert_eq!(a.stub_pending_count(), 5);
    assert!(handles.iter().all(|h| !h.is_completed()));

    wire_up(&a, &b);
    pump(&[&a, &b], 2);

    assert_eq!(
        *received.lock(),
        (0u8..5).map(|i| vec![i]).collect::<Vec<_>>()
    );
    assert!(handles.iter().all(|h| h.status() == Some(Ok(()))));
    assert_eq!(a.stub_pending_count(), 0);
    assert!(a.progress_registry().is_empty());
}

#[test]
fn test_traffic_after_wire_up_goes_direct() {
    // Test that a wired endpoint sends without parking
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());
    let received = recorder(&b);

    let ep = a.create_ep(&b.address()).unwrap();
    wire_up(&a, &b);

    let handle = ep.send_am(AM_ID_DATA, b"direct".to_vec());
    assert_eq!(handle.status(), Some(Ok(())));
    assert_eq!(a.stub_pending_count(), 0);

    pump(&[&b], 1);
    assert_eq!(*received.lock(), vec![b"direct".to_vec()]);
}

#[test]
fn test_simultaneous_connect() {
    // Test that both workers creating endpoints to each other still converge
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());

    let ab = a.create_ep(&b.address()).unwrap();
    let ba = b.create_ep(&a.address()).unwrap();

    wire_up(&a, &b);

    assert!(ab.is_wired_up());
    assert!(ba.is_wired_up());
    assert_eq!(a.endpoint_count(), 1);
    assert_eq!(b.endpoint_count(), 1);
}

#[test]
fn test_alias_lane_follows_switchover() {
    // Test that a duplicate category shares the promoted endpoint
    let config = am_config().with_dup(EpOp::Rma, EpOp::Am);
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", config.clone(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", config, LoopbackConfig::default());

    let ep = a.create_ep(&b.address()).unwrap();
    assert!(ep.slot(EpOp::Rma).is_stub());

    wire_up(&a, &b);

    let am = ep.uct_ep(EpOp::Am).unwrap();
    let rma = ep.uct_ep(EpOp::Rma).unwrap();
    assert!(Arc::ptr_eq(&am, &rma));
}

#[test]
fn test_connect_to_iface_lane_skips_stub() {
    // Test that a transport without endpoint pairing is installed directly
    let config = LoopbackConfig {
        flags: LoopbackConfig::default_flags().difference(CapFlags::CONNECT_TO_EP),
        ..LoopbackConfig::default()
    };
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), config.clone());
    let (b, _) = worker_on(&fabric, "beta", am_config(), config);
    let received = recorder(&b);

    let ep = a.create_ep(&b.address()).unwrap();
    assert!(ep.is_wired_up());

    ep.send_am(AM_ID_DATA, b"now".to_vec());
    pump(&[&a, &b], 3);

    assert_eq!(*received.lock(), vec![b"now".to_vec()]);
    assert!(b.ep_find(a.uuid()).unwrap().is_wired_up());
}

// ============================================================================
// Auxiliary Selection Tests
// ============================================================================

struct FixedScore;

impl TransportScore for FixedScore {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn score(&self, attr: &IfaceAttr) -> Result<f64, &'static str> {
        if attr.cap.flags.contains(CapFlags::AM_BCOPY) {
            Ok(5.2)
        } else {
            Err("am_bcopy for wireup")
        }
    }
}

fn three_resources(fabric: &LoopbackFabric, configs: [LoopbackConfig; 3]) -> Arc<Worker> {
    let resources = configs
        .into_iter()
        .enumerate()
        .map(|(i, config)| {
            Resource::new(
                TlResource::new("loopback", &format!("lo{}", i)),
                fabric.open_iface(config),
            )
        })
        .collect();
    Worker::new(WorkerConfig::new("local"), am_config(), resources)
}

#[test]
fn test_tie_goes_to_first_candidate() {
    // Test that {0.0, 5.2, 5.2} always picks the earlier 5.2 candidate
    let fabric = LoopbackFabric::new();
    let no_bcopy = LoopbackConfig {
        flags: LoopbackConfig::default_flags().difference(CapFlags::AM_BCOPY),
        ..LoopbackConfig::default()
    };
    let local = three_resources(
        &fabric,
        [no_bcopy, LoopbackConfig::default(), LoopbackConfig::default()],
    );
    let (peer, _) = worker_on(&fabric, "peer", am_config(), LoopbackConfig::default());
    let entries = peer.address().entries;

    for _ in 0..10 {
        let selection = select_transport(&local, "peer", &entries, &FixedScore).unwrap();
        assert_eq!(selection.rsc_index, ResourceIndex(1));
        assert_eq!(selection.addr_index, 0);
        assert_eq!(selection.score, 5.2);
    }
}

#[test]
fn test_lowest_latency_wins() {
    // Test that the default scoring prefers the faster resource
    let fabric = LoopbackFabric::new();
    let slow = LoopbackConfig {
        latency: 1e-5,
        ..LoopbackConfig::default()
    };
    let fast = LoopbackConfig {
        latency: 1e-7,
        ..LoopbackConfig::default()
    };
    let local = three_resources(&fabric, [slow.clone(), fast, slow]);
    let (peer, _) = worker_on(&fabric, "peer", am_config(), LoopbackConfig::default());

    let selection = select_transport(&local, "peer", &peer.address().entries, &AuxScore).unwrap();
    assert_eq!(selection.rsc_index, ResourceIndex(1));
}

#[test]
fn test_no_suitable_aux_fails_create_ep() {
    // Test that a peer on another fabric is reported with reasons and leaves nothing behind
    let (a, a_iface) = worker_on(&LoopbackFabric::new(), "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&LoopbackFabric::new(), "beta", am_config(), LoopbackConfig::default());

    let err = a.create_ep(&b.address()).unwrap_err();
    match err {
        Error::NoSuitableResource { purpose, peer, .. } => {
            assert_eq!(purpose, "auxiliary");
            assert_eq!(peer, "beta");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(a.endpoint_count(), 0);
    assert_eq!(a_iface.live_endpoints(), 0);
}

// ============================================================================
// Endpoint Query Tests
// ============================================================================

#[test]
fn test_aux_resource_index_of_stub_and_wired_lane() {
    // Test that the query answers for stubs and returns None once wired
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());

    let ep = a.create_ep(&b.address()).unwrap();
    assert_eq!(ep.aux_resource_index(EpOp::Am), Some(ResourceIndex(0)));
    assert_eq!(ep.aux_resource_index(EpOp::Amo), None);

    wire_up(&a, &b);
    assert_eq!(ep.aux_resource_index(EpOp::Am), None);
}

#[test]
#[should_panic(expected = "no auxiliary endpoint")]
fn test_aux_resource_index_of_rma_stub_panics() {
    let config = am_config().with_resource(EpOp::Rma, ResourceIndex(0));
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", config.clone(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", config, LoopbackConfig::default());

    let ep = a.create_ep(&b.address()).unwrap();
    ep.aux_resource_index(EpOp::Rma);
}

#[test]
#[should_panic(expected = "non-stub")]
fn test_remote_connected_after_wire_up_panics() {
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());

    let ep = a.create_ep(&b.address()).unwrap();
    wire_up(&a, &b);
    ep.remote_connected(EpOp::Am);
}

// ============================================================================
// Resource Pressure Tests
// ============================================================================

#[test]
fn test_replay_with_single_credit_keeps_order() {
    // Test that replay parks on the promoted endpoint instead of dropping
    let tight = LoopbackConfig {
        tx_credits: 1,
        ..LoopbackConfig::default()
    };
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), tight.clone());
    let (b, _) = worker_on(&fabric, "beta", am_config(), tight);
    let received = recorder(&b);

    let ep = a.create_ep(&b.address()).unwrap();
    let handles: Vec<_> = (0u8..4).map(|i| ep.send_am(AM_ID_DATA, vec![i])).collect();

    wire_up(&a, &b);
    for _ in 0..20 {
        pump(&[&a, &b], 1);
        if handles.iter().all(|h| h.is_completed()) && received.lock().len() == 4 {
            break;
        }
    }

    assert_eq!(
        *received.lock(),
        (0u8..4).map(|i| vec![i]).collect::<Vec<_>>()
    );
    assert!(handles.iter().all(|h| h.status() == Some(Ok(()))));
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_create_ep_is_idempotent_per_peer() {
    let fabric = LoopbackFabric::new();
    let (a, _) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, _) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());

    let first = a.create_ep(&b.address()).unwrap();
    let second = a.create_ep(&b.address()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_close_releases_transport_endpoints() {
    // Test that closing both workers drops every loopback endpoint
    let fabric = LoopbackFabric::new();
    let (a, a_iface) = worker_on(&fabric, "alpha", am_config(), LoopbackConfig::default());
    let (b, b_iface) = worker_on(&fabric, "beta", am_config(), LoopbackConfig::default());

    a.create_ep(&b.address()).unwrap();
    wire_up(&a, &b);
    pump(&[&a, &b], 2);

    a.close();
    b.close();
    assert_eq!(a_iface.live_endpoints(), 0);
    assert_eq!(b_iface.live_endpoints(), 0);
}

#[test]
fn test_destroy_with_undelivered_traffic_returns() {
    // Test that destroy gives up on a flush the silent peer never completes
    let config = LoopbackConfig {
        flags: LoopbackConfig::default_flags().difference(CapFlags::CONNECT_TO_EP),
        ..LoopbackConfig::default()
    };
    let fabric = LoopbackFabric::new();
    let a_iface = fabric.open_iface(config.clone());
    let a = Worker::new(
        WorkerConfig {
            flush_attempts: 8,
            ..WorkerConfig::new("alpha")
        },
        am_config(),
        vec![Resource::new(TlResource::new("loopback", "lo0"), a_iface.clone())],
    );
    let (b, _) = worker_on(&fabric, "beta", am_config(), config);

    let ep = a.create_ep(&b.address()).unwrap();
    ep.send_am(AM_ID_DATA, b"unread".to_vec());
    ep.destroy();

    assert_eq!(a.endpoint_count(), 0);
    assert_eq!(a_iface.live_endpoints(), 0);
}

#[test]
fn test_close_with_undelivered_traffic_returns() {
    // Test that closing a worker whose peer never progresses does not hang
    let config = LoopbackConfig {
        flags: LoopbackConfig::default_flags().difference(CapFlags::CONNECT_TO_EP),
        ..LoopbackConfig::default()
    };
    let fabric = LoopbackFabric::new();
    let (a, a_iface) = worker_on(&fabric, "alpha", am_config(), config.clone());
    let (b, _) = worker_on(&fabric, "beta", am_config(), config);

    a.create_ep(&b.address()).unwrap();
    a.close();

    assert_eq!(a.endpoint_count(), 0);
    assert_eq!(a_iface.live_endpoints(), 0);
}
