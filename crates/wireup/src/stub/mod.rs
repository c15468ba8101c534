//! Stub endpoint.
//!
//! A stub occupies a dispatch-table slot while its category is wired up. It
//! owns the real transport endpoint under negotiation ("next") and, for the
//! active-message category, an auxiliary endpoint that carries wire-up
//! messages until the real one is usable.
//!
//! Every send except a wire-up message attempts a switchover and reports
//! [`transport::Error::NoResource`], so callers park their requests on the stub with
//! `pending_add`. Once both sides are connected the switchover installs the
//! real endpoint and replays the parked requests in order; see
//! [`StubEp::progress`].
//!
//! # Example
//!
//! ```ignore
//! let slot = ep.slot(EpOp::Am);
//! stub::remote_connected(&slot);
//! while !ep.is_wired_up() {
//!     worker.progress();
//! }
//! ```

mod pending;
mod switchover;

use crate::address::WorkerAddress;
use crate::auxiliary::{self, AuxScore};
use crate::config::EpOp;
use crate::endpoint::{EpSlot, Endpoint};
use crate::error::{Error, Result};
use crate::proto::AM_ID_WIREUP;
use bitflags::bitflags;
use parking_lot::Mutex;
use pending::{PendingQueue, WireupMsgProxy};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;
use tracing::{debug, trace};
use transport::{
    AmId, DeviceAddr, EpAddr, PackFn, PendingRequest, Progress, RemoteKey, ResourceIndex, TransportEp,
};

bitflags! {
    /// Readiness bits of a stub, set by independent events.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct StubFlags: u32 {
        const LOCAL_CONNECTED = 1 << 0;
        const REMOTE_CONNECTED = 1 << 1;
        const CONNECTED = Self::LOCAL_CONNECTED.bits() | Self::REMOTE_CONNECTED.bits();
    }
}

/// Connection readiness of a stub endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StubState {
    Init,
    LocalConnected,
    RemoteConnected,
    Connected,
}

impl StubState {
    fn from_flags(flags: StubFlags) -> Self {
        if flags.contains(StubFlags::CONNECTED) {
            StubState::Connected
        } else if flags.contains(StubFlags::LOCAL_CONNECTED) {
            StubState::LocalConnected
        } else if flags.contains(StubFlags::REMOTE_CONNECTED) {
            StubState::RemoteConnected
        } else {
            StubState::Init
        }
    }
}

/// Placeholder endpoint for one category during wire-up.
pub struct StubEp {
    me: Weak<StubEp>,
    ep: Weak<Endpoint>,
    op: EpOp,
    aux_rsc_index: Option<ResourceIndex>,
    /// Wire-up messages handed to the control endpoint and not yet sent.
    pending_count: Arc<AtomicU32>,
    state: AtomicU32,
    inner: Mutex<StubInner>,
}

struct StubInner {
    /// Real endpoint under negotiation; taken by the switchover.
    next_ep: Option<Box<dyn TransportEp>>,
    aux_ep: Option<Box<dyn TransportEp>>,
    pending_q: PendingQueue,
    /// Endpoint installed by the switchover.
    promoted: Option<Arc<dyn TransportEp>>,
}

impl StubEp {
    /// Creates the stub for `op` of `ep`, with its next endpoint and, for
    /// active messages, an auxiliary endpoint chosen from `address`.
    ///
    /// On failure nothing created here outlives the call.
    pub(crate) fn create(ep: &Arc<Endpoint>, op: EpOp, address: &WorkerAddress) -> Result<Arc<Self>> {
        let worker = ep.worker().ok_or(transport::Error::EndpointClosed)?;
        let rsc_index = ep.config().resource(op).ok_or(Error::NotConfigured(op))?;
        let resource = worker.resource(rsc_index).ok_or(Error::NotConfigured(op))?;

        let next_ep = resource.iface.create_ep()?;

        let (aux_rsc_index, aux_ep) = if op == EpOp::Am {
            let aux = auxiliary::connect_aux(&worker, ep.peer_name(), &address.entries, &AuxScore)?;
            (Some(aux.rsc_index), Some(aux.ep))
        } else {
            (None, None)
        };

        debug!(
            peer = ep.peer_name(),
            %op,
            next = %resource.desc,
            aux = ?aux_rsc_index,
            "created stub ep"
        );

        Ok(Arc::new_cyclic(|me| StubEp {
            me: me.clone(),
            ep: Arc::downgrade(ep),
            op,
            aux_rsc_index,
            pending_count: Arc::new(AtomicU32::new(0)),
            state: AtomicU32::new(StubFlags::empty().bits()),
            inner: Mutex::new(StubInner {
                next_ep: Some(next_ep),
                aux_ep,
                pending_q: PendingQueue::default(),
                promoted: None,
            }),
        }))
    }

    /// The category this stub stands in for.
    pub fn op(&self) -> EpOp {
        self.op
    }

    fn flags(&self) -> StubFlags {
        StubFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: StubFlags) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn state(&self) -> StubState {
        StubState::from_flags(self.flags())
    }

    pub fn is_connected(&self) -> bool {
        self.flags().contains(StubFlags::CONNECTED)
    }

    pub fn remote_connected(&self) {
        trace!(op = %self.op, "stub remote connected");
        self.set_flags(StubFlags::REMOTE_CONNECTED);
    }

    /// Outstanding wire-up messages; switchover waits for zero.
    pub fn pending_count(&self) -> u32 {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Data requests parked on this stub.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending_q.len()
    }

    pub fn aux_rsc_index(&self) -> Option<ResourceIndex> {
        self.aux_rsc_index
    }

    pub fn has_aux_ep(&self) -> bool {
        self.inner.lock().aux_ep.is_some()
    }

    /// True once the switchover has run.
    pub fn is_switched(&self) -> bool {
        self.inner.lock().next_ep.is_none()
    }

    fn callback(&self) -> Weak<dyn Progress> {
        self.me.clone()
    }

    /// Endpoint that carries wire-up messages right now.
    fn wireup_msg_ep<'a>(&self, inner: &'a StubInner) -> transport::Result<&'a dyn TransportEp> {
        let ep = if self.is_connected() {
            inner.next_ep.as_deref()
        } else {
            inner.aux_ep.as_deref()
        };
        ep.ok_or(transport::Error::NotConnected)
    }

    fn with_next_ep<T>(&self, f: impl FnOnce(&dyn TransportEp) -> transport::Result<T>) -> transport::Result<T> {
        let inner = self.inner.lock();
        let ep = inner.next_ep.as_deref().ok_or(transport::Error::EndpointClosed)?;
        f(ep)
    }

    /// Tries to switch over and tells the caller to come back later.
    fn hold_off<T>(&self) -> transport::Result<T> {
        self.progress();
        Err(transport::Error::NoResource)
    }
}

impl TransportEp for StubEp {
    fn get_address(&self) -> transport::Result<EpAddr> {
        self.with_next_ep(|ep| ep.get_address())
    }

    fn connect_to_ep(&self, dev_addr: &DeviceAddr, ep_addr: &EpAddr) -> transport::Result<()> {
        self.with_next_ep(|ep| ep.connect_to_ep(dev_addr, ep_addr))?;
        self.set_flags(StubFlags::LOCAL_CONNECTED);
        trace!(op = %self.op, "stub local connected");
        Ok(())
    }

    fn flush(&self) -> Poll<transport::Result<()>> {
        Poll::Pending
    }

    fn pending_add(&self, req: PendingRequest) -> std::result::Result<(), PendingRequest> {
        if req.is_wireup_msg() {
            let inner = self.inner.lock();
            let Ok(msg_ep) = self.wireup_msg_ep(&inner) else {
                return Err(req);
            };
            let proxy = WireupMsgProxy::new(req, Arc::clone(&self.pending_count));
            return msg_ep.pending_add(Box::new(proxy));
        }

        let Some(worker) = self.ep.upgrade().and_then(|ep| ep.worker()) else {
            return Err(req);
        };
        let mut inner = self.inner.lock();
        if inner.next_ep.is_none() {
            return match inner.promoted.clone() {
                Some(promoted) => {
                    drop(inner);
                    promoted.pending_add(req)
                }
                None => Err(req),
            };
        }
        trace!(op = %self.op, ?req, "stub pending add");
        inner.pending_q.push(req);
        // Counted and registered before a switchover can drain the entry.
        worker.stub_pending_inc();
        worker.progress_registry().register(&self.callback());
        Ok(())
    }

    /// # Panics
    ///
    /// If requests are still parked; those are drained by the switchover.
    fn pending_purge(&self, _cb: &mut dyn FnMut(PendingRequest)) {
        let parked = self.inner.lock().pending_q.len();
        assert!(parked == 0, "purge of stub ep for {} with {} parked requests", self.op, parked);
    }

    fn put_short(&self, _buffer: &[u8], _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<()> {
        self.hold_off()
    }

    fn put_bcopy(&self, _pack: PackFn<'_>, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<usize> {
        self.hold_off()
    }

    fn put_zcopy(&self, _buffer: &[u8], _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<()> {
        self.hold_off()
    }

    fn get_bcopy(&self, _length: usize, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<Vec<u8>> {
        self.hold_off()
    }

    fn get_zcopy(&self, _buffer: &mut [u8], _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<()> {
        self.hold_off()
    }

    fn am_short(&self, _id: AmId, _header: u64, _payload: &[u8]) -> transport::Result<()> {
        self.hold_off()
    }

    fn am_bcopy(&self, id: AmId, pack: PackFn<'_>) -> transport::Result<usize> {
        if id != AM_ID_WIREUP {
            return self.hold_off();
        }
        let inner = self.inner.lock();
        self.wireup_msg_ep(&inner)?.am_bcopy(id, pack)
    }

    fn am_zcopy(&self, _id: AmId, _header: &[u8], _payload: &[u8]) -> transport::Result<()> {
        self.hold_off()
    }

    fn atomic_add64(&self, _add: u64, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<()> {
        self.hold_off()
    }

    fn atomic_fadd64(&self, _add: u64, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<u64> {
        self.hold_off()
    }

    fn atomic_swap64(&self, _swap: u64, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<u64> {
        self.hold_off()
    }

    fn atomic_cswap64(
        &self,
        _compare: u64,
        _swap: u64,
        _remote_addr: u64,
        _rkey: RemoteKey,
    ) -> transport::Result<u64> {
        self.hold_off()
    }

    fn atomic_add32(&self, _add: u32, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<()> {
        self.hold_off()
    }

    fn atomic_fadd32(&self, _add: u32, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<u32> {
        self.hold_off()
    }

    fn atomic_swap32(&self, _swap: u32, _remote_addr: u64, _rkey: RemoteKey) -> transport::Result<u32> {
        self.hold_off()
    }

    fn atomic_cswap32(
        &self,
        _compare: u32,
        _swap: u32,
        _remote_addr: u64,
        _rkey: RemoteKey,
    ) -> transport::Result<u32> {
        self.hold_off()
    }
}

impl Progress for StubEp {
    fn progress(&self) {
        StubEp::progress(self);
    }
}

impl fmt::Debug for StubEp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("StubEp");
        s.field("op", &self.op)
            .field("state", &self.state())
            .field("pending_count", &self.pending_count())
            .field("aux_rsc_index", &self.aux_rsc_index);
        if let Some(inner) = self.inner.try_lock() {
            s.field("parked", &inner.pending_q.len());
        }
        s.finish()
    }
}

impl Drop for StubEp {
    fn drop(&mut self) {
        let parked = self.inner.get_mut().pending_q.len();
        if !std::thread::panicking() {
            assert!(parked == 0, "stub ep for {} destroyed with {} parked requests", self.op, parked);
        }
    }
}

/// Marks the stub in `slot` as connected from the remote side.
///
/// # Panics
///
/// If `slot` does not hold a stub endpoint.
pub fn remote_connected(slot: &EpSlot) {
    match slot {
        EpSlot::Stub(stub) => stub.remote_connected(),
        other => panic!("remote_connected on a non-stub endpoint: {:?}", other),
    }
}

/// Resource of the auxiliary endpoint of the stub in `slot`, or `None` if
/// `slot` does not hold a stub.
///
/// # Panics
///
/// If the stub has no auxiliary endpoint.
pub fn aux_resource_index(slot: &EpSlot) -> Option<ResourceIndex> {
    let EpSlot::Stub(stub) = slot else {
        return None;
    };
    assert!(stub.has_aux_ep(), "stub ep for {} has no auxiliary endpoint", stub.op);
    stub.aux_rsc_index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EpConfig, WorkerConfig};
    use crate::worker::{Resource, Worker};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use transport::{CapFlags, Iface, LoopbackConfig, LoopbackFabric, LoopbackIface, PendingReq, TlResource};

    #[derive(Debug)]
    struct Recorded {
        seq: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl PendingReq for Recorded {
        fn progress(&mut self) -> transport::Result<()> {
            self.log.lock().push(self.seq);
            Ok(())
        }
    }

    struct Fixture {
        a_iface: Arc<LoopbackIface>,
        b_iface: Arc<LoopbackIface>,
        a: Arc<Worker>,
        b: Arc<Worker>,
        ep: Arc<Endpoint>,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Fixture {
        fn new(ep_config: EpConfig) -> Self {
            Self::with_config(ep_config, LoopbackConfig::default())
        }

        fn with_config(ep_config: EpConfig, a_config: LoopbackConfig) -> Self {
            let fabric = LoopbackFabric::new();
            let a_iface = fabric.open_iface(a_config);
            let b_iface = fabric.open_iface(LoopbackConfig::default());
            let a = Worker::new(
                WorkerConfig::new("a"),
                ep_config.clone(),
                vec![Resource::new(TlResource::new("loopback", "lo0"), a_iface.clone())],
            );
            let b = Worker::new(
                WorkerConfig::new("b"),
                ep_config,
                vec![Resource::new(TlResource::new("loopback", "lo0"), b_iface.clone())],
            );
            let ep = Endpoint::new(&a, b.uuid(), "b", "from test");
            Self {
                a_iface,
                b_iface,
                a,
                b,
                ep,
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn stub(&self, op: EpOp) -> Arc<StubEp> {
            let stub = StubEp::create(&self.ep, op, &self.b.address()).unwrap();
            self.ep.install_lane(op, EpSlot::Stub(Arc::clone(&stub)));
            stub
        }

        fn request(&self, seq: usize) -> PendingRequest {
            Box::new(Recorded {
                seq,
                log: Arc::clone(&self.log),
            })
        }

        fn connect_local(&self, stub: &StubEp) {
            let peer_ep = self.b_iface.create_ep().unwrap();
            stub.connect_to_ep(&self.b_iface.device_address(), &peer_ep.get_address().unwrap())
                .unwrap();
        }

        fn logged(&self) -> Vec<usize> {
            self.log.lock().clone()
        }
    }

    fn am_config() -> EpConfig {
        EpConfig::new().with_resource(EpOp::Am, ResourceIndex(0))
    }

    fn callback(stub: &Arc<StubEp>) -> Weak<dyn Progress> {
        let weak: Weak<StubEp> = Arc::downgrade(stub);
        weak
    }

    #[test]
    fn test_create_am_stub_has_aux() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);

        assert_eq!(stub.state(), StubState::Init);
        assert_eq!(stub.aux_rsc_index(), Some(ResourceIndex(0)));
        assert!(stub.has_aux_ep());
        // next and aux
        assert_eq!(f.a_iface.live_endpoints(), 2);
    }

    #[test]
    fn test_create_rma_stub_has_no_aux() {
        let f = Fixture::new(am_config().with_resource(EpOp::Rma, ResourceIndex(0)));
        let stub = f.stub(EpOp::Rma);

        assert_eq!(stub.aux_rsc_index(), None);
        assert!(!stub.has_aux_ep());
        assert_eq!(f.a_iface.live_endpoints(), 1);
    }

    #[test]
    fn test_aux_failure_releases_next_ep() {
        let config = LoopbackConfig {
            flags: LoopbackConfig::default_flags().difference(CapFlags::AM_BCOPY),
            ..LoopbackConfig::default()
        };
        let f = Fixture::with_config(am_config(), config);

        let err = StubEp::create(&f.ep, EpOp::Am, &f.b.address()).unwrap_err();
        assert!(matches!(err, Error::NoSuitableResource { .. }));
        assert_eq!(f.a_iface.live_endpoints(), 0);
    }

    #[test]
    fn test_state_flags_are_independent() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);

        stub.remote_connected();
        assert_eq!(stub.state(), StubState::RemoteConnected);
        f.connect_local(&stub);
        assert_eq!(stub.state(), StubState::Connected);
    }

    #[test]
    fn test_connect_failure_leaves_state() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);

        let err = stub.connect_to_ep(&f.b_iface.device_address(), &EpAddr(vec![1, 2, 3]));
        assert!(matches!(err, Err(transport::Error::InvalidAddress(_))));
        assert_eq!(stub.state(), StubState::Init);
    }

    #[test]
    fn test_sends_are_held_off() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);

        assert_eq!(stub.am_short(5, 0, b"x"), Err(transport::Error::NoResource));
        assert_eq!(
            stub.put_short(b"x", 0, RemoteKey(0)),
            Err(transport::Error::NoResource)
        );
        assert_eq!(
            stub.atomic_fadd64(1, 0, RemoteKey(0)),
            Err(transport::Error::NoResource)
        );
        assert!(stub.flush().is_pending());
    }

    #[test]
    fn test_wireup_msg_goes_through_aux() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);

        let sent = stub.am_bcopy(AM_ID_WIREUP, &|buf: &mut Vec<u8>| buf.extend_from_slice(b"hi"));
        assert_eq!(sent, Ok(2));
        assert_eq!(f.b_iface.inbox_len(), 1);
    }

    #[test]
    fn test_pending_add_registers_once_per_request() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);
        let cb = callback(&stub);

        stub.pending_add(f.request(0)).unwrap();
        stub.pending_add(f.request(1)).unwrap();

        assert_eq!(stub.pending_len(), 2);
        assert_eq!(f.a.stub_pending_count(), 2);
        assert_eq!(f.a.progress_registry().len(), 1);
        assert_eq!(f.a.progress_registry().registrations(&cb), 2);

        f.connect_local(&stub);
        stub.remote_connected();
        assert!(stub.progress());

        assert_eq!(f.a.progress_registry().registrations(&cb), 0);
        assert!(f.a.progress_registry().is_empty());
        assert_eq!(f.a.stub_pending_count(), 0);
    }

    #[test]
    fn test_concurrent_pending_add_during_switchover() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);
        f.connect_local(&stub);

        let adder = {
            let ep = Arc::clone(&f.ep);
            let stub = Arc::clone(&stub);
            let log = Arc::clone(&f.log);
            thread::spawn(move || {
                for seq in 0..200 {
                    ep.add_pending(stub.as_ref(), Box::new(Recorded { seq, log: Arc::clone(&log) }));
                }
            })
        };
        stub.remote_connected();
        while !stub.progress() {}
        adder.join().unwrap();

        let mut logged = f.logged();
        logged.sort_unstable();
        assert_eq!(logged, (0..200).collect::<Vec<_>>());
        assert_eq!(stub.pending_len(), 0);
        assert_eq!(f.a.stub_pending_count(), 0);
        assert!(f.a.progress_registry().is_empty());
    }

    #[test]
    fn test_switchover_replays_in_order() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);
        for seq in 0..5 {
            f.ep.add_pending(stub.as_ref(), f.request(seq));
        }
        assert!(f.logged().is_empty());

        f.connect_local(&stub);
        assert!(!stub.progress());
        stub.remote_connected();
        assert!(stub.progress());
        assert!(!stub.progress());

        assert_eq!(f.logged(), vec![0, 1, 2, 3, 4]);
        assert!(matches!(f.ep.slot(EpOp::Am), EpSlot::Transport(_)));
        assert!(stub.is_switched());
        assert!(!stub.has_aux_ep());
        // only the test's handle is left
        assert_eq!(Arc::strong_count(&stub), 1);
        // the promoted next ep survives, the aux ep does not
        assert_eq!(f.a_iface.live_endpoints(), 1);
    }

    #[test]
    fn test_switchover_waits_for_wireup_msgs() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);
        f.connect_local(&stub);
        stub.remote_connected();

        let held = WireupMsgProxy::new(f.request(9), Arc::clone(&stub.pending_count));
        assert_eq!(stub.pending_count(), 1);
        assert!(!stub.progress());

        drop(held);
        assert!(stub.progress());
    }

    #[test]
    fn test_switchover_propagates_to_aliases() {
        let f = Fixture::new(am_config().with_dup(EpOp::Rma, EpOp::Am));
        let stub = f.stub(EpOp::Am);
        assert!(f.ep.slot(EpOp::Rma).is_stub());

        f.connect_local(&stub);
        stub.remote_connected();
        assert!(stub.progress());

        let am = f.ep.uct_ep(EpOp::Am).unwrap();
        let rma = f.ep.uct_ep(EpOp::Rma).unwrap();
        assert!(!f.ep.slot(EpOp::Rma).is_stub());
        assert!(Arc::ptr_eq(&am, &rma));
        assert!(f.ep.slot(EpOp::Amo).is_empty());
    }

    #[test]
    fn test_pending_add_after_switchover_goes_to_promoted() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);
        f.connect_local(&stub);
        stub.remote_connected();
        assert!(stub.progress());

        f.ep.add_pending(stub.as_ref(), f.request(7));
        assert_eq!(f.logged(), vec![7]);
        assert_eq!(stub.pending_len(), 0);
        assert_eq!(f.a.stub_pending_count(), 0);
    }

    #[test]
    fn test_async_remote_connected_is_observed() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);
        f.connect_local(&stub);

        f.a.notifier().remote_connected(f.b.uuid(), EpOp::Am);
        assert!(stub.progress());
    }

    #[test]
    #[should_panic(expected = "parked requests")]
    fn test_purge_with_parked_requests_panics() {
        let f = Fixture::new(am_config());
        let stub = f.stub(EpOp::Am);
        stub.pending_add(f.request(0)).unwrap();

        f.ep.destroy();
    }

    #[test]
    #[should_panic(expected = "parked requests")]
    fn test_drop_with_parked_requests_panics() {
        let f = Fixture::new(am_config());
        let stub = StubEp::create(&f.ep, EpOp::Am, &f.b.address()).unwrap();
        stub.pending_add(f.request(0)).unwrap();

        drop(stub);
    }

    #[test]
    fn test_aux_resource_index() {
        let f = Fixture::new(am_config().with_resource(EpOp::Rma, ResourceIndex(0)));
        assert_eq!(aux_resource_index(&EpSlot::Empty), None);

        let stub = f.stub(EpOp::Am);
        assert_eq!(aux_resource_index(&EpSlot::Stub(stub)), Some(ResourceIndex(0)));
    }

    #[test]
    #[should_panic(expected = "no auxiliary endpoint")]
    fn test_aux_resource_index_without_aux_panics() {
        let f = Fixture::new(am_config().with_resource(EpOp::Rma, ResourceIndex(0)));
        let stub = f.stub(EpOp::Rma);
        aux_resource_index(&EpSlot::Stub(stub));
    }

    #[test]
    #[should_panic(expected = "non-stub")]
    fn test_remote_connected_on_non_stub_panics() {
        remote_connected(&EpSlot::Empty);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Enqueue,
        Local,
        Remote,
        Hold,
        Release,
        Progress,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => Just(Step::Enqueue),
            1 => Just(Step::Local),
            1 => Just(Step::Remote),
            1 => Just(Step::Hold),
            1 => Just(Step::Release),
            2 => Just(Step::Progress),
        ]
    }

    proptest! {
        // Test that parked requests are replayed exactly once, in order.
        #[test]
        fn prop_replay_is_fifo(count in 0usize..32) {
            let f = Fixture::new(am_config());
            let stub = f.stub(EpOp::Am);
            for seq in 0..count {
                f.ep.add_pending(stub.as_ref(), f.request(seq));
            }
            f.connect_local(&stub);
            stub.remote_connected();
            prop_assert!(stub.progress());

            prop_assert_eq!(f.logged(), (0..count).collect::<Vec<_>>());
            prop_assert_eq!(f.a.stub_pending_count(), 0);
            prop_assert!(f.a.progress_registry().is_empty());
        }

        // Test that switchover fires exactly when both sides are connected
        // and no wire-up message is outstanding.
        #[test]
        fn prop_switchover_gate(steps in prop::collection::vec(step(), 0..40)) {
            let f = Fixture::new(am_config());
            let stub = f.stub(EpOp::Am);
            let (mut local, mut remote, mut switched) = (false, false, false);
            let mut held = Vec::new();
            let mut enqueued = 0;

            for step in steps {
                match step {
                    Step::Enqueue => {
                        f.ep.add_pending(stub.as_ref(), f.request(enqueued));
                        enqueued += 1;
                    }
                    Step::Local if !switched => {
                        f.connect_local(&stub);
                        local = true;
                    }
                    Step::Local => {}
                    Step::Remote => {
                        stub.remote_connected();
                        remote = true;
                    }
                    Step::Hold => {
                        held.push(WireupMsgProxy::new(f.request(usize::MAX), Arc::clone(&stub.pending_count)));
                    }
                    Step::Release => {
                        held.pop();
                    }
                    Step::Progress => {
                        let expected = !switched && local && remote && held.is_empty();
                        prop_assert_eq!(stub.progress(), expected);
                        switched |= expected;
                    }
                }
                prop_assert_eq!(stub.pending_count() as usize, held.len());
            }

            held.clear();
            if !local {
                f.connect_local(&stub);
            }
            stub.remote_connected();
            stub.progress();

            prop_assert!(stub.is_switched());
            prop_assert_eq!(f.logged(), (0..enqueued).collect::<Vec<_>>());
            prop_assert_eq!(f.a.stub_pending_count(), 0);
        }
    }
}
