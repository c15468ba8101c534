//! Endpoints and their per-category dispatch tables.
//!
//! An [`Endpoint`] connects a worker to one remote worker. Each operation
//! category has a slot holding the transport endpoint that carries it. While
//! a category is being wired up the slot holds a stub, which parks sends
//! until the real transport is connected on both sides.

use crate::config::{EpConfig, EpOp, WorkerConfig, EP_OP_LAST};
use crate::request::{AmSendRequest, RequestHandle};
use crate::stub::{self, StubEp};
use crate::worker::Worker;
use parking_lot::RwLock;
use std::fmt;
use std::hint;
use std::sync::{Arc, Weak};
use std::thread;
use std::task::Poll;
use tracing::{debug, trace, warn};
use transport::{AmId, Error, PendingRequest, ResourceIndex, TransportEp};

/// Contents of one dispatch-table slot.
#[derive(Clone, Default)]
pub enum EpSlot {
    /// The category is not configured.
    #[default]
    Empty,
    /// A wired-up transport endpoint.
    Transport(Arc<dyn TransportEp>),
    /// A stub standing in while the category is wired up.
    Stub(Arc<StubEp>),
}

impl EpSlot {
    /// The slot's endpoint behind the common transport surface.
    pub fn transport(&self) -> Option<Arc<dyn TransportEp>> {
        match self {
            EpSlot::Empty => None,
            EpSlot::Transport(ep) => Some(Arc::clone(ep)),
            EpSlot::Stub(stub) => {
                let ep: Arc<dyn TransportEp> = stub.clone();
                Some(ep)
            }
        }
    }

    pub fn stub(&self) -> Option<&Arc<StubEp>> {
        match self {
            EpSlot::Stub(stub) => Some(stub),
            _ => None,
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, EpSlot::Stub(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, EpSlot::Empty)
    }

    fn identity(&self) -> Option<*const ()> {
        match self {
            EpSlot::Empty => None,
            EpSlot::Transport(ep) => Some(Arc::as_ptr(ep) as *const ()),
            EpSlot::Stub(stub) => Some(Arc::as_ptr(stub) as *const ()),
        }
    }
}

impl fmt::Debug for EpSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpSlot::Empty => f.write_str("Empty"),
            EpSlot::Transport(ep) => f.debug_tuple("Transport").field(ep).finish(),
            EpSlot::Stub(stub) => f.debug_tuple("Stub").field(stub).finish(),
        }
    }
}

/// A worker's connection to one remote worker.
///
/// The worker owns its endpoints; an endpoint only refers back to it.
pub struct Endpoint {
    worker: Weak<Worker>,
    worker_uuid: u64,
    worker_config: WorkerConfig,
    dest_uuid: u64,
    peer_name: String,
    config: EpConfig,
    uct_eps: RwLock<[EpSlot; EP_OP_LAST]>,
}

impl Endpoint {
    /// Creates an endpoint with an empty dispatch table and adds it to the
    /// worker's directory.
    pub(crate) fn new(worker: &Arc<Worker>, dest_uuid: u64, peer_name: &str, message: &str) -> Arc<Self> {
        let ep = Arc::new(Self {
            worker: Arc::downgrade(worker),
            worker_uuid: worker.uuid(),
            worker_config: worker.config().clone(),
            dest_uuid,
            peer_name: peer_name.to_string(),
            config: worker.ep_config().clone(),
            uct_eps: RwLock::new(Default::default()),
        });
        worker.ep_insert(Arc::clone(&ep));
        debug!(
            "created ep to {} {:016x}->{:016x} {}",
            peer_name,
            worker.uuid(),
            dest_uuid,
            message
        );
        ep
    }

    /// The owning worker, unless it has been dropped.
    pub fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.upgrade()
    }

    pub fn dest_uuid(&self) -> u64 {
        self.dest_uuid
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn config(&self) -> &EpConfig {
        &self.config
    }

    /// Snapshot of the slot for `op`.
    pub fn slot(&self, op: EpOp) -> EpSlot {
        self.uct_eps.read()[op.index()].clone()
    }

    /// The endpoint currently carrying `op`.
    pub fn uct_ep(&self, op: EpOp) -> Option<Arc<dyn TransportEp>> {
        self.uct_eps.read()[op.index()].transport()
    }

    /// True once every configured category has a wired-up endpoint.
    pub fn is_wired_up(&self) -> bool {
        let slots = self.uct_eps.read();
        self.config
            .lanes()
            .all(|lane| matches!(slots[lane.index()], EpSlot::Transport(_)))
    }

    /// Installs `slot` for `lane` and every category aliased to it.
    pub(crate) fn install_lane(&self, lane: EpOp, slot: EpSlot) {
        let mut slots = self.uct_eps.write();
        for op in self.config.slots_of(lane) {
            slots[op.index()] = slot.clone();
        }
    }

    /// Replaces `stub` with `promoted` wherever the stub is installed.
    ///
    /// Returns the number of slots replaced.
    pub(crate) fn promote(&self, stub: &StubEp, promoted: &Arc<dyn TransportEp>) -> usize {
        let mut slots = self.uct_eps.write();
        let mut replaced = 0;
        for op in self.config.slots_of(stub.op()) {
            let slot = &mut slots[op.index()];
            if slot.stub().map_or(false, |s| std::ptr::eq(Arc::as_ptr(s), stub)) {
                *slot = EpSlot::Transport(Arc::clone(promoted));
                replaced += 1;
            }
        }
        replaced
    }

    /// Marks the stub for `op` as connected from the remote side.
    ///
    /// # Panics
    ///
    /// If the slot for `op` does not hold a stub.
    pub fn remote_connected(&self, op: EpOp) {
        stub::remote_connected(&self.slot(op));
    }

    /// Resource of the auxiliary endpoint used while `op` is wired up.
    pub fn aux_resource_index(&self, op: EpOp) -> Option<ResourceIndex> {
        stub::aux_resource_index(&self.slot(op))
    }

    /// Progresses every stub of this endpoint once.
    ///
    /// Stubs are otherwise progressed only while they hold parked requests
    /// or when a send hits them. Returns the number of switchovers performed.
    pub fn progress_wireup(&self) -> usize {
        let stubs: Vec<Arc<StubEp>> = {
            let slots = self.uct_eps.read();
            let mut stubs: Vec<Arc<StubEp>> = Vec::new();
            for stub in slots.iter().filter_map(EpSlot::stub) {
                if !stubs.iter().any(|s| Arc::ptr_eq(s, stub)) {
                    stubs.push(Arc::clone(stub));
                }
            }
            stubs
        };
        stubs.iter().filter(|stub| stub.progress()).count()
    }

    /// Queues `req` on `uct_ep`, progressing it directly whenever the
    /// endpoint hands it back. Returns once the request is queued or done.
    pub fn add_pending(&self, uct_ep: &dyn TransportEp, req: PendingRequest) {
        trace!(peer = %self.peer_name, ?req, "add pending request");
        let limit = self.worker_config.replay_yield_after;
        let mut req = req;
        let mut spins: u32 = 0;
        loop {
            req = match uct_ep.pending_add(req) {
                Ok(()) => return,
                Err(req) => req,
            };
            if !matches!(req.progress(), Err(Error::NoResource)) {
                return;
            }

            spins = spins.saturating_add(1);
            if spins == limit {
                warn!(peer = %self.peer_name, spins, "pending request keeps bouncing, yielding");
            }
            if spins >= limit {
                thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
    }

    /// Sends an active message, parking it if the endpoint has no resources.
    pub fn send_am(self: &Arc<Self>, id: AmId, payload: Vec<u8>) -> RequestHandle {
        let req = AmSendRequest::new(self, id, payload);
        let handle = req.handle();
        let mut req: PendingRequest = Box::new(req);
        if let Err(Error::NoResource) = req.progress() {
            match self.uct_ep(EpOp::Am) {
                Some(uct_ep) => self.add_pending(uct_ep.as_ref(), req),
                None => req.cancel(),
            }
        }
        handle
    }

    /// Destroys every transport endpoint and removes this endpoint from the
    /// worker's directory.
    ///
    /// Requests still queued on wired-up endpoints are cancelled, then each
    /// endpoint is flushed while driving worker progress. An endpoint whose
    /// flush does not complete within `WorkerConfig::flush_attempts` rounds
    /// is released with its operations in flight.
    ///
    /// # Panics
    ///
    /// If a stub still holds parked requests.
    pub fn destroy(&self) {
        let slots = std::mem::take(&mut *self.uct_eps.write());
        let worker = self.worker();
        if let Some(worker) = &worker {
            worker.ep_remove(self.dest_uuid);
        }

        let mut seen = Vec::with_capacity(EP_OP_LAST);
        for slot in &slots {
            let Some(identity) = slot.identity() else {
                continue;
            };
            if seen.contains(&identity) {
                continue;
            }
            seen.push(identity);
            match slot {
                EpSlot::Empty => {}
                EpSlot::Stub(stub) => stub.pending_purge(&mut |req: PendingRequest| req.cancel()),
                EpSlot::Transport(ep) => self.destroy_uct_ep_safe(worker.as_deref(), ep.as_ref()),
            }
        }
        debug!(
            "destroyed ep to {} {:016x}->{:016x}",
            self.peer_name, self.worker_uuid, self.dest_uuid
        );
    }

    fn destroy_uct_ep_safe(&self, worker: Option<&Worker>, ep: &dyn TransportEp) {
        ep.pending_purge(&mut |req: PendingRequest| req.cancel());
        let attempts = self.worker_config.flush_attempts;
        let mut round = 0;
        loop {
            match ep.flush() {
                Poll::Ready(Ok(())) => return,
                Poll::Ready(Err(err)) => {
                    warn!(peer = %self.peer_name, %err, "flush failed while destroying ep");
                    return;
                }
                Poll::Pending if round >= attempts => {
                    warn!(
                        peer = %self.peer_name,
                        rounds = round,
                        ?ep,
                        "releasing ep with operations in flight"
                    );
                    return;
                }
                Poll::Pending => {
                    if let Some(worker) = worker {
                        worker.progress();
                    }
                    round += 1;
                }
            }
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer_name)
            .field("dest_uuid", &format_args!("{:016x}", self.dest_uuid))
            .field("uct_eps", &*self.uct_eps.read())
            .finish()
    }
}
