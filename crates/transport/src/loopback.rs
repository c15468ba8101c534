//! In-process loopback transport.
//!
//! A [`LoopbackFabric`] is a process-local "network": every interface opened
//! on it can reach every other one. Active messages are queued on the
//! destination interface and delivered to its handlers when that interface is
//! progressed. Each endpoint owns a fixed number of transmit credits; a credit
//! is consumed per message and returned on delivery, so a sender that outruns
//! its peer sees [`Error::NoResource`] and parks requests on the endpoint's
//! pending queue.
//!
//! # Addresses
//!
//! - device address: fabric id (8 bytes, little endian)
//! - interface address: interface id (8 bytes)
//! - endpoint address: interface id + endpoint id (16 bytes)

use crate::ep::{PackFn, PendingRequest, TransportEp};
use crate::error::{Error, Result};
use crate::iface::{
    AmHandler, AmId, CapFlags, DeviceAddr, EpAddr, Iface, IfaceAddr, IfaceAttr, IfaceCap, OpLimits,
};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;
use tracing::{trace, warn};

static NEXT_FABRIC_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables of a loopback interface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub flags: CapFlags,
    /// Advertised latency in seconds.
    pub latency: f64,
    /// Advertised bandwidth in bytes per second.
    pub bandwidth: f64,
    pub max_short: usize,
    pub max_bcopy: usize,
    /// Messages an endpoint may have in flight before it runs out of resources.
    pub tx_credits: usize,
}

impl LoopbackConfig {
    /// Everything the loopback transport implements.
    pub fn default_flags() -> CapFlags {
        CapFlags::CONNECT_TO_IFACE
            | CapFlags::CONNECT_TO_EP
            | CapFlags::AM_SHORT
            | CapFlags::AM_BCOPY
            | CapFlags::PENDING
            | CapFlags::AM_CB_SYNC
    }

    pub fn attr(&self) -> IfaceAttr {
        IfaceAttr {
            cap: IfaceCap {
                flags: self.flags,
                am: OpLimits {
                    max_short: self.max_short,
                    max_bcopy: self.max_bcopy,
                    max_zcopy: 0,
                },
                put: OpLimits::default(),
                get: OpLimits::default(),
            },
            latency: self.latency,
            bandwidth: self.bandwidth,
            overhead: 0.0,
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            flags: Self::default_flags(),
            latency: 5e-7,
            bandwidth: 6911.0 * 1024.0 * 1024.0,
            max_short: 256,
            max_bcopy: 8192,
            tx_credits: 64,
        }
    }
}

struct FabricShared {
    id: u64,
    next_iface: AtomicU64,
    ifaces: Mutex<HashMap<u64, Weak<LoopbackIface>>>,
}

/// A process-local network of loopback interfaces.
#[derive(Clone)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FabricShared {
                id: NEXT_FABRIC_ID.fetch_add(1, Ordering::Relaxed),
                next_iface: AtomicU64::new(1),
                ifaces: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Opens a new interface on this fabric.
    pub fn open_iface(&self, config: LoopbackConfig) -> Arc<LoopbackIface> {
        let id = self.shared.next_iface.fetch_add(1, Ordering::Relaxed);
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let iface = Arc::new_cyclic(|me| LoopbackIface {
            id,
            fabric: Arc::clone(&self.shared),
            attr: config.attr(),
            config,
            inbox_tx,
            inbox_rx,
            handlers: RwLock::new(HashMap::new()),
            eps: Mutex::new(Vec::new()),
            next_ep: AtomicU64::new(1),
            me: me.clone(),
        });
        let mut ifaces = self.shared.ifaces.lock();
        ifaces.retain(|_, iface| iface.strong_count() > 0);
        ifaces.insert(id, Arc::downgrade(&iface));
        iface
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackFabric").field("id", &self.shared.id).finish()
    }
}

impl FabricShared {
    fn lookup(&self, iface_id: u64) -> Option<Arc<LoopbackIface>> {
        self.ifaces.lock().get(&iface_id).and_then(Weak::upgrade)
    }
}

struct Delivery {
    id: AmId,
    data: Vec<u8>,
    sender: Weak<EpShared>,
}

/// One loopback interface.
pub struct LoopbackIface {
    id: u64,
    fabric: Arc<FabricShared>,
    config: LoopbackConfig,
    attr: IfaceAttr,
    inbox_tx: Sender<Delivery>,
    inbox_rx: Receiver<Delivery>,
    handlers: RwLock<HashMap<AmId, AmHandler>>,
    eps: Mutex<Vec<Weak<EpShared>>>,
    next_ep: AtomicU64,
    me: Weak<LoopbackIface>,
}

impl LoopbackIface {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Number of endpoints created on this interface that are still alive.
    pub fn live_endpoints(&self) -> usize {
        self.live_eps().len()
    }

    /// Messages queued for delivery on this interface.
    pub fn inbox_len(&self) -> usize {
        self.inbox_rx.len()
    }

    fn live_eps(&self) -> Vec<Arc<EpShared>> {
        let mut eps = self.eps.lock();
        eps.retain(|ep| ep.strong_count() > 0);
        eps.iter().filter_map(Weak::upgrade).collect()
    }

    fn new_ep(&self, dest: Option<Weak<LoopbackIface>>) -> Box<dyn TransportEp> {
        let shared = Arc::new_cyclic(|me| EpShared {
            id: self.next_ep.fetch_add(1, Ordering::Relaxed),
            iface: self.me.clone(),
            me: me.clone(),
            flags: self.config.flags,
            limits: self.attr.cap.am,
            tx_credits: self.config.tx_credits,
            credits: AtomicUsize::new(self.config.tx_credits),
            dest: Mutex::new(dest),
            pending: Mutex::new(VecDeque::new()),
        });
        trace!(iface = self.id, ep = shared.id, "created loopback ep");
        self.eps.lock().push(Arc::downgrade(&shared));
        Box::new(LoopbackEp { shared })
    }

    fn check_reachable(&self, dev_addr: &DeviceAddr) -> Result<()> {
        if self.is_reachable(dev_addr) {
            Ok(())
        } else {
            Err(Error::Unreachable)
        }
    }

    fn deliver(&self, delivery: Delivery) -> Result<()> {
        self.inbox_tx.send(delivery).map_err(|_| Error::Unreachable)
    }
}

impl Iface for LoopbackIface {
    fn attr(&self) -> &IfaceAttr {
        &self.attr
    }

    fn device_address(&self) -> DeviceAddr {
        DeviceAddr(self.fabric.id.to_le_bytes().to_vec())
    }

    fn iface_address(&self) -> IfaceAddr {
        IfaceAddr(self.id.to_le_bytes().to_vec())
    }

    fn is_reachable(&self, dev_addr: &DeviceAddr) -> bool {
        read_u64(dev_addr.as_bytes(), "device").map_or(false, |id| id == self.fabric.id)
    }

    fn create_ep(&self) -> Result<Box<dyn TransportEp>> {
        if !self.config.flags.contains(CapFlags::CONNECT_TO_EP) {
            return Err(Error::Unsupported("connect_to_ep"));
        }
        Ok(self.new_ep(None))
    }

    fn create_ep_connected(
        &self,
        dev_addr: &DeviceAddr,
        iface_addr: &IfaceAddr,
    ) -> Result<Box<dyn TransportEp>> {
        if !self.config.flags.contains(CapFlags::CONNECT_TO_IFACE) {
            return Err(Error::Unsupported("connect_to_iface"));
        }
        self.check_reachable(dev_addr)?;
        let dest_id = read_u64(iface_addr.as_bytes(), "interface")?;
        let dest = self.fabric.lookup(dest_id).ok_or(Error::Unreachable)?;
        Ok(self.new_ep(Some(Arc::downgrade(&dest))))
    }

    fn set_am_handler(&self, id: AmId, handler: AmHandler) {
        self.handlers.write().insert(id, handler);
    }

    fn progress(&self) -> usize {
        let mut count = 0;
        // Only what arrived before this call; handlers may send more.
        for _ in 0..self.inbox_rx.len() {
            let Ok(delivery) = self.inbox_rx.try_recv() else {
                break;
            };
            let handler = self.handlers.read().get(&delivery.id).cloned();
            match handler {
                Some(handler) => handler(&delivery.data),
                None => warn!(
                    iface = self.id,
                    am_id = delivery.id,
                    "dropping active message without handler"
                ),
            }
            if let Some(sender) = delivery.sender.upgrade() {
                sender.credits.fetch_add(1, Ordering::AcqRel);
            }
            count += 1;
        }
        for ep in self.live_eps() {
            count += ep.dispatch_pending();
        }
        count
    }
}

struct EpShared {
    id: u64,
    iface: Weak<LoopbackIface>,
    me: Weak<EpShared>,
    flags: CapFlags,
    limits: OpLimits,
    tx_credits: usize,
    credits: AtomicUsize,
    dest: Mutex<Option<Weak<LoopbackIface>>>,
    pending: Mutex<VecDeque<PendingRequest>>,
}

impl EpShared {
    fn dest(&self) -> Result<Arc<LoopbackIface>> {
        match self.dest.lock().as_ref() {
            None => Err(Error::NotConnected),
            Some(dest) => dest.upgrade().ok_or(Error::Unreachable),
        }
    }

    fn send(&self, id: AmId, data: Vec<u8>) -> Result<()> {
        let dest = self.dest()?;
        self.credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .map_err(|_| Error::NoResource)?;
        trace!(ep = self.id, am_id = id, len = data.len(), "loopback send");
        dest.deliver(Delivery {
            id,
            data,
            sender: self.me.clone(),
        })
    }

    fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        while self.credits.load(Ordering::Acquire) > 0 {
            let Some(mut req) = self.pending.lock().pop_front() else {
                break;
            };
            match req.progress() {
                Err(Error::NoResource) => {
                    self.pending.lock().push_front(req);
                    break;
                }
                _ => count += 1,
            }
        }
        count
    }
}

impl Drop for EpShared {
    fn drop(&mut self) {
        for req in self.pending.get_mut().drain(..) {
            req.cancel();
        }
    }
}

/// Endpoint of the loopback transport.
pub struct LoopbackEp {
    shared: Arc<EpShared>,
}

impl LoopbackEp {
    fn require(&self, flag: CapFlags, what: &'static str) -> Result<()> {
        if self.shared.flags.contains(flag) {
            Ok(())
        } else {
            Err(Error::Unsupported(what))
        }
    }

    fn check_len(len: usize, max: usize) -> Result<()> {
        if len > max {
            return Err(Error::MessageTooLarge { len, max });
        }
        Ok(())
    }
}

impl fmt::Debug for LoopbackEp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEp")
            .field("id", &self.shared.id)
            .field("credits", &self.shared.credits.load(Ordering::Relaxed))
            .field("pending", &self.shared.pending.lock().len())
            .finish()
    }
}

impl TransportEp for LoopbackEp {
    fn get_address(&self) -> Result<EpAddr> {
        self.require(CapFlags::CONNECT_TO_EP, "connect_to_ep")?;
        let iface = self.shared.iface.upgrade().ok_or(Error::EndpointClosed)?;
        let mut addr = iface.id.to_le_bytes().to_vec();
        addr.extend_from_slice(&self.shared.id.to_le_bytes());
        Ok(EpAddr(addr))
    }

    fn connect_to_ep(&self, dev_addr: &DeviceAddr, ep_addr: &EpAddr) -> Result<()> {
        self.require(CapFlags::CONNECT_TO_EP, "connect_to_ep")?;
        let iface = self.shared.iface.upgrade().ok_or(Error::EndpointClosed)?;
        iface.check_reachable(dev_addr)?;
        let bytes = ep_addr.as_bytes();
        if bytes.len() != 16 {
            return Err(Error::InvalidAddress(format!(
                "endpoint address of {} bytes",
                bytes.len()
            )));
        }
        let dest_id = read_u64(bytes, "endpoint")?;
        let dest = iface.fabric.lookup(dest_id).ok_or(Error::Unreachable)?;
        *self.shared.dest.lock() = Some(Arc::downgrade(&dest));
        trace!(ep = self.shared.id, dest = dest_id, "loopback ep connected");
        Ok(())
    }

    fn flush(&self) -> Poll<Result<()>> {
        let idle = self.shared.credits.load(Ordering::Acquire) == self.shared.tx_credits
            && self.shared.pending.lock().is_empty();
        if idle {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    fn pending_add(&self, req: PendingRequest) -> std::result::Result<(), PendingRequest> {
        let mut pending = self.shared.pending.lock();
        if pending.is_empty() && self.shared.credits.load(Ordering::Acquire) > 0 {
            return Err(req);
        }
        pending.push_back(req);
        Ok(())
    }

    fn pending_purge(&self, cb: &mut dyn FnMut(PendingRequest)) {
        let drained: Vec<PendingRequest> = self.shared.pending.lock().drain(..).collect();
        for req in drained {
            cb(req);
        }
    }

    fn am_short(&self, id: AmId, header: u64, payload: &[u8]) -> Result<()> {
        self.require(CapFlags::AM_SHORT, "am_short")?;
        let mut data = Vec::with_capacity(8 + payload.len());
        data.extend_from_slice(&header.to_le_bytes());
        data.extend_from_slice(payload);
        Self::check_len(data.len(), self.shared.limits.max_short)?;
        self.shared.send(id, data)
    }

    fn am_bcopy(&self, id: AmId, pack: PackFn<'_>) -> Result<usize> {
        self.require(CapFlags::AM_BCOPY, "am_bcopy")?;
        let mut data = Vec::new();
        pack(&mut data);
        let len = data.len();
        Self::check_len(len, self.shared.limits.max_bcopy)?;
        self.shared.send(id, data)?;
        Ok(len)
    }
}

fn read_u64(bytes: &[u8], what: &str) -> Result<u64> {
    bytes
        .get(..8)
        .and_then(|head| <[u8; 8]>::try_from(head).ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| Error::InvalidAddress(format!("short {} address", what)))
}
