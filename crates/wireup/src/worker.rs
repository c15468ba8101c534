//! Worker: the progress-driving context shared by all endpoints.
//!
//! A worker opens a set of transport resources, keeps a directory of
//! endpoints keyed by peer uuid, and runs the progress loop that delivers
//! messages, applies async events and drives stub endpoints towards
//! switchover.

use crate::address::{AddressEntry, WorkerAddress};
use crate::async_context::{AsyncContext, AsyncEvent, AsyncNotifier};
use crate::config::{EpConfig, WorkerConfig};
use crate::endpoint::{EpSlot, Endpoint};
use crate::error::Result;
use crate::proto;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use transport::{AmHandler, AmId, Iface, ProgressRegistry, ResourceIndex, TlResource};

static NEXT_UUID: AtomicU64 = AtomicU64::new(1);

fn generate_uuid() -> u64 {
    (u64::from(std::process::id()) << 32) | NEXT_UUID.fetch_add(1, Ordering::Relaxed)
}

/// A transport resource opened by a worker.
#[derive(Clone)]
pub struct Resource {
    pub desc: TlResource,
    pub iface: Arc<dyn Iface>,
}

impl Resource {
    pub fn new(desc: TlResource, iface: Arc<dyn Iface>) -> Self {
        Self { desc, iface }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("desc", &self.desc)
            .field("flags", &self.iface.attr().cap.flags)
            .finish()
    }
}

/// Resources a worker can address with a [`ResourceIndex`].
pub const MAX_RESOURCES: usize = u8::MAX as usize + 1;

/// The progress-driving context of a set of endpoints.
pub struct Worker {
    uuid: u64,
    config: WorkerConfig,
    ep_config: EpConfig,
    resources: Vec<Resource>,
    async_ctx: AsyncContext,
    progress: ProgressRegistry,
    stub_pend_count: AtomicU32,
    eps: DashMap<u64, Arc<Endpoint>>,
}

impl Worker {
    /// Creates a worker over `resources`; `ep_config` applies to every
    /// endpoint it creates, including ones a peer initiates.
    ///
    /// Resources past [`MAX_RESOURCES`] are closed and not used.
    pub fn new(config: WorkerConfig, ep_config: EpConfig, mut resources: Vec<Resource>) -> Arc<Self> {
        if resources.len() > MAX_RESOURCES {
            warn!(
                worker = %config.name,
                opened = resources.len(),
                kept = MAX_RESOURCES,
                "too many transport resources, ignoring the rest"
            );
            resources.truncate(MAX_RESOURCES);
        }
        let uuid = config.uuid.unwrap_or_else(generate_uuid);
        let worker = Arc::new(Self {
            uuid,
            config,
            ep_config,
            resources,
            async_ctx: AsyncContext::new(),
            progress: ProgressRegistry::new(),
            stub_pend_count: AtomicU32::new(0),
            eps: DashMap::new(),
        });
        proto::install(&worker);
        debug!(
            worker = %worker.config.name,
            uuid = format_args!("{:016x}", uuid),
            resources = worker.resources.len(),
            "created worker"
        );
        worker
    }

    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn ep_config(&self) -> &EpConfig {
        &self.ep_config
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource(&self, index: ResourceIndex) -> Option<&Resource> {
        self.resources.get(usize::from(index))
    }

    /// Address peers use to create endpoints to this worker.
    pub fn address(&self) -> WorkerAddress {
        WorkerAddress {
            uuid: self.uuid,
            name: self.config.name.clone(),
            entries: self
                .resources
                .iter()
                .map(|rsc| AddressEntry {
                    tl_name: rsc.desc.tl_name.clone(),
                    dev_name: rsc.desc.dev_name.clone(),
                    dev_addr: rsc.iface.device_address(),
                    iface_addr: rsc.iface.iface_address(),
                })
                .collect(),
        }
    }

    /// Installs an active-message handler on every resource.
    pub fn set_am_handler(&self, id: AmId, handler: AmHandler) {
        for rsc in &self.resources {
            rsc.iface.set_am_handler(id, Arc::clone(&handler));
        }
    }

    pub fn async_ctx(&self) -> &AsyncContext {
        &self.async_ctx
    }

    /// Handle for posting async events from other threads.
    pub fn notifier(&self) -> AsyncNotifier {
        self.async_ctx.notifier()
    }

    pub fn progress_registry(&self) -> &ProgressRegistry {
        &self.progress
    }

    /// Requests parked on stub endpoints and not yet replayed.
    pub fn stub_pending_count(&self) -> u32 {
        self.stub_pend_count.load(Ordering::Acquire)
    }

    pub(crate) fn stub_pending_inc(&self) {
        self.stub_pend_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn stub_pending_dec(&self) {
        self.stub_pend_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// The endpoint connected to the worker with `uuid`, if any.
    pub fn ep_find(&self, uuid: u64) -> Option<Arc<Endpoint>> {
        self.eps.get(&uuid).map(|ep| Arc::clone(ep.value()))
    }

    /// Number of endpoints in the directory.
    pub fn endpoint_count(&self) -> usize {
        self.eps.len()
    }

    pub(crate) fn ep_insert(&self, ep: Arc<Endpoint>) {
        self.eps.insert(ep.dest_uuid(), ep);
    }

    pub(crate) fn ep_remove(&self, uuid: u64) -> Option<Arc<Endpoint>> {
        self.eps.remove(&uuid).map(|(_, ep)| ep)
    }

    /// Returns the endpoint to `address`, creating it and starting wire-up
    /// if this worker has none yet.
    pub fn create_ep(self: &Arc<Self>, address: &WorkerAddress) -> Result<Arc<Endpoint>> {
        let _async = self.async_ctx.block();

        if let Some(ep) = self.ep_find(address.uuid) {
            debug!(
                peer = %address.name,
                "returning existing ep which is already connected to {:016x}",
                address.uuid
            );
            return Ok(ep);
        }

        let ep = Endpoint::new(self, address.uuid, &address.name, "from api call");
        if let Err(err) = proto::start(&ep, address) {
            ep.destroy();
            return Err(err);
        }
        Ok(ep)
    }

    /// Applies async events posted since the last call.
    ///
    /// Returns the number of events applied.
    pub fn async_check_miss(&self) -> usize {
        if !self.async_ctx.has_missed() {
            return 0;
        }
        let _async = self.async_ctx.block();
        let events = self.async_ctx.take_missed();
        for event in &events {
            match *event {
                AsyncEvent::RemoteConnected { peer, op } => {
                    let Some(ep) = self.ep_find(peer) else {
                        warn!(peer = format_args!("{:016x}", peer), "remote-connected for unknown peer");
                        continue;
                    };
                    match ep.slot(op) {
                        EpSlot::Stub(stub) => stub.remote_connected(),
                        _ => debug!(peer = ep.peer_name(), %op, "remote-connected after wire-up"),
                    }
                }
            }
        }
        events.len()
    }

    /// One iteration of the progress loop.
    ///
    /// Applies missed async events, progresses every interface, then runs
    /// registered progress callbacks. Returns the number of events handled.
    pub fn progress(&self) -> usize {
        let mut count = self.async_check_miss();
        for rsc in &self.resources {
            count += rsc.iface.progress();
        }
        count + self.progress.dispatch()
    }

    /// Destroys every endpoint of this worker.
    pub fn close(&self) {
        let eps: Vec<Arc<Endpoint>> = self.eps.iter().map(|ep| Arc::clone(ep.value())).collect();
        for ep in eps {
            ep.destroy();
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.config.name)
            .field("uuid", &format_args!("{:016x}", self.uuid))
            .field("resources", &self.resources)
            .field("endpoints", &self.eps.len())
            .field("stub_pend_count", &self.stub_pending_count())
            .finish()
    }
}
