//! Wire-up control protocol.
//!
//! Three messages, sent as active message [`AM_ID_WIREUP`]:
//!
//! - `Request` carries the sender's worker address and the addresses of its
//!   stub endpoints. The receiver creates its endpoint if needed, connects
//!   its stubs to the sender's and answers with a `Reply`.
//! - `Reply` carries the receiver's stub addresses. The initiator connects
//!   its stubs, marks them remote-connected and answers with an `Ack`.
//! - `Ack` marks the receiver's stubs remote-connected.
//!
//! Lanes whose resource can only connect to a remote interface skip the stub
//! and are connected directly when wire-up starts.

use crate::address::WorkerAddress;
use crate::config::EpOp;
use crate::endpoint::{EpSlot, Endpoint};
use crate::error::{Error, Result};
use crate::stub::{self, StubEp};
use crate::worker::Worker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use transport::{AmId, CapFlags, DeviceAddr, EpAddr, TransportEp};

/// Active-message id of wire-up messages.
pub const AM_ID_WIREUP: AmId = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgKind {
    Request,
    Reply,
    Ack,
}

/// Address of the endpoint serving one lane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneAddress {
    pub op: EpOp,
    pub dev_addr: DeviceAddr,
    pub ep_addr: EpAddr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireupMsg {
    pub kind: MsgKind,
    pub src_uuid: u64,
    pub dest_uuid: u64,
    /// Sender's worker address; only in requests.
    pub address: Option<WorkerAddress>,
    pub lanes: Vec<LaneAddress>,
}

impl WireupMsg {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Installs the wire-up message handler on every resource of `worker`.
pub(crate) fn install(worker: &Arc<Worker>) {
    let weak = Arc::downgrade(worker);
    worker.set_am_handler(
        AM_ID_WIREUP,
        Arc::new(move |data: &[u8]| {
            let Some(worker) = weak.upgrade() else {
                return;
            };
            if let Err(err) = handle(&worker, data) {
                warn!(worker = worker.name(), %err, "failed to handle wire-up message");
            }
        }),
    );
}

/// Sets up the lanes of a new endpoint and sends the wire-up request.
pub(crate) fn start(ep: &Arc<Endpoint>, address: &WorkerAddress) -> Result<()> {
    init_lanes(ep, address)?;
    send(ep, MsgKind::Request)
}

fn init_lanes(ep: &Arc<Endpoint>, address: &WorkerAddress) -> Result<()> {
    let worker = ep.worker().ok_or(transport::Error::EndpointClosed)?;
    let lanes: Vec<EpOp> = ep.config().lanes().collect();
    for lane in lanes {
        let rsc_index = ep.config().resource(lane).ok_or(Error::NotConfigured(lane))?;
        let rsc = worker.resource(rsc_index).ok_or(Error::NotConfigured(lane))?;

        let slot = if rsc.iface.attr().cap.flags.contains(CapFlags::CONNECT_TO_EP) {
            EpSlot::Stub(StubEp::create(ep, lane, address)?)
        } else {
            let entry = address
                .entries
                .iter()
                .find(|e| e.tl_name == rsc.desc.tl_name && rsc.iface.is_reachable(&e.dev_addr))
                .ok_or(transport::Error::Unreachable)?;
            let uct_ep = rsc.iface.create_ep_connected(&entry.dev_addr, &entry.iface_addr)?;
            EpSlot::Transport(Arc::from(uct_ep))
        };
        trace!(peer = ep.peer_name(), %lane, ?slot, "initialized lane");
        ep.install_lane(lane, slot);
    }
    Ok(())
}

/// Addresses of the stubs of `ep`, for the peer to connect to.
fn local_lanes(ep: &Endpoint) -> Result<Vec<LaneAddress>> {
    let worker = ep.worker().ok_or(transport::Error::EndpointClosed)?;
    let mut lanes = Vec::new();
    for lane in ep.config().lanes() {
        let EpSlot::Stub(stub) = ep.slot(lane) else {
            continue;
        };
        let rsc_index = ep.config().resource(lane).ok_or(Error::NotConfigured(lane))?;
        let rsc = worker.resource(rsc_index).ok_or(Error::NotConfigured(lane))?;
        lanes.push(LaneAddress {
            op: lane,
            dev_addr: rsc.iface.device_address(),
            ep_addr: stub.get_address()?,
        });
    }
    Ok(lanes)
}

fn send(ep: &Arc<Endpoint>, kind: MsgKind) -> Result<()> {
    let worker = ep.worker().ok_or(transport::Error::EndpointClosed)?;
    let msg = WireupMsg {
        kind,
        src_uuid: worker.uuid(),
        dest_uuid: ep.dest_uuid(),
        address: (kind == MsgKind::Request).then(|| worker.address()),
        lanes: match kind {
            MsgKind::Ack => Vec::new(),
            _ => local_lanes(ep)?,
        },
    };
    let handle = ep.send_am(AM_ID_WIREUP, msg.encode()?);
    if let Some(Err(err)) = handle.status() {
        return Err(err.into());
    }
    trace!(peer = ep.peer_name(), ?kind, lanes = msg.lanes.len(), "sent wire-up message");
    Ok(())
}

fn connect_lanes(ep: &Endpoint, lanes: &[LaneAddress]) -> Result<()> {
    for lane in lanes {
        if let EpSlot::Stub(stub) = ep.slot(lane.op) {
            stub.connect_to_ep(&lane.dev_addr, &lane.ep_addr)?;
        }
    }
    Ok(())
}

fn mark_remote_connected(ep: &Endpoint) {
    for lane in ep.config().lanes() {
        let slot = ep.slot(lane);
        if slot.is_stub() {
            stub::remote_connected(&slot);
        }
    }
}

fn handle(worker: &Arc<Worker>, data: &[u8]) -> Result<()> {
    let msg = WireupMsg::decode(data)?;
    if msg.dest_uuid != worker.uuid() {
        debug!(
            worker = worker.name(),
            dest = format_args!("{:016x}", msg.dest_uuid),
            "dropping misdirected wire-up message"
        );
        return Ok(());
    }
    trace!(worker = worker.name(), kind = ?msg.kind, src = format_args!("{:016x}", msg.src_uuid), "wire-up message");

    let _async = worker.async_ctx().block();
    match msg.kind {
        MsgKind::Request => {
            let ep = match worker.ep_find(msg.src_uuid) {
                Some(ep) => ep,
                None => {
                    let address = msg.address.as_ref().ok_or(Error::UnknownPeer(msg.src_uuid))?;
                    let ep = Endpoint::new(worker, msg.src_uuid, &address.name, "from wireup request");
                    if let Err(err) = init_lanes(&ep, address) {
                        ep.destroy();
                        return Err(err);
                    }
                    ep
                }
            };
            connect_lanes(&ep, &msg.lanes)?;
            send(&ep, MsgKind::Reply)
        }
        MsgKind::Reply => {
            let ep = worker.ep_find(msg.src_uuid).ok_or(Error::UnknownPeer(msg.src_uuid))?;
            connect_lanes(&ep, &msg.lanes)?;
            mark_remote_connected(&ep);
            send(&ep, MsgKind::Ack)
        }
        MsgKind::Ack => {
            let ep = worker.ep_find(msg.src_uuid).ok_or(Error::UnknownPeer(msg.src_uuid))?;
            mark_remote_connected(&ep);
            Ok(())
        }
    }
}
