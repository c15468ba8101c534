//! Auxiliary transport selection.
//!
//! Before the real transport of the active-message category is connected,
//! wire-up messages travel over an auxiliary endpoint. It is created on the
//! best-scoring pair of local resource and peer address entry.
//!
//! # Scoring
//!
//! Scoring is pluggable through [`TransportScore`]. A candidate is
//! disqualified by returning a reason instead of a score. Among qualified
//! candidates the highest score wins, and of equal scores the first one
//! seen, iterating local resources in order and for each of them the peer's
//! address entries in order.

use crate::address::AddressEntry;
use crate::error::{Error, Result};
use crate::worker::Worker;
use tracing::{debug, trace};
use transport::{CapFlags, IfaceAttr, ResourceIndex, TransportEp};

/// Ranks interfaces for one purpose.
pub trait TransportScore {
    /// Purpose shown in logs and errors.
    fn name(&self) -> &'static str;

    /// Scores an interface, or returns what it lacks.
    fn score(&self, attr: &IfaceAttr) -> std::result::Result<f64, &'static str>;
}

/// Scores interfaces for carrying wire-up messages.
///
/// Requires bulk-copy active messages, connecting to a remote interface,
/// synchronous active-message callbacks and a pending queue. Prefers low
/// latency, then large messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxScore;

impl TransportScore for AuxScore {
    fn name(&self) -> &'static str {
        "auxiliary"
    }

    fn score(&self, attr: &IfaceAttr) -> std::result::Result<f64, &'static str> {
        let flags = attr.cap.flags;
        if !flags.contains(CapFlags::AM_BCOPY) {
            return Err("am_bcopy for wireup");
        }
        if !flags.contains(CapFlags::CONNECT_TO_IFACE) {
            return Err("connecting to iface");
        }
        if !flags.contains(CapFlags::AM_CB_SYNC) {
            return Err("sync am callback");
        }
        if !flags.contains(CapFlags::PENDING) {
            return Err("pending");
        }
        let max_size = attr.cap.am.max_bcopy.max(attr.cap.am.max_short) as f64;
        Ok(1e-3 / attr.latency + 1e3 * max_size)
    }
}

/// The chosen pair of local resource and peer address entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub rsc_index: ResourceIndex,
    pub addr_index: usize,
    pub score: f64,
}

/// An auxiliary endpoint connected to the peer.
#[derive(Debug)]
pub struct AuxConnection {
    pub rsc_index: ResourceIndex,
    pub ep: Box<dyn TransportEp>,
}

/// Picks the best pair of `worker` resource and `entries` address.
///
/// Only entries with a matching transport name whose device is reachable
/// from the resource are candidates.
pub fn select_transport(
    worker: &Worker,
    peer_name: &str,
    entries: &[AddressEntry],
    scorer: &dyn TransportScore,
) -> Result<Selection> {
    let mut best: Option<Selection> = None;
    let mut reasons = Vec::new();

    for (index, rsc) in worker.resources().iter().enumerate() {
        // Worker::new keeps at most MAX_RESOURCES, so every index fits.
        let Ok(raw) = u8::try_from(index) else {
            break;
        };
        let rsc_index = ResourceIndex(raw);
        for (addr_index, entry) in entries.iter().enumerate() {
            if entry.tl_name != rsc.desc.tl_name || !rsc.iface.is_reachable(&entry.dev_addr) {
                continue;
            }
            match scorer.score(rsc.iface.attr()) {
                Ok(score) if score > 0.0 => {
                    trace!(
                        purpose = scorer.name(),
                        rsc = %rsc.desc,
                        addr_index,
                        score,
                        "candidate"
                    );
                    if best.as_ref().map_or(true, |b| score > b.score) {
                        best = Some(Selection {
                            rsc_index,
                            addr_index,
                            score,
                        });
                    }
                }
                Ok(_) => reasons.push(format!("{} - zero score", rsc.desc)),
                Err(lacks) => reasons.push(format!("{} - no {}", rsc.desc, lacks)),
            }
        }
    }

    match best {
        Some(selection) => {
            debug!(
                purpose = scorer.name(),
                peer = peer_name,
                rsc = %selection.rsc_index,
                addr_index = selection.addr_index,
                score = selection.score,
                "selected transport"
            );
            Ok(selection)
        }
        None => Err(Error::NoSuitableResource {
            purpose: scorer.name(),
            peer: peer_name.to_string(),
            reasons: if reasons.is_empty() {
                "no reachable resources".to_string()
            } else {
                reasons.join(", ")
            },
        }),
    }
}

/// Selects a transport with `scorer` and connects an endpoint to the
/// winning address entry.
///
/// On failure no endpoint is left behind.
pub fn connect_aux(
    worker: &Worker,
    peer_name: &str,
    entries: &[AddressEntry],
    scorer: &dyn TransportScore,
) -> Result<AuxConnection> {
    let selection = select_transport(worker, peer_name, entries, scorer)?;
    let entry = &entries[selection.addr_index];
    let rsc = worker
        .resource(selection.rsc_index)
        .ok_or(Error::Transport(transport::Error::Unreachable))?;
    let ep = rsc.iface.create_ep_connected(&entry.dev_addr, &entry.iface_addr)?;
    Ok(AuxConnection {
        rsc_index: selection.rsc_index,
        ep,
    })
}
