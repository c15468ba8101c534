//! Worker and endpoint configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use transport::ResourceIndex;

/// Operation categories of an endpoint's dispatch table.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum EpOp {
    /// Active messages, which also carry wire-up control traffic.
    Am,
    /// Remote memory access (put/get).
    Rma,
    /// Remote atomics.
    Amo,
}

/// Number of dispatch-table slots.
pub const EP_OP_LAST: usize = 3;

impl EpOp {
    pub const ALL: [EpOp; EP_OP_LAST] = [EpOp::Am, EpOp::Rma, EpOp::Amo];

    /// Slot index in the dispatch table.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn title(self) -> &'static str {
        match self {
            EpOp::Am => "active messages",
            EpOp::Rma => "remote memory access",
            EpOp::Amo => "atomic memory operations",
        }
    }
}

impl fmt::Display for EpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Which resource serves each category, and which categories alias another.
///
/// A category configured as a duplicate of another shares its endpoint: it
/// has no resource of its own and is switched over together with it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpConfig {
    rscs: [Option<ResourceIndex>; EP_OP_LAST],
    dups: [Option<EpOp>; EP_OP_LAST],
}

impl EpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `op` with resource `rsc`.
    pub fn with_resource(mut self, op: EpOp, rsc: ResourceIndex) -> Self {
        self.rscs[op.index()] = Some(rsc);
        self.dups[op.index()] = None;
        self
    }

    /// Makes `op` share the endpoint of `of`.
    pub fn with_dup(mut self, op: EpOp, of: EpOp) -> Self {
        if op != of {
            self.dups[op.index()] = Some(of);
            self.rscs[op.index()] = None;
        }
        self
    }

    /// Resource serving `op`, following an alias.
    pub fn resource(&self, op: EpOp) -> Option<ResourceIndex> {
        match self.dups[op.index()] {
            Some(of) => self.rscs[of.index()],
            None => self.rscs[op.index()],
        }
    }

    /// The category `op` duplicates, if any.
    pub fn dup(&self, op: EpOp) -> Option<EpOp> {
        self.dups[op.index()]
    }

    /// Categories that own an endpoint of their own.
    pub fn lanes(&self) -> impl Iterator<Item = EpOp> + '_ {
        EpOp::ALL
            .into_iter()
            .filter(move |op| self.dups[op.index()].is_none() && self.rscs[op.index()].is_some())
    }

    /// `lane` followed by every category aliased to it.
    pub fn slots_of(&self, lane: EpOp) -> impl Iterator<Item = EpOp> + '_ {
        EpOp::ALL
            .into_iter()
            .filter(move |&op| op == lane || self.dups[op.index()] == Some(lane))
    }
}

fn default_replay_yield_after() -> u32 {
    64
}

fn default_flush_attempts() -> u32 {
    1024
}

/// Worker configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Human-readable worker name, shown to peers in logs.
    pub name: String,
    /// Fixed worker uuid; generated when absent.
    #[serde(default)]
    pub uuid: Option<u64>,
    /// Replay retries before the replay loop yields the thread.
    #[serde(default = "default_replay_yield_after")]
    pub replay_yield_after: u32,
    /// Progress rounds a destroyed endpoint waits for its flush before it is
    /// released with operations still in flight.
    #[serde(default = "default_flush_attempts")]
    pub flush_attempts: u32,
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_uuid(mut self, uuid: u64) -> Self {
        self.uuid = Some(uuid);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            uuid: None,
            replay_yield_after: default_replay_yield_after(),
            flush_attempts: default_flush_attempts(),
        }
    }
}
