//! Transport resource identity.
//!
//! A resource is one (transport, device) pair opened by a worker. Workers
//! address their resources by a compact [`ResourceIndex`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a transport resource inside a worker.
///
/// Newtype over `u8`: workers open a handful of resources at most, and the
/// index is carried in configuration tables and logs.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ResourceIndex(pub u8);

impl fmt::Display for ResourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsc[{}]", self.0)
    }
}

impl From<ResourceIndex> for usize {
    fn from(index: ResourceIndex) -> usize {
        index.0 as usize
    }
}

/// Description of a transport resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlResource {
    /// Transport name, e.g. `"loopback"`.
    pub tl_name: String,
    /// Device name inside the transport.
    pub dev_name: String,
}

impl TlResource {
    pub fn new(tl_name: impl Into<String>, dev_name: impl Into<String>) -> Self {
        Self {
            tl_name: tl_name.into(),
            dev_name: dev_name.into(),
        }
    }
}

impl fmt::Display for TlResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tl_name, self.dev_name)
    }
}
