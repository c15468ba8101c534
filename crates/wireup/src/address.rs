//! Worker addresses exchanged during wire-up.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use transport::{DeviceAddr, IfaceAddr};

/// How to reach one transport resource of a remote worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub tl_name: String,
    pub dev_name: String,
    pub dev_addr: DeviceAddr,
    pub iface_addr: IfaceAddr,
}

/// Everything a peer needs to start wire-up with a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAddress {
    pub uuid: u64,
    pub name: String,
    pub entries: Vec<AddressEntry>,
}

impl WorkerAddress {
    /// Packs the address for out-of-band exchange.
    pub fn pack(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
