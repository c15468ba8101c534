//! Transport interfaces: capabilities, attributes and addresses.
//!
//! An interface is one opened transport resource. It reports what its
//! endpoints can do through [`IfaceAttr`], publishes the addresses a peer
//! needs to reach it, and creates endpoints.

use crate::ep::TransportEp;
use crate::error::Result;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Capability bits of an interface.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CapFlags: u64 {
        const AM_SHORT = 1 << 0;
        const AM_BCOPY = 1 << 1;
        const AM_ZCOPY = 1 << 2;
        const PENDING = 1 << 3;
        const PUT_SHORT = 1 << 4;
        const PUT_BCOPY = 1 << 5;
        const PUT_ZCOPY = 1 << 6;
        const GET_BCOPY = 1 << 7;
        const GET_ZCOPY = 1 << 8;
        const ATOMIC_ADD32 = 1 << 9;
        const ATOMIC_ADD64 = 1 << 10;
        const ATOMIC_FADD32 = 1 << 11;
        const ATOMIC_FADD64 = 1 << 12;
        const ATOMIC_SWAP32 = 1 << 13;
        const ATOMIC_SWAP64 = 1 << 14;
        const ATOMIC_CSWAP32 = 1 << 15;
        const ATOMIC_CSWAP64 = 1 << 16;
        /// Endpoints can be created already connected to a remote interface.
        const CONNECT_TO_IFACE = 1 << 17;
        /// Endpoints are created unconnected and paired with a remote endpoint.
        const CONNECT_TO_EP = 1 << 18;
        /// Active-message handlers run synchronously from progress.
        const AM_CB_SYNC = 1 << 19;
        /// Active-message handlers may run from an async context.
        const AM_CB_ASYNC = 1 << 20;
    }
}

impl Default for CapFlags {
    fn default() -> Self {
        CapFlags::empty()
    }
}

/// Size limits of one operation family.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpLimits {
    pub max_short: usize,
    pub max_bcopy: usize,
    pub max_zcopy: usize,
}

/// Interface capabilities.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IfaceCap {
    pub flags: CapFlags,
    pub am: OpLimits,
    pub put: OpLimits,
    pub get: OpLimits,
}

/// Interface attributes as reported by [`Iface::attr`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IfaceAttr {
    pub cap: IfaceCap,
    /// One-way latency in seconds.
    pub latency: f64,
    /// Bandwidth in bytes per second.
    pub bandwidth: f64,
    /// Per-message software overhead in seconds.
    pub overhead: f64,
}

macro_rules! opaque_addr {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, ")")
            }
        }
    };
}

opaque_addr!(
    /// Address of a device, used for reachability checks.
    DeviceAddr
);
opaque_addr!(
    /// Address of an interface, for connect-to-interface transports.
    IfaceAddr
);
opaque_addr!(
    /// Address of a single endpoint, for connect-to-endpoint transports.
    EpAddr
);

/// Active-message identifier.
pub type AmId = u8;

/// Active-message handler. Receives the message payload as delivered.
pub type AmHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// An opened transport resource.
pub trait Iface: Send + Sync {
    /// Capabilities and performance characteristics.
    fn attr(&self) -> &IfaceAttr;

    /// Address of the device this interface lives on.
    fn device_address(&self) -> DeviceAddr;

    /// Address peers use to create connected endpoints.
    fn iface_address(&self) -> IfaceAddr;

    /// True if a device with `dev_addr` can be reached from this interface.
    fn is_reachable(&self, dev_addr: &DeviceAddr) -> bool;

    /// Creates an unconnected endpoint, to be paired via `connect_to_ep`.
    fn create_ep(&self) -> Result<Box<dyn TransportEp>>;

    /// Creates an endpoint connected to a remote interface.
    fn create_ep_connected(
        &self,
        dev_addr: &DeviceAddr,
        iface_addr: &IfaceAddr,
    ) -> Result<Box<dyn TransportEp>>;

    /// Installs the handler invoked for active messages with `id`.
    fn set_am_handler(&self, id: AmId, handler: AmHandler);

    /// Delivers arrived messages and dispatches pending requests.
    ///
    /// Returns the number of events processed.
    fn progress(&self) -> usize;
}
