//! Transport interface layer.
//!
//! This crate defines what a transport looks like to the layers above it:
//! - Interface capabilities, attributes and addresses
//! - The transport endpoint capability surface
//! - Pending requests parked on endpoints without resources
//! - The worker progress-callback registry
//! - An in-process loopback transport

pub mod ep;
pub mod error;
pub mod iface;
pub mod loopback;
pub mod progress;
pub mod resource;

pub use ep::{PackFn, PendingReq, PendingRequest, RemoteKey, TransportEp};
pub use error::{Error, Result};
pub use iface::{
    AmHandler, AmId, CapFlags, DeviceAddr, EpAddr, Iface, IfaceAddr, IfaceAttr, IfaceCap, OpLimits,
};
pub use loopback::{LoopbackConfig, LoopbackFabric, LoopbackIface};
pub use progress::{Progress, ProgressRegistry};
pub use resource::{ResourceIndex, TlResource};
