//! Endpoint wire-up over pluggable transports.
//!
//! A [`Worker`] owns transport resources and a directory of [`Endpoint`]s.
//! Each endpoint starts with a [`StubEp`] in the slots of the categories it
//! wires up. The stub parks traffic while wire-up messages travel over an
//! auxiliary transport, and once both sides are connected it installs the
//! real transport endpoint and replays what it parked.

pub mod address;
pub mod async_context;
pub mod auxiliary;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod proto;
pub mod request;
pub mod stub;
pub mod worker;

pub use address::{AddressEntry, WorkerAddress};
pub use async_context::{AsyncContext, AsyncEvent, AsyncNotifier};
pub use auxiliary::{connect_aux, select_transport, AuxConnection, AuxScore, Selection, TransportScore};
pub use config::{EpConfig, EpOp, WorkerConfig, EP_OP_LAST};
pub use endpoint::{EpSlot, Endpoint};
pub use error::{Error, Result};
pub use proto::{MsgKind, WireupMsg, AM_ID_WIREUP};
pub use request::RequestHandle;
pub use stub::{StubEp, StubState};
pub use worker::{Resource, Worker, MAX_RESOURCES};
