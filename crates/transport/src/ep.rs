//! Transport endpoint capability surface and pending requests.

use crate::error::{Error, Result};
use crate::iface::{AmId, DeviceAddr, EpAddr};
use std::fmt::Debug;
use std::task::Poll;

/// Remote memory key for RMA and atomic operations.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct RemoteKey(pub u64);

/// Packs a bulk-copy payload into the transport's send buffer.
pub type PackFn<'a> = &'a dyn Fn(&mut Vec<u8>);

/// A deferred operation, parked on an endpoint until it has resources.
///
/// The record is owned by exactly one queue at a time: queues take it by
/// value and hand it back by value.
pub trait PendingReq: Send + Debug {
    /// Attempts the operation.
    ///
    /// `Err(Error::NoResource)` keeps the request pending. `Ok` or any other
    /// error means the request is finished and must not be retried.
    fn progress(&mut self) -> Result<()>;

    /// True for wire-up control messages.
    fn is_wireup_msg(&self) -> bool {
        false
    }

    /// Releases the request without performing it.
    fn cancel(self: Box<Self>) {}
}

/// An owned pending request.
pub type PendingRequest = Box<dyn PendingReq>;

/// A connection to one remote peer over one transport.
///
/// Destroying an endpoint is dropping it. Send operations default to
/// [`Error::Unsupported`], so a transport only implements what its interface
/// advertises in `CapFlags`.
pub trait TransportEp: Send + Sync + Debug {
    /// Address a peer passes to `connect_to_ep`.
    fn get_address(&self) -> Result<EpAddr>;

    /// Pairs this endpoint with a remote endpoint.
    fn connect_to_ep(&self, dev_addr: &DeviceAddr, ep_addr: &EpAddr) -> Result<()>;

    /// Reports whether every issued operation has completed.
    fn flush(&self) -> Poll<Result<()>>;

    /// Queues `req` until the endpoint has resources.
    ///
    /// Hands the request back when resources are available right now; the
    /// caller should then progress it directly.
    fn pending_add(&self, req: PendingRequest) -> std::result::Result<(), PendingRequest>;

    /// Removes every queued request, passing each to `cb`.
    fn pending_purge(&self, cb: &mut dyn FnMut(PendingRequest));

    fn put_short(&self, _buffer: &[u8], _remote_addr: u64, _rkey: RemoteKey) -> Result<()> {
        Err(Error::Unsupported("put_short"))
    }

    fn put_bcopy(&self, _pack: PackFn<'_>, _remote_addr: u64, _rkey: RemoteKey) -> Result<usize> {
        Err(Error::Unsupported("put_bcopy"))
    }

    fn put_zcopy(&self, _buffer: &[u8], _remote_addr: u64, _rkey: RemoteKey) -> Result<()> {
        Err(Error::Unsupported("put_zcopy"))
    }

    fn get_bcopy(&self, _length: usize, _remote_addr: u64, _rkey: RemoteKey) -> Result<Vec<u8>> {
        Err(Error::Unsupported("get_bcopy"))
    }

    fn get_zcopy(&self, _buffer: &mut [u8], _remote_addr: u64, _rkey: RemoteKey) -> Result<()> {
        Err(Error::Unsupported("get_zcopy"))
    }

    fn am_short(&self, _id: AmId, _header: u64, _payload: &[u8]) -> Result<()> {
        Err(Error::Unsupported("am_short"))
    }

    fn am_bcopy(&self, _id: AmId, _pack: PackFn<'_>) -> Result<usize> {
        Err(Error::Unsupported("am_bcopy"))
    }

    fn am_zcopy(&self, _id: AmId, _header: &[u8], _payload: &[u8]) -> Result<()> {
        Err(Error::Unsupported("am_zcopy"))
    }

    fn atomic_add64(&self, _add: u64, _remote_addr: u64, _rkey: RemoteKey) -> Result<()> {
        Err(Error::Unsupported("atomic_add64"))
    }

    fn atomic_fadd64(&self, _add: u64, _remote_addr: u64, _rkey: RemoteKey) -> Result<u64> {
        Err(Error::Unsupported("atomic_fadd64"))
    }

    fn atomic_swap64(&self, _swap: u64, _remote_addr: u64, _rkey: RemoteKey) -> Result<u64> {
        Err(Error::Unsupported("atomic_swap64"))
    }

    fn atomic_cswap64(
        &self,
        _compare: u64,
        _swap: u64,
        _remote_addr: u64,
        _rkey: RemoteKey,
    ) -> Result<u64> {
        Err(Error::Unsupported("atomic_cswap64"))
    }

    fn atomic_add32(&self, _add: u32, _remote_addr: u64, _rkey: RemoteKey) -> Result<()> {
        Err(Error::Unsupported("atomic_add32"))
    }

    fn atomic_fadd32(&self, _add: u32, _remote_addr: u64, _rkey: RemoteKey) -> Result<u32> {
        Err(Error::Unsupported("atomic_fadd32"))
    }

    fn atomic_swap32(&self, _swap: u32, _remote_addr: u64, _rkey: RemoteKey) -> Result<u32> {
        Err(Error::Unsupported("atomic_swap32"))
    }

    fn atomic_cswap32(
        &self,
        _compare: u32,
        _swap: u32,
        _remote_addr: u64,
        _rkey: RemoteKey,
    ) -> Result<u32> {
        Err(Error::Unsupported("atomic_cswap32"))
    }
}
