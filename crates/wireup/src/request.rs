//! Send requests issued through an endpoint.

use crate::config::EpOp;
use crate::endpoint::Endpoint;
use crate::proto::AM_ID_WIREUP;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use transport::{AmId, Error, PendingReq, Result};

/// Completion status of a send.
#[derive(Clone, Debug, Default)]
pub struct RequestHandle {
    status: Arc<Mutex<Option<Result<()>>>>,
}

impl RequestHandle {
    pub fn is_completed(&self) -> bool {
        self.status.lock().is_some()
    }

    /// `None` while the request is still pending.
    pub fn status(&self) -> Option<Result<()>> {
        self.status.lock().clone()
    }

    /// Records the first completion; later ones are ignored.
    pub(crate) fn complete(&self, result: Result<()>) {
        let mut status = self.status.lock();
        if status.is_none() {
            *status = Some(result);
        }
    }
}

/// An active message sent over whatever endpoint currently carries the
/// active-message category.
pub(crate) struct AmSendRequest {
    ep: Weak<Endpoint>,
    id: AmId,
    payload: Vec<u8>,
    handle: RequestHandle,
}

impl AmSendRequest {
    pub(crate) fn new(ep: &Arc<Endpoint>, id: AmId, payload: Vec<u8>) -> Self {
        Self {
            ep: Arc::downgrade(ep),
            id,
            payload,
            handle: RequestHandle::default(),
        }
    }

    pub(crate) fn handle(&self) -> RequestHandle {
        self.handle.clone()
    }
}

impl fmt::Debug for AmSendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmSendRequest")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl PendingReq for AmSendRequest {
    fn progress(&mut self) -> Result<()> {
        let Some(ep) = self.ep.upgrade() else {
            self.handle.complete(Err(Error::EndpointClosed));
            return Err(Error::EndpointClosed);
        };
        let payload = &self.payload;
        let result = match ep.uct_ep(EpOp::Am) {
            Some(uct_ep) => uct_ep
                .am_bcopy(self.id, &|buf: &mut Vec<u8>| buf.extend_from_slice(payload))
                .map(|_| ()),
            None => Err(Error::NotConnected),
        };
        if !matches!(result, Err(Error::NoResource)) {
            self.handle.complete(result.clone());
        }
        result
    }

    fn is_wireup_msg(&self) -> bool {
        self.id == AM_ID_WIREUP
    }

    fn cancel(self: Box<Self>) {
        self.handle.complete(Err(Error::Canceled));
    }
}
