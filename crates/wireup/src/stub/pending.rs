//! Requests parked on a stub endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use transport::{Error, PendingReq, PendingRequest, Result};

/// FIFO of data requests held back until switchover.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    reqs: VecDeque<PendingRequest>,
}

impl PendingQueue {
    pub(crate) fn push(&mut self, req: PendingRequest) {
        self.reqs.push_back(req);
    }

    pub(crate) fn len(&self) -> usize {
        self.reqs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    /// Moves every request out, leaving the queue empty.
    pub(crate) fn take(&mut self) -> PendingQueue {
        std::mem::take(self)
    }
}

impl IntoIterator for PendingQueue {
    type Item = PendingRequest;
    type IntoIter = std::collections::vec_deque::IntoIter<PendingRequest>;

    fn into_iter(self) -> Self::IntoIter {
        self.reqs.into_iter()
    }
}

/// Wraps a wire-up message handed to the control endpoint, so the stub's
/// gate counter covers it until it is sent or cancelled.
///
/// The counter equals the number of live, unfinished proxies.
#[derive(Debug)]
pub(crate) struct WireupMsgProxy {
    req: Option<PendingRequest>,
    pending_count: Arc<AtomicU32>,
}

impl WireupMsgProxy {
    pub(crate) fn new(req: PendingRequest, pending_count: Arc<AtomicU32>) -> Self {
        pending_count.fetch_add(1, Ordering::AcqRel);
        Self {
            req: Some(req),
            pending_count,
        }
    }

    fn finish(&mut self) -> Option<PendingRequest> {
        let req = self.req.take();
        if req.is_some() {
            self.pending_count.fetch_sub(1, Ordering::AcqRel);
        }
        req
    }
}

impl PendingReq for WireupMsgProxy {
    fn progress(&mut self) -> Result<()> {
        let Some(req) = self.req.as_mut() else {
            return Ok(());
        };
        let result = req.progress();
        if !matches!(result, Err(Error::NoResource)) {
            self.finish();
        }
        result
    }

    fn is_wireup_msg(&self) -> bool {
        true
    }

    fn cancel(mut self: Box<Self>) {
        if let Some(req) = self.finish() {
            req.cancel();
        }
    }
}

impl Drop for WireupMsgProxy {
    fn drop(&mut self) {
        self.finish();
    }
}
