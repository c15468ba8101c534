//! Replacing a stub with the endpoint it wired up.

use super::StubEp;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};
use transport::TransportEp;

impl StubEp {
    /// Switches the owning endpoint over to the wired-up transport once both
    /// sides are connected and no wire-up message is outstanding.
    ///
    /// Safe to call at any time, any number of times. Returns true only from
    /// the call that performed the switchover.
    ///
    /// Parked requests are replayed through the promoted endpoint, in the
    /// order they were parked, after the async block is released.
    pub fn progress(&self) -> bool {
        // Give an in-flight async completion the chance to land first.
        thread::yield_now();
        let Some(ep) = self.ep.upgrade() else {
            return false;
        };
        let Some(worker) = ep.worker() else {
            return false;
        };
        worker.async_check_miss();

        if !self.is_switchable() {
            return false;
        }
        fence(Ordering::SeqCst);

        let (promoted, replay) = {
            let _async = worker.async_ctx().block();
            let mut inner = self.inner.lock();
            if !self.is_switchable() {
                return false;
            }
            let Some(next_ep) = inner.next_ep.take() else {
                return false;
            };
            let promoted: Arc<dyn TransportEp> = Arc::from(next_ep);
            inner.promoted = Some(Arc::clone(&promoted));
            let replay = inner.pending_q.take();
            let aux_ep = inner.aux_ep.take();
            drop(inner);

            let callback = self.callback();
            for _ in 0..replay.len() {
                worker.progress_registry().unregister(&callback);
            }
            let slots = ep.promote(self, &promoted);
            drop(aux_ep);

            debug!(
                peer = ep.peer_name(),
                op = %self.op,
                slots,
                replay = replay.len(),
                "switched to wired-up endpoint"
            );
            (promoted, replay)
        };

        for req in replay {
            trace!(op = %self.op, ?req, "replay pending request");
            ep.add_pending(promoted.as_ref(), req);
            worker.stub_pending_dec();
        }
        true
    }

    fn is_switchable(&self) -> bool {
        self.is_connected() && self.pending_count() == 0
    }
}
