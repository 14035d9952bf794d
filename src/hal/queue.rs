//! Software queue device.
//!
//! Stands in for the vendor emulation SDK: requests are injected with
//! [`QueueDevice::submit`] instead of arriving over a virtio queue, and
//! completed buffers come back on a per-request channel. The RPC gateway
//! binary and the test suite both drive the engine through this device, so
//! it implements the same admission rules as the hardware path: nothing is
//! accepted after suspension, and polling defers when the in-flight count
//! reaches the `max_background` bound.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    Completion, CompletionSink, CompletionStatus, Device, FuseRequest, HandlerOutcome,
    RequestHandler, SgBuf, MAX_BACKGROUND,
};

/// A finished request as observed by the submitter.
#[derive(Debug)]
pub struct CompletedRequest {
    pub bufs: SgBuf,
    pub status: CompletionStatus,
}

struct PendingRequest {
    bufs: SgBuf,
    reply_tx: mpsc::Sender<CompletedRequest>,
}

pub struct QueueDevice {
    device_id: u16,
    handler: Arc<dyn RequestHandler>,
    incoming: Mutex<VecDeque<PendingRequest>>,
    inflight_replies: Mutex<HashMap<u64, mpsc::Sender<CompletedRequest>>>,
    next_token: AtomicU64,
    inflight: AtomicUsize,
    suspending: std::sync::atomic::AtomicBool,
}

impl QueueDevice {
    pub fn new(device_id: u16, handler: Arc<dyn RequestHandler>) -> Arc<QueueDevice> {
        Arc::new(QueueDevice {
            device_id,
            handler,
            incoming: Mutex::new(VecDeque::new()),
            inflight_replies: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            inflight: AtomicUsize::new(0),
            suspending: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Queue one request for the next poll. The reply arrives on the
    /// returned channel once the engine completes it.
    pub fn submit(&self, bufs: SgBuf) -> mpsc::Receiver<CompletedRequest> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.incoming
            .lock()
            .push_back(PendingRequest { bufs, reply_tx });
        reply_rx
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

impl Device for Arc<QueueDevice> {
    fn poll_io(&self) -> usize {
        let mut started = 0;
        loop {
            if self.suspending.load(Ordering::Acquire) {
                break;
            }
            // Backpressure: past the max_background bound we return without
            // servicing; the submitter's queue keeps the request.
            if self.inflight.load(Ordering::Acquire) >= MAX_BACKGROUND as usize {
                break;
            }
            let Some(pending) = self.incoming.lock().pop_front() else {
                break;
            };

            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            self.inflight_replies.lock().insert(token, pending.reply_tx);
            self.inflight.fetch_add(1, Ordering::AcqRel);

            let sink: Arc<dyn CompletionSink> = self.clone();
            let req = FuseRequest::new(pending.bufs, Completion::new(sink, token));
            started += 1;
            match self.handler.handle(req, self.device_id) {
                HandlerOutcome::Done(req) => req.complete(CompletionStatus::Success),
                HandlerOutcome::Failed(req) => req.complete(CompletionStatus::Error),
                HandlerOutcome::Pending => {}
            }
        }
        started
    }

    fn suspend(&self) {
        self.suspending.store(true, Ordering::Release);
    }

    fn is_suspended(&self) -> bool {
        self.suspending.load(Ordering::Acquire) && self.inflight.load(Ordering::Acquire) == 0
    }
}

impl std::fmt::Debug for QueueDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDevice")
            .field("device_id", &self.device_id)
            .field("queued", &self.incoming.lock().len())
            .field("inflight", &self.inflight())
            .finish()
    }
}

impl CompletionSink for QueueDevice {
    fn complete(&self, token: u64, bufs: SgBuf, status: CompletionStatus) {
        let reply_tx = self.inflight_replies.lock().remove(&token);
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        match reply_tx {
            Some(tx) => {
                // The submitter may have given up waiting; dropping the
                // reply is fine then.
                let _ = tx.send(CompletedRequest { bufs, status });
            }
            None => log::error!(
                "device {}: completion for unknown token {token}",
                self.device_id
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Echoes the first input segment into the first output segment.
    struct EchoHandler;
    impl RequestHandler for EchoHandler {
        fn handle(&self, mut req: FuseRequest, _device_id: u16) -> HandlerOutcome {
            let data = req.bufs.in_iov[0].clone();
            let n = data.len().min(req.bufs.out_iov[0].len());
            req.bufs.out_iov[0][..n].copy_from_slice(&data[..n]);
            HandlerOutcome::Done(req)
        }
    }

    fn sg(input: &[u8], out_len: usize) -> SgBuf {
        SgBuf {
            in_iov: vec![input.to_vec()],
            out_iov: vec![vec![0u8; out_len]],
        }
    }

    #[test]
    fn request_roundtrip() {
        let dev = QueueDevice::new(0, Arc::new(EchoHandler));
        let rx = dev.submit(sg(b"ping", 4));
        assert_eq!(dev.poll_io(), 1);
        let done = rx.recv().unwrap();
        assert_eq!(done.status, CompletionStatus::Success);
        assert_eq!(done.bufs.out_iov[0], b"ping");
        assert_eq!(dev.inflight(), 0);
    }

    #[test]
    fn suspended_device_accepts_nothing() {
        let dev = QueueDevice::new(0, Arc::new(EchoHandler));
        let _rx = dev.submit(sg(b"x", 1));
        dev.suspend();
        assert_eq!(dev.poll_io(), 0);
        assert!(dev.is_suspended());
    }

    struct NeverHandler;
    impl RequestHandler for NeverHandler {
        fn handle(&self, _req: FuseRequest, _device_id: u16) -> HandlerOutcome {
            // drop the request without completing: stays in flight forever
            HandlerOutcome::Pending
        }
    }

    #[test]
    fn suspension_waits_for_inflight() {
        let dev = QueueDevice::new(0, Arc::new(NeverHandler));
        let _rx = dev.submit(sg(b"x", 1));
        assert_eq!(dev.poll_io(), 1);
        dev.suspend();
        assert!(!dev.is_suspended());
    }
}
