//! Hardware abstraction layer.
//!
//! The HAL owns the emulated virtio-fs functions and the polling threads
//! that drive them. Transports (the vendor emulation SDK on a DPU, or the
//! software queue device used for development and tests) sit behind the
//! [`Device`] trait; the protocol engine sits behind [`RequestHandler`].
//!
//! A request travels: transport pops a descriptor chain, wraps it in a
//! [`FuseRequest`] and hands it to the handler on the polling thread. The
//! handler either completes it in place (`Done`) or keeps it (`Pending`) and
//! later hands it back through [`async_complete`] from whatever thread its
//! backend I/O finished on. The [`Completion`] capability inside the request
//! cannot be cloned, so "exactly one completion per suspended request" is
//! enforced by ownership rather than by convention.

pub mod config;
pub mod queue;
pub mod rvfs;

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::hal::config::HalConfig;

/// Virtio queues per device (one HiPrio + requests).
pub const NUM_QUEUES: u32 = 64;
/// Default queue depth, must be a power of two.
pub const QUEUE_DEPTH: u32 = 64;
/// The maximum number of outstanding requests the virtio-fs consumer is
/// allowed to have.
pub const MAX_BACKGROUND: u32 = NUM_QUEUES * QUEUE_DEPTH;

/// Completion status a backend reports for a suspended request. The FUSE
/// error field carries the detail; this only tells the transport whether the
/// reply buffers are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error,
}

/// One request's scatter-gather buffers: the descriptor chain the host
/// posted, split into device-readable input segments and device-writable
/// output segments.
#[derive(Debug, Default, PartialEq)]
pub struct SgBuf {
    pub in_iov: Vec<Vec<u8>>,
    pub out_iov: Vec<Vec<u8>>,
}

/// Where a finished request goes back to its transport.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, token: u64, bufs: SgBuf, status: CompletionStatus);
}

/// Single-use capability to complete one request.
pub struct Completion {
    sink: Arc<dyn CompletionSink>,
    token: u64,
}

impl Completion {
    pub fn new(sink: Arc<dyn CompletionSink>, token: u64) -> Completion {
        Completion { sink, token }
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("token", &self.token).finish()
    }
}

/// An in-flight request: buffers plus the completion capability.
#[derive(Debug)]
pub struct FuseRequest {
    pub bufs: SgBuf,
    completion: Completion,
}

impl FuseRequest {
    pub fn new(bufs: SgBuf, completion: Completion) -> FuseRequest {
        FuseRequest { bufs, completion }
    }

    /// Hand the request back to its transport. Consumes the request, so a
    /// double completion does not compile.
    pub fn complete(self, status: CompletionStatus) {
        let FuseRequest { bufs, completion } = self;
        completion.sink.complete(completion.token, bufs, status);
    }
}

/// Report asynchronous completion of a previously suspended request.
pub fn async_complete(req: FuseRequest, status: CompletionStatus) {
    req.complete(status);
}

/// Result of one request-handler invocation.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Reply framed in the output buffers; send it to the host now.
    Done(FuseRequest),
    /// The handler kept the request and promises exactly one later
    /// [`async_complete`].
    Pending,
    /// Malformed request; the transport issues an error completion.
    Failed(FuseRequest),
}

/// The downstream protocol engine the HAL feeds.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, req: FuseRequest, device_id: u16) -> HandlerOutcome;

    /// Called once per device before it processes any request.
    fn register_device(&self, _device_id: u16) {}
    fn unregister_device(&self, _device_id: u16) {}
}

/// One emulated virtio-fs function as the HAL drives it.
pub trait Device: Send + Sync {
    /// Make progress on the request queues. Returns how many requests were
    /// started.
    fn poll_io(&self) -> usize;
    /// Make progress on management IO (device resets, queue enables, ...).
    fn poll_mmio(&self) {}
    /// Stop accepting new requests; in-flight ones drain to the host.
    fn suspend(&self);
    fn is_suspended(&self) -> bool;
}

/// Builds the transport-specific device for one emulated function.
pub type DeviceFactory<'a> =
    dyn Fn(u16, u16, &str) -> io::Result<Arc<dyn Device>> + 'a;

static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    KEEP_RUNNING.store(false, Ordering::SeqCst);
}

/// Whether a shutdown signal has been observed.
pub fn shutdown_requested() -> bool {
    !KEEP_RUNNING.load(Ordering::SeqCst)
}

fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGPIPE, Signal::SIGTERM] {
        // Safety: the handler only performs an atomic store.
        if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
            warn!("could not install handler for {sig}: {e}");
        }
    }
}

thread_local! {
    static THREAD_ID: Cell<Option<u16>> = const { Cell::new(None) };
}

/// The HAL thread id of the calling polling thread.
///
/// Only meaningful from request-handler context (a polling thread or a
/// thread registered through [`register_poller_thread`]); calling it from
/// anywhere else is a programming error and panics.
pub fn thread_id() -> u16 {
    THREAD_ID
        .with(Cell::get)
        .expect("hal::thread_id() called outside a HAL worker thread")
}

/// Adopt the calling thread as HAL worker `id`. Used by embedding
/// applications (and tests) that drive [`Hal::poll_io`] themselves.
pub fn register_poller_thread(id: u16) {
    THREAD_ID.with(|t| t.set(Some(id)));
}

struct HalDevice {
    device_id: u16,
    pf_id: u16,
    tag: String,
    dev: Arc<dyn Device>,
    poll_counter: AtomicU16,
    suspending: AtomicBool,
}

impl HalDevice {
    fn poll(&self, polling_interval: Option<Duration>) {
        if let Some(interval) = polling_interval {
            std::thread::sleep(interval);
            self.dev.poll_io();
            self.dev.poll_mmio();
        } else {
            // poll submission queues as fast as we can but don't spend
            // resources on polling mmio
            self.dev.poll_io();
            if self.poll_counter.fetch_add(1, Ordering::Relaxed) == 10_000 {
                self.dev.poll_mmio();
                self.poll_counter.store(0, Ordering::Relaxed);
            }
        }
        self.maybe_suspend();
    }

    fn maybe_suspend(&self) {
        if shutdown_requested() && !self.suspending.swap(true, Ordering::AcqRel) {
            self.dev.suspend();
        }
    }
}

/// The HAL instance: all emulated devices plus their polling setup.
pub struct Hal {
    devices: Vec<HalDevice>,
    mock_devices: Vec<HalDevice>,
    nthreads: u16,
    polling_interval: Option<Duration>,
    handler: Arc<dyn RequestHandler>,
}

impl Hal {
    /// Bring up every configured device. Each device's `register_device`
    /// callback runs before this returns, i.e. before any poll loop starts.
    pub fn new(
        cfg: &HalConfig,
        handler: Arc<dyn RequestHandler>,
        factory: &DeviceFactory<'_>,
    ) -> io::Result<Hal> {
        let mut hal = Hal {
            devices: Vec::with_capacity(cfg.pf_ids.len()),
            mock_devices: Vec::with_capacity(cfg.mock_pf_ids.len()),
            nthreads: cfg.nthreads,
            polling_interval: (cfg.polling_interval_usec > 0)
                .then(|| Duration::from_micros(cfg.polling_interval_usec)),
            handler,
        };

        let mut device_id = 0u16;
        for &pf_id in &cfg.pf_ids {
            let tag = format!("{}-{}", cfg.tag, device_id);
            let dev = factory(device_id, pf_id, &tag)?;
            hal.handler.register_device(device_id);
            hal.devices.push(HalDevice {
                device_id,
                pf_id,
                tag,
                dev,
                poll_counter: AtomicU16::new(0),
                suspending: AtomicBool::new(false),
            });
            device_id += 1;
        }
        for &pf_id in &cfg.mock_pf_ids {
            let tag = format!("{}-{}", cfg.tag, device_id);
            let dev = factory(device_id, pf_id, &tag)?;
            hal.handler.register_device(device_id);
            hal.mock_devices.push(HalDevice {
                device_id,
                pf_id,
                tag,
                dev,
                poll_counter: AtomicU16::new(0),
                suspending: AtomicBool::new(false),
            });
            device_id += 1;
        }

        info!(
            "HAL online: {} device(s) on {} ({} mock), tag prefix \"{}\"",
            hal.devices.len(),
            cfg.emu_manager,
            hal.mock_devices.len(),
            cfg.tag
        );
        Ok(hal)
    }

    pub fn nthreads(&self) -> u16 {
        self.nthreads
    }

    /// Poll one device's request queues.
    pub fn poll_io(&self, device_id: u16) -> io::Result<usize> {
        match self.devices.get(device_id as usize) {
            Some(d) => Ok(d.dev.poll_io()),
            None => Err(io::Error::from_raw_os_error(libc::ENODEV)),
        }
    }

    /// Poll one device's management IO.
    pub fn poll_mmio(&self, device_id: u16) {
        if let Some(d) = self.devices.get(device_id as usize) {
            d.dev.poll_mmio();
        }
    }

    fn all_suspended(&self) -> bool {
        self.devices.iter().all(|d| d.dev.is_suspended())
            && self.mock_devices.iter().all(|d| d.dev.is_suspended())
    }

    /// Static partition of the device list for thread `t`: every thread owns
    /// `D / N` contiguous devices and thread 0 additionally absorbs the
    /// remainder.
    fn partition(&self, t: u16) -> std::ops::Range<usize> {
        let ndevices = self.devices.len() / self.nthreads as usize;
        let remainder = self.devices.len() % self.nthreads as usize;
        let mut start = ndevices * t as usize;
        let mut end = start + ndevices;
        if t == 0 {
            end += remainder;
        } else {
            start += remainder;
            end += remainder;
        }
        start..end
    }

    fn pin_to_core(t: u16) {
        let num_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        if num_cpus <= 0 {
            return;
        }
        // with two threads and 8 total cores, thread 0 occupies core 7 and
        // thread 1 core 6
        let core = num_cpus as usize - 1 - (t as usize % num_cpus as usize);
        let mut set = CpuSet::new();
        if set.set(core).is_ok() {
            if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
                warn!("could not pin polling thread {t} to core {core}: {e}; continuing unpinned");
            }
        }
    }

    fn polling_thread(&self, t: u16) {
        register_poller_thread(t);
        Self::pin_to_core(t);

        let owned = self.partition(t);
        info!(
            "polling thread {t} owns devices {}..{}",
            owned.start, owned.end
        );
        while !shutdown_requested() || !self.all_suspended() {
            for dev in &self.devices[owned.clone()] {
                dev.poll(self.polling_interval);
            }
        }
    }

    // Checks for (management) IO once a second on all mock devices
    fn mock_thread(&self) {
        while !shutdown_requested() || !self.all_suspended() {
            for dev in &self.mock_devices {
                dev.dev.poll_io();
                dev.dev.poll_mmio();
                dev.maybe_suspend();
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    /// Enter the blocking poll loop. Returns once a shutdown signal arrived
    /// and every device reports suspended, which preserves in-flight
    /// requests to their host completion.
    pub fn run(&self) {
        KEEP_RUNNING.store(true, Ordering::SeqCst);
        install_signal_handlers();

        std::thread::scope(|scope| {
            if !self.mock_devices.is_empty() {
                std::thread::Builder::new()
                    .name("dpfs-mock".into())
                    .spawn_scoped(scope, || self.mock_thread())
                    .expect("failed to spawn mock poller");
            }
            for t in 0..self.nthreads {
                if std::thread::Builder::new()
                    .name(format!("dpfs-poll{t}"))
                    .spawn_scoped(scope, move || self.polling_thread(t))
                    .is_err()
                {
                    error!("failed to spawn polling thread {t}");
                }
            }
            info!("all device pollers are up and running");
        });
    }
}

impl std::fmt::Debug for Hal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hal")
            .field("devices", &self.devices.len())
            .field("mock_devices", &self.mock_devices.len())
            .field("nthreads", &self.nthreads)
            .finish()
    }
}

impl Drop for Hal {
    fn drop(&mut self) {
        for dev in self.devices.iter().chain(self.mock_devices.iter()) {
            self.handler.unregister_device(dev.device_id);
            info!("destroyed device {} (PF{}, \"{}\")", dev.device_id, dev.pf_id, dev.tag);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct IdleDevice;
    impl Device for IdleDevice {
        fn poll_io(&self) -> usize {
            0
        }
        fn suspend(&self) {}
        fn is_suspended(&self) -> bool {
            true
        }
    }

    struct NullHandler;
    impl RequestHandler for NullHandler {
        fn handle(&self, req: FuseRequest, _device_id: u16) -> HandlerOutcome {
            HandlerOutcome::Done(req)
        }
    }

    fn test_hal(ndevices: usize, nthreads: u16) -> Hal {
        let cfg = HalConfig {
            emu_manager: "test".into(),
            pf_ids: (0..ndevices as u16).collect(),
            queue_depth: QUEUE_DEPTH,
            nthreads,
            polling_interval_usec: 0,
            tag: "t".into(),
            mock_pf_ids: Vec::new(),
        };
        Hal::new(&cfg, Arc::new(NullHandler), &|_, _, _| {
            Ok(Arc::new(IdleDevice) as Arc<dyn Device>)
        })
        .unwrap()
    }

    #[test]
    fn partition_puts_remainder_on_thread_zero() {
        let hal = test_hal(7, 3);
        assert_eq!(hal.partition(0), 0..3);
        assert_eq!(hal.partition(1), 3..5);
        assert_eq!(hal.partition(2), 5..7);
    }

    #[test]
    fn partition_even_split() {
        let hal = test_hal(4, 2);
        assert_eq!(hal.partition(0), 0..2);
        assert_eq!(hal.partition(1), 2..4);
    }

    #[test]
    fn partition_covers_all_devices_exactly_once() {
        for (d, n) in [(1usize, 1u16), (5, 2), (9, 4), (16, 16)] {
            let hal = test_hal(d, n);
            let mut covered = vec![0u8; d];
            for t in 0..n {
                for i in hal.partition(t) {
                    covered[i] += 1;
                }
            }
            assert!(covered.iter().all(|&c| c == 1), "d={d} n={n}");
        }
    }

    #[test]
    fn poll_io_unknown_device_is_enodev() {
        let hal = test_hal(1, 1);
        assert_eq!(
            hal.poll_io(9).unwrap_err().raw_os_error(),
            Some(libc::ENODEV)
        );
    }

    #[test]
    fn thread_id_roundtrip() {
        std::thread::spawn(|| {
            register_poller_thread(3);
            assert_eq!(thread_id(), 3);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "outside a HAL worker thread")]
    fn thread_id_unregistered_panics() {
        std::thread::spawn(|| {
            let _ = thread_id();
        })
        .join()
        .unwrap_or_else(|e| std::panic::resume_unwind(e));
    }
}
