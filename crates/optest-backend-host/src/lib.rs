//! Host-memory emulation of an accelerator runtime.
//!
//! Device memory is a map of byte buffers. The execution queue is a worker
//! thread fed through an unbounded channel, so enqueued kernels and
//! notifiers complete asynchronously and in order, like a real device queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bytes::BytesMut;
use optest_core::{
    Arch, ContractError, DeviceHandle, DevicePtr, DeviceRuntime, Kernel, KernelClass,
    KernelMemory, Notifier, QueueStatus,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub const ERR_INVALID_VALUE: i32 = 1;
pub const ERR_OUT_OF_MEMORY: i32 = 2;
pub const ERR_INJECTED: i32 = 100;

enum Command {
    Kernel(Kernel),
    Notify(Notifier),
    Sync(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct Memory {
    buffers: HashMap<u64, BytesMut>,
    next: u64,
    invalid_frees: usize,
}

#[derive(Clone, Copy, Default)]
struct NotifierSlot {
    pending: bool,
    fired_at: Option<Instant>,
}

#[derive(Default)]
struct Faults {
    malloc_budget: Option<usize>,
    query: bool,
    kernels: bool,
}

struct Shared {
    handle: Mutex<DeviceHandle>,
    memory: Mutex<Memory>,
    notifiers: Mutex<HashMap<u32, NotifierSlot>>,
    faults: Mutex<Faults>,
    /// First kernel failure seen by the queue.
    queue_fault: Mutex<Option<String>>,
    kernel_delay: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn device_err(call: &'static str, code: i32) -> anyhow::Error {
    ContractError::Device { call, code }.into()
}

pub fn default_handle() -> DeviceHandle {
    DeviceHandle {
        arch: Arch::Mlu370,
        cluster_num: 8,
        core_num_per_cluster: 4,
        job_limit: KernelClass::Union4,
        cluster_limit: 255,
    }
}

pub struct HostRuntime {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_notifier: Mutex<u32>,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::with_options(default_handle(), Duration::ZERO)
    }

    pub fn with_handle(handle: DeviceHandle) -> Self {
        Self::with_options(handle, Duration::ZERO)
    }

    /// `kernel_delay` is slept before every kernel, so polls right after a
    /// launch observe a busy queue.
    pub fn with_options(handle: DeviceHandle, kernel_delay: Duration) -> Self {
        let shared = Arc::new(Shared {
            handle: Mutex::new(handle),
            memory: Mutex::new(Memory {
                next: 0x1000,
                ..Memory::default()
            }),
            notifiers: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            queue_fault: Mutex::new(None),
            kernel_delay,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("host-queue".into())
            .spawn(move || run_queue(worker_shared, rx))
            .ok();
        if worker.is_none() {
            warn!("failed to spawn host queue thread");
        }
        Self {
            shared,
            tx,
            worker: Mutex::new(worker),
            next_notifier: Mutex::new(0),
        }
    }

    /// Device allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        lock(&self.shared.memory).buffers.len()
    }

    /// Frees of pointers that were never allocated or already freed.
    pub fn invalid_frees(&self) -> usize {
        lock(&self.shared.memory).invalid_frees
    }

    /// Let `n` more allocations succeed, then fail every later one.
    pub fn fail_malloc_after(&self, n: usize) {
        lock(&self.shared.faults).malloc_budget = Some(n);
    }

    /// The next notifier query returns a device error.
    pub fn fail_next_query(&self) {
        lock(&self.shared.faults).query = true;
    }

    /// Every kernel run from now on fails on the queue.
    pub fn fail_kernels(&self, fail: bool) {
        lock(&self.shared.faults).kernels = fail;
    }

    fn send(&self, call: &'static str, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow!(ContractError::QueueFault(format!("{call}: queue is closed"))))
    }

    fn check_queue_fault(&self) -> Result<()> {
        match lock(&self.shared.queue_fault).as_ref() {
            Some(msg) => Err(ContractError::QueueFault(msg.clone()).into()),
            None => Ok(()),
        }
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                warn!("host queue thread panicked");
            }
        }
    }
}

fn run_queue(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Command>) {
    debug!("host queue started");
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Kernel(kernel) => {
                if !shared.kernel_delay.is_zero() {
                    std::thread::sleep(shared.kernel_delay);
                }
                let outcome = if lock(&shared.faults).kernels {
                    Err(anyhow!("injected kernel failure"))
                } else {
                    let mut memory = lock(&shared.memory);
                    (kernel.body)(&mut QueueMemory(&mut memory.buffers))
                };
                if let Err(err) = outcome {
                    warn!(kernel = %kernel.name, error = ?err, "kernel failed");
                    let mut fault = lock(&shared.queue_fault);
                    if fault.is_none() {
                        *fault = Some(format!("kernel `{}`: {err:#}", kernel.name));
                    }
                }
            }
            Command::Notify(notifier) => {
                let mut slots = lock(&shared.notifiers);
                let slot = slots.entry(notifier.0).or_default();
                slot.pending = false;
                slot.fired_at = Some(Instant::now());
            }
            Command::Sync(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }
    debug!("host queue stopped");
}

struct QueueMemory<'a>(&'a mut HashMap<u64, BytesMut>);

impl KernelMemory for QueueMemory<'_> {
    fn read(&self, ptr: DevicePtr) -> Result<Vec<u8>> {
        self.0
            .get(&ptr.0)
            .map(|b| b.to_vec())
            .ok_or_else(|| device_err("kernel read", ERR_INVALID_VALUE))
    }

    fn write(&mut self, ptr: DevicePtr, offset: usize, data: &[u8]) -> Result<()> {
        let buf = self
            .0
            .get_mut(&ptr.0)
            .ok_or_else(|| device_err("kernel write", ERR_INVALID_VALUE))?;
        let end = offset + data.len();
        if end > buf.len() {
            return Err(ContractError::BufferTooSmall {
                what: "kernel write target",
                required: end,
                actual: buf.len(),
            }
            .into());
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }
}

impl DeviceRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn handle(&self) -> DeviceHandle {
        lock(&self.shared.handle).clone()
    }

    fn set_job_limit(&self, class: KernelClass) -> Result<()> {
        lock(&self.shared.handle).job_limit = class;
        Ok(())
    }

    fn set_cluster_limit(&self, mask: u32) -> Result<()> {
        if mask == 0 {
            return Err(device_err("set cluster limit", ERR_INVALID_VALUE));
        }
        lock(&self.shared.handle).cluster_limit = mask;
        Ok(())
    }

    fn malloc(&self, bytes: usize) -> Result<DevicePtr> {
        {
            let mut faults = lock(&self.shared.faults);
            if let Some(budget) = faults.malloc_budget.as_mut() {
                if *budget == 0 {
                    return Err(device_err("malloc", ERR_OUT_OF_MEMORY));
                }
                *budget -= 1;
            }
        }
        let mut memory = lock(&self.shared.memory);
        let ptr = memory.next;
        memory.next += (bytes as u64).max(1).next_multiple_of(64);
        memory.buffers.insert(ptr, BytesMut::zeroed(bytes));
        debug!(ptr, bytes, "device malloc");
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut memory = lock(&self.shared.memory);
        if memory.buffers.remove(&ptr.0).is_none() {
            memory.invalid_frees += 1;
            return Err(device_err("free", ERR_INVALID_VALUE));
        }
        debug!(ptr = ptr.0, "device free");
        Ok(())
    }

    fn memcpy_h2d(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let mut memory = lock(&self.shared.memory);
        let buf = memory
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| device_err("memcpy host to device", ERR_INVALID_VALUE))?;
        if buf.len() < src.len() {
            return Err(device_err("memcpy host to device", ERR_INVALID_VALUE));
        }
        buf[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let memory = lock(&self.shared.memory);
        let buf = memory
            .buffers
            .get(&src.0)
            .ok_or_else(|| device_err("memcpy device to host", ERR_INVALID_VALUE))?;
        if buf.len() < dst.len() {
            return Err(device_err("memcpy device to host", ERR_INVALID_VALUE));
        }
        dst.copy_from_slice(&buf[..dst.len()]);
        Ok(())
    }

    fn memset(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<()> {
        let mut memory = lock(&self.shared.memory);
        let buf = memory
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| device_err("memset", ERR_INVALID_VALUE))?;
        if buf.len() < bytes {
            return Err(device_err("memset", ERR_INVALID_VALUE));
        }
        buf[..bytes].fill(value);
        Ok(())
    }

    fn create_notifier(&self) -> Result<Notifier> {
        let mut next = lock(&self.next_notifier);
        *next += 1;
        let notifier = Notifier(*next);
        lock(&self.shared.notifiers).insert(notifier.0, NotifierSlot::default());
        Ok(notifier)
    }

    fn destroy_notifier(&self, notifier: Notifier) -> Result<()> {
        lock(&self.shared.notifiers)
            .remove(&notifier.0)
            .map(|_| ())
            .ok_or_else(|| device_err("destroy notifier", ERR_INVALID_VALUE))
    }

    fn enqueue(&self, kernel: Kernel) -> Result<()> {
        debug!(kernel = %kernel.name, "enqueue");
        self.send("enqueue", Command::Kernel(kernel))
    }

    fn place_notifier(&self, notifier: Notifier) -> Result<()> {
        {
            let mut slots = lock(&self.shared.notifiers);
            let slot = slots
                .get_mut(&notifier.0)
                .ok_or_else(|| device_err("place notifier", ERR_INVALID_VALUE))?;
            slot.pending = true;
            slot.fired_at = None;
        }
        self.send("place notifier", Command::Notify(notifier))
    }

    fn query_notifier(&self, notifier: Notifier) -> Result<QueueStatus> {
        {
            let mut faults = lock(&self.shared.faults);
            if faults.query {
                faults.query = false;
                return Err(device_err("query notifier", ERR_INJECTED));
            }
        }
        self.check_queue_fault()?;
        let slots = lock(&self.shared.notifiers);
        let slot = slots
            .get(&notifier.0)
            .ok_or_else(|| device_err("query notifier", ERR_INVALID_VALUE))?;
        Ok(if slot.pending {
            QueueStatus::NotReady
        } else {
            QueueStatus::Ready
        })
    }

    fn sync_queue(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send("sync queue", Command::Sync(done_tx))?;
        done_rx
            .blocking_recv()
            .map_err(|_| anyhow!(ContractError::QueueFault("queue stopped before sync".into())))?;
        self.check_queue_fault()
    }

    fn notifier_duration_us(&self, start: Notifier, stop: Notifier) -> Result<f64> {
        let slots = lock(&self.shared.notifiers);
        let fired = |n: Notifier| {
            slots
                .get(&n.0)
                .and_then(|s| s.fired_at)
                .ok_or_else(|| device_err("notifier duration", ERR_INVALID_VALUE))
        };
        let (t0, t1) = (fired(start)?, fired(stop)?);
        Ok(t1.saturating_duration_since(t0).as_secs_f64() * 1e6)
    }
}
