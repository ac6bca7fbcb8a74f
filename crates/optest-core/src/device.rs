use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Mlu220,
    Mlu270,
    Mlu290,
    Mlu370,
    Mlu590,
    Unknown,
}

/// Job-concurrency class a kernel may be scheduled with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelClass {
    Union1,
    Union2,
    Union4,
    Union8,
    Union16,
    Block,
    None,
}

impl KernelClass {
    /// Number of clusters a job of this class spans.
    pub fn clusters(self) -> u32 {
        match self {
            KernelClass::Union1 => 1,
            KernelClass::Union2 => 2,
            KernelClass::Union4 => 4,
            KernelClass::Union8 => 8,
            KernelClass::Union16 => 16,
            KernelClass::Block | KernelClass::None => 0,
        }
    }
}

/// Snapshot of the device the case runs on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub arch: Arch,
    pub cluster_num: u32,
    pub core_num_per_cluster: u32,
    pub job_limit: KernelClass,
    /// Visible-cluster bit mask.
    pub cluster_limit: u32,
}

impl DeviceHandle {
    /// Clusters actually usable under the current visibility mask.
    pub fn cluster_capability(&self) -> u32 {
        self.cluster_limit.count_ones().min(self.cluster_num)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Notifier(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Ready,
    NotReady,
}

/// Device memory as seen from inside an enqueued kernel body.
pub trait KernelMemory {
    fn read(&self, ptr: DevicePtr) -> Result<Vec<u8>>;
    fn write(&mut self, ptr: DevicePtr, offset: usize, data: &[u8]) -> Result<()>;
}

pub type KernelBody = Box<dyn FnOnce(&mut dyn KernelMemory) -> Result<()> + Send + 'static>;

/// A unit of device work placed on the execution queue.
pub struct Kernel {
    pub name: String,
    pub body: KernelBody,
}

impl Kernel {
    pub fn new(
        name: impl Into<String>,
        body: impl FnOnce(&mut dyn KernelMemory) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}

/// Driver/runtime bindings of one device with a single in-order queue.
///
/// Every non-success status surfaces as an `Err` carrying a
/// [`crate::ContractError::Device`].
pub trait DeviceRuntime: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn handle(&self) -> DeviceHandle;

    fn set_job_limit(&self, class: KernelClass) -> Result<()>;
    fn set_cluster_limit(&self, mask: u32) -> Result<()>;

    fn malloc(&self, bytes: usize) -> Result<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> Result<()>;
    fn memcpy_h2d(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;
    fn memcpy_d2h(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;
    fn memset(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<()>;

    fn create_notifier(&self) -> Result<Notifier>;
    fn destroy_notifier(&self, notifier: Notifier) -> Result<()>;

    /// Enqueue only; never waits for the kernel to run.
    fn enqueue(&self, kernel: Kernel) -> Result<()>;
    fn place_notifier(&self, notifier: Notifier) -> Result<()>;
    /// Non-blocking readiness check of a placed notifier.
    fn query_notifier(&self, notifier: Notifier) -> Result<QueueStatus>;
    /// Blocks until everything enqueued so far has completed.
    fn sync_queue(&self) -> Result<()>;
    /// Elapsed device time between two completed notifiers, in microseconds.
    fn notifier_duration_us(&self, start: Notifier, stop: Notifier) -> Result<f64>;
}
