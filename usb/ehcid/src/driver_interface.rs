//! The contract between the host core and class drivers.
//!
//! Drivers see the host only through [UsbBus], and the host sees drivers only through
//! [UsbDriver]. Every call in either direction happens with no host lock held, so a driver may
//! call back into the bus from any of its methods.

pub extern crate smallvec;

use std::{fmt, ptr, result, slice};

use thiserror::Error;

use crate::ehci::device::Device;
use crate::ehci::pipe::Pipe;
use crate::ehci::pool::{Id, PoolError};
pub use crate::usb::{EndpointTy, Setup, ENDP_ATTR_TY_MASK};

pub type DeviceId = Id<Device>;
pub type PipeId = Id<Pipe>;

/// Index of a registered driver. Drivers are never unregistered, so no generation is needed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DriverId(pub(crate) u8);

impl DriverId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Bus speed, with the discriminants of the EPS field of a queue head.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Speed {
    Full = 0,
    Low = 1,
    High = 2,
}

impl Speed {
    /// Default control endpoint packet size to use until the device descriptor says otherwise.
    pub fn default_max_packet(self) -> u16 {
        match self {
            Speed::Low => 8,
            Speed::Full | Speed::High => 64,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipeType {
    Control,
    Bulk,
    /// Polled every `interval` frames.
    Interrupt { interval: u16 },
    Isochronous { interval: u16 },
}

impl PipeType {
    pub fn is_periodic(self) -> bool {
        matches!(self, PipeType::Interrupt { .. } | PipeType::Isochronous { .. })
    }
}

/// Who is told when a transfer on a pipe retires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipeCallback {
    None,
    /// The device's default control pipe: enumeration while the device is being set up, the
    /// bound drivers' [UsbDriver::control] once it is active.
    Enumeration,
    Driver(DriverId),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resource {
    Devices,
    Pipes,
    Transfers,
    Drivers,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Resource::Devices => "device",
            Resource::Pipes => "pipe",
            Resource::Transfers => "transfer",
            Resource::Drivers => "driver",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} pool exhausted")]
    ResourceExhausted(Resource),

    #[error("no such device")]
    NoSuchDevice,

    #[error("no such pipe")]
    NoSuchPipe,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("transfer too large ({0} bytes)")]
    TransferTooLarge(u32),

    #[error("host controller is not running")]
    NotRunning,

    #[error("tier {0} is deeper than allowed")]
    TooDeep(u8),

    #[error("no free bus address")]
    NoAddress,

    #[error("host controller reset timed out")]
    ResetTimeout,

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// A submission the host refused, handing the buffer back to its owner.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct Rejected {
    pub error: Error,
    pub buf: DmaBuf,
}

impl From<Rejected> for Error {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// Outcome of a transfer the controller halted on.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum TransferError {
    #[error("endpoint stalled")]
    Stall,
    #[error("babble detected")]
    Babble,
    #[error("transaction error")]
    Transaction,
    #[error("data buffer overrun or underrun")]
    DataBuffer,
    #[error("missed microframe")]
    MissedMicroframe,
}

/// A buffer the controller reads or writes by DMA.
///
/// Ownership moves into the host with a submission and comes back in the [Completion], so the
/// memory is never reachable from software while the controller may access it.
pub struct DmaBuf {
    ptr: *mut u8,
    len: usize,
}

// The buffer is uniquely owned, like the `&'static mut [u8]` it is usually made from.
unsafe impl Send for DmaBuf {}

impl DmaBuf {
    pub fn from_static(buf: &'static mut [u8]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, reachable by the controller, and
    /// not accessed through any other path until the buffer is handed back.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn empty() -> Self {
        Self {
            ptr: ptr::NonNull::dangling().as_ptr(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Bus address of the first byte.
    pub fn phys(&self) -> u32 {
        self.ptr as usize as u32
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Default for DmaBuf {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DmaBuf({:p}, {})", self.ptr, self.len)
    }
}

/// One retired transfer, reported once per submission.
#[derive(Debug)]
pub struct Completion {
    pub pipe: PipeId,
    pub device: DeviceId,
    pub buf: DmaBuf,
    /// Requested length.
    pub length: u32,
    /// Bytes actually moved, less than `length` after a short packet.
    pub actual: u32,
    pub status: Result<(), TransferError>,
    /// The request, for control transfers.
    pub setup: Option<Setup>,
}

impl Completion {
    pub fn data(&self) -> &[u8] {
        let len = (self.actual as usize).min(self.buf.len());
        &self.buf.as_slice()[..len]
    }

    /// Takes the buffer back, for resubmission.
    pub fn take_buf(&mut self) -> DmaBuf {
        std::mem::take(&mut self.buf)
    }
}

/// What the host knows about an enumerated device.
#[derive(Clone, Copy, Debug)]
pub struct DeviceInfo {
    pub address: u8,
    pub speed: Speed,
    /// Address of the hub the device is attached to, 0 for a root port.
    pub hub_address: u8,
    pub hub_port: u8,
    /// 1 for a device on a root port.
    pub tier: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub vendor: u16,
    pub product: u16,
    pub language: u16,
    pub configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub control_pipe: PipeId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimScope {
    /// The descriptors are the 18-byte device descriptor.
    Device,
    /// The descriptors are one interface with its alternate settings, endpoints and class
    /// descriptors.
    Interface,
    /// The descriptors start with an interface association descriptor, followed by every
    /// interface it covers.
    InterfaceAssociation,
}

/// A device (or part of one) offered to a driver.
#[derive(Clone, Copy, Debug)]
pub struct ClaimRequest<'a> {
    /// The driver being asked, for binding pipes to it.
    pub driver: DriverId,
    pub device: DeviceId,
    pub info: DeviceInfo,
    pub scope: ClaimScope,
    pub descriptors: &'a [u8],
}

pub trait UsbDriver: Send {
    /// Returns true to take the offered device or interface group. A driver serves one device.
    fn claim(&mut self, bus: &dyn UsbBus, request: &ClaimRequest) -> bool;

    /// A completion on the control pipe of the bound device that enumeration did not issue.
    /// Returns true when the driver recognised it, which stops it from being offered further.
    fn control(&mut self, _bus: &dyn UsbBus, _completion: &mut Completion) -> bool {
        false
    }

    /// A completion on a pipe opened with [PipeCallback::Driver].
    fn transfer(&mut self, _bus: &dyn UsbBus, _completion: Completion) {}

    /// The bound device is gone. Called exactly once; the driver returns to the available list
    /// afterwards and may be offered another device.
    fn disconnect(&mut self, _bus: &dyn UsbBus, _device: DeviceId) {}
}

/// The host operations a driver may use.
pub trait UsbBus {
    fn new_pipe(
        &self,
        device: DeviceId,
        ty: PipeType,
        endpoint: u8,
        direction: Direction,
        max_packet: u16,
        callback: PipeCallback,
    ) -> Result<PipeId>;

    /// Cancels everything queued on the pipe and releases it once the controller has let go.
    fn free_pipe(&self, pipe: PipeId) -> Result<()>;

    /// Queues a bulk or interrupt transfer of the whole buffer.
    fn new_transfer(&self, pipe: PipeId, buf: DmaBuf) -> result::Result<(), Rejected>;

    /// Queues a control transfer. The data stage moves `setup.length` bytes of `buf`.
    fn control_transfer(
        &self,
        pipe: PipeId,
        setup: &Setup,
        buf: DmaBuf,
    ) -> result::Result<(), Rejected>;

    /// Starts enumeration of a device that just appeared on a hub port, or on a root port when
    /// `hub_address` is 0.
    fn new_device(&self, speed: Speed, hub_address: u8, hub_port: u8) -> Result<DeviceId>;

    fn disconnect_device(&self, device: DeviceId) -> Result<()>;

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo>;
}
