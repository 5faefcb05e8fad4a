//! The EHCI host core.
//!
//! [UsbHost] owns every structure the controller reads by DMA: the periodic frame list, the
//! async ring's reclamation head and the device, pipe and transfer pools. They live inside the
//! host itself, which is why it has to be pinned before [UsbHost::begin] hands their addresses to
//! hardware.
//!
//! The host core runs in one thread of execution plus the controller's interrupt handler, which
//! calls [UsbHost::isr]. Shared state sits behind one mutex, always taken through
//! [UsbHost::critical] so that the controller interrupt is masked while it is held.

use std::marker::PhantomPinned;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::result;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use common::io::{Io, Mmio};
use common::timeout::Timeout;
use log::{debug, error, info};

use self::device::{AddressMap, Device, EnumState};
use self::irq_reactor::Parked;
use self::pipe::{Pipe, Reclaim};
use self::pool::Pool;
use self::port::RootPort;
use self::qh::QueueHead;
use self::qtd::LINK_TERMINATE;
use self::registry::Registry;
use self::regs::{EhciRegs, OpReg, PortSc, UsbCmd, UsbIntr, UsbSts, USBCMD_FLS_256};
use self::transfer::{FollowupList, Transfer};
use crate::config::HostConfig;
use crate::driver_interface::{
    DeviceId, DeviceInfo, Direction, DmaBuf, Error, PipeCallback, PipeId, PipeType, Rejected,
    Result, Setup, Speed, UsbBus,
};

pub mod device;
pub mod enumeration;
pub mod irq_reactor;
pub mod pipe;
pub mod pool;
pub mod port;
pub mod qh;
pub mod qtd;
pub mod registry;
pub mod regs;
pub mod transfer;

#[cfg(test)]
pub(crate) mod sim;

pub const MAX_DEVICES: usize = 8;
pub const MAX_PIPES: usize = 32;
pub const MAX_TRANSFERS: usize = 96;
pub const MAX_DRIVERS: usize = 16;
pub const MAX_ROOT_PORTS: usize = 15;
pub const FRAME_LIST_LEN: usize = 256;

/// Interrupts the host runs with.
pub const HOST_INTERRUPTS: UsbIntr = UsbIntr::USBINT
    .union(UsbIntr::USBERRINT)
    .union(UsbIntr::PCD)
    .union(UsbIntr::IAA)
    .union(UsbIntr::HSE);

/// The periodic frame list (EHCI 3.1). One link per frame, 4 KiB aligned.
#[repr(C, align(4096))]
pub struct FrameList(pub [Mmio<u32>; FRAME_LIST_LEN]);

impl FrameList {
    fn new() -> Self {
        Self(core::array::from_fn(|_| Mmio::new(LINK_TERMINATE)))
    }

    pub fn phys(&self) -> u32 {
        self as *const Self as usize as u32
    }
}

/// Everything the host shares between normal context and the interrupt handler.
pub struct HostState {
    pub(crate) periodic: FrameList,
    pub(crate) async_head: QueueHead,
    pub(crate) devices: Pool<Device, MAX_DEVICES>,
    pub(crate) pipes: Pool<Pipe, MAX_PIPES>,
    pub(crate) transfers: Pool<Transfer, MAX_TRANSFERS>,
    pub(crate) drivers: Registry,
    pub(crate) followup: FollowupList,
    /// First pipe after the reclamation head.
    pub(crate) async_first: Option<PipeId>,
    /// First pipe of the periodic list, the one with the longest interval.
    pub(crate) periodic_first: Option<PipeId>,
    pub(crate) reclaim: Reclaim,
    pub(crate) addresses: AddressMap,
    /// The device currently answering at address 0.
    pub(crate) default_address: Option<DeviceId>,
    pub(crate) ports: [RootPort; MAX_ROOT_PORTS],
    /// Completions whose driver was locked by the interrupted context, in arrival order.
    pub(crate) parked: VecDeque<Parked>,
    /// Frame number sampled when the critical section was entered.
    pub(crate) frame: u32,
    pub(crate) running: bool,
}

impl HostState {
    fn new() -> Self {
        Self {
            periodic: FrameList::new(),
            async_head: QueueHead::default(),
            devices: Pool::new("device"),
            pipes: Pool::new("pipe"),
            transfers: Pool::new("transfer"),
            drivers: Registry::default(),
            followup: FollowupList::default(),
            async_first: None,
            periodic_first: None,
            reclaim: Reclaim::default(),
            addresses: AddressMap::default(),
            default_address: None,
            ports: [RootPort::default(); MAX_ROOT_PORTS],
            parked: VecDeque::new(),
            frame: 0,
            running: false,
        }
    }

    /// A device that is attached and not being torn down.
    pub(crate) fn device(&self, id: DeviceId) -> Result<&Device> {
        match self.devices.get(id) {
            Some(device) if device.state != EnumState::Detaching => Ok(device),
            _ => Err(Error::NoSuchDevice),
        }
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> Result<&mut Device> {
        match self.devices.get_mut(id) {
            Some(device) if device.state != EnumState::Detaching => Ok(device),
            _ => Err(Error::NoSuchDevice),
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }
}

/// The controller interrupt masked. The previous enable mask comes back on drop, so these nest.
pub(crate) struct Masked<'a, R: EhciRegs> {
    regs: &'a R,
    saved: u32,
}

impl<R: EhciRegs> Drop for Masked<'_, R> {
    fn drop(&mut self) {
        self.regs.write(OpReg::UsbIntr, self.saved);
    }
}

/// The host state, locked with the controller interrupt masked.
///
/// Dropping the guard unlocks, rings the async advance doorbell if an unlink asked for it and
/// restores the interrupt enable register.
pub(crate) struct Critical<'a, R: EhciRegs> {
    regs: &'a R,
    state: ManuallyDrop<MutexGuard<'a, HostState>>,
    _masked: Masked<'a, R>,
}

impl<R: EhciRegs> Deref for Critical<'_, R> {
    type Target = HostState;

    fn deref(&self) -> &HostState {
        &self.state
    }
}

impl<R: EhciRegs> DerefMut for Critical<'_, R> {
    fn deref_mut(&mut self) -> &mut HostState {
        &mut self.state
    }
}

impl<R: EhciRegs> Drop for Critical<'_, R> {
    fn drop(&mut self) {
        let ring = std::mem::take(&mut self.state.reclaim.ring);
        unsafe { ManuallyDrop::drop(&mut self.state) };
        if ring {
            self.regs.set_usbcmd(UsbCmd::IAAD, true);
        }
    }
}

/// A driver locked from normal context. The controller interrupt stays masked while it is held,
/// so the interrupt handler never finds the driver busy; completions parked in the meantime are
/// delivered when it drops.
pub struct DriverGuard<'a, R: EhciRegs, D: ?Sized> {
    host: &'a UsbHost<R>,
    driver: ManuallyDrop<MutexGuard<'a, D>>,
    _masked: Masked<'a, R>,
}

impl<R: EhciRegs, D: ?Sized> Deref for DriverGuard<'_, R, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.driver
    }
}

impl<R: EhciRegs, D: ?Sized> DerefMut for DriverGuard<'_, R, D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

impl<R: EhciRegs, D: ?Sized> Drop for DriverGuard<'_, R, D> {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.driver) };
        self.host.deliver_parked();
    }
}

/// Locks a driver without waiting. `None` while someone else holds it.
pub(crate) fn try_lock_driver<D: ?Sized>(driver: &Mutex<D>) -> Option<MutexGuard<'_, D>> {
    match driver.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

pub struct UsbHost<R: EhciRegs> {
    regs: R,
    state: Mutex<HostState>,
    config: HostConfig,
    _pinned: PhantomPinned,
}

impl<R: EhciRegs> UsbHost<R> {
    pub fn new(regs: R, config: HostConfig) -> Self {
        Self {
            regs,
            state: Mutex::new(HostState::new()),
            config,
            _pinned: PhantomPinned,
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub(crate) fn mask(&self) -> Masked<'_, R> {
        let saved = self.regs.read(OpReg::UsbIntr);
        self.regs.write(OpReg::UsbIntr, 0);
        Masked {
            regs: &self.regs,
            saved,
        }
    }

    pub(crate) fn critical(&self) -> Critical<'_, R> {
        let masked = self.mask();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.frame = self.regs.read(OpReg::FrIndex) >> 3;
        Critical {
            regs: &self.regs,
            state: ManuallyDrop::new(state),
            _masked: masked,
        }
    }

    /// Locks a registered driver for use from normal context. Locking it directly instead makes
    /// its completions wait until [UsbHost::deliver_parked] runs.
    pub fn lock_driver<'a, D: ?Sized>(&'a self, driver: &'a Mutex<D>) -> DriverGuard<'a, R, D> {
        let masked = self.mask();
        let driver = driver.lock().unwrap_or_else(PoisonError::into_inner);
        DriverGuard {
            host: self,
            driver: ManuallyDrop::new(driver),
            _masked: masked,
        }
    }

    /// Resets the controller, hands it the schedules, and starts it with the root ports powered.
    pub fn begin(self: Pin<&Self>) -> Result<()> {
        let this = self.get_ref();
        let regs = &this.regs;

        regs.set_usbcmd(UsbCmd::RS, false);
        let timeout = Timeout::from_millis(this.config.reset_timeout_ms);
        while !regs.usbsts().contains(UsbSts::HCHALTED) {
            timeout.run().map_err(|()| {
                error!("timeout on USBSTS_HCHALTED");
                Error::ResetTimeout
            })?;
        }

        regs.write(OpReg::UsbCmd, UsbCmd::HCRESET.bits());
        let timeout = Timeout::from_millis(this.config.reset_timeout_ms);
        while regs.usbcmd().contains(UsbCmd::HCRESET) {
            timeout.run().map_err(|()| {
                error!("timeout on USBCMD_HCRESET");
                Error::ResetTimeout
            })?;
        }

        let (periodic, async_head) = {
            let mut state = this.state.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in state.periodic.0.iter_mut() {
                entry.write(LINK_TERMINATE);
            }
            state.async_head.init_reclamation_head();
            state.running = true;
            (state.periodic.phys(), state.async_head.phys())
        };

        regs.write(OpReg::CtrlDsSegment, 0);
        regs.write(OpReg::PeriodicListBase, periodic);
        regs.write(OpReg::AsyncListAddr, async_head);
        regs.write(OpReg::UsbSts, UsbSts::all().bits());
        regs.write(OpReg::UsbIntr, HOST_INTERRUPTS.bits());
        regs.write(
            OpReg::UsbCmd,
            this.config.itc_bits()
                | USBCMD_FLS_256
                | (UsbCmd::PSE | UsbCmd::ASE | UsbCmd::RS).bits(),
        );
        regs.write(OpReg::ConfigFlag, 1);

        let ports = regs.port_count().min(MAX_ROOT_PORTS as u8);
        for port in 0..ports {
            regs.write_port(port, PortSc::PP.bits());
        }
        info!("EHCI initialized, {} root ports", ports);
        Ok(())
    }

    /// The controller interrupt handler.
    pub fn isr(&self) {
        let status = self.regs.usbsts()
            & (UsbSts::USBINT
                | UsbSts::USBERRINT
                | UsbSts::PCD
                | UsbSts::FLR
                | UsbSts::HSE
                | UsbSts::IAA);
        if status.is_empty() {
            return;
        }
        self.regs.write(OpReg::UsbSts, status.bits());

        if status.contains(UsbSts::HSE) {
            error!("host system error, controller halted");
            self.critical().running = false;
        }
        self.deliver_parked();
        if status.intersects(UsbSts::USBINT | UsbSts::USBERRINT) {
            self.dispatch();
        }
        if status.contains(UsbSts::IAA) {
            self.critical().reclaim();
        }
        if status.contains(UsbSts::PCD) {
            self.port_change();
        }
    }

    pub fn is_running(&self) -> bool {
        self.critical().running
    }

    pub fn device_state(&self, device: DeviceId) -> Option<EnumState> {
        self.critical().devices.get(device).map(Device::state)
    }

    /// Every attached device, in slot order. Devices being torn down are left out.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.critical()
            .devices
            .iter()
            .filter(|(_, device)| device.state != EnumState::Detaching)
            .map(|(id, _)| id)
            .collect()
    }
}

impl<R: EhciRegs> UsbBus for UsbHost<R> {
    fn new_pipe(
        &self,
        device: DeviceId,
        ty: PipeType,
        endpoint: u8,
        direction: Direction,
        max_packet: u16,
        callback: PipeCallback,
    ) -> Result<PipeId> {
        let mut state = self.critical();
        state.check_running()?;
        state.create_pipe(device, ty, endpoint, direction, max_packet, callback)
    }

    fn free_pipe(&self, pipe: PipeId) -> Result<()> {
        self.critical().unlink_pipe(pipe)
    }

    fn new_transfer(&self, pipe: PipeId, buf: DmaBuf) -> result::Result<(), Rejected> {
        let mut state = self.critical();
        if let Err(error) = state.check_running() {
            return Err(Rejected { error, buf });
        }
        state.queue_normal(pipe, buf)
    }

    fn control_transfer(
        &self,
        pipe: PipeId,
        setup: &Setup,
        buf: DmaBuf,
    ) -> result::Result<(), Rejected> {
        let mut state = self.critical();
        if let Err(error) = state.check_running() {
            return Err(Rejected { error, buf });
        }
        state.queue_control(pipe, setup, buf)
    }

    fn new_device(&self, speed: Speed, hub_address: u8, hub_port: u8) -> Result<DeviceId> {
        self.attach(speed, hub_address, hub_port)
    }

    fn disconnect_device(&self, device: DeviceId) -> Result<()> {
        self.detach(device)
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        let state = self.critical();
        state.device(device)?.info().ok_or(Error::NoSuchDevice)
    }
}

#[cfg(test)]
impl HostState {
    pub(crate) fn new_boxed() -> Box<Self> {
        Box::new(Self::new())
    }

    /// An enumerated device with its control pipe, bypassing enumeration.
    pub(crate) fn add_test_device(&mut self, speed: Speed, address: u8) -> DeviceId {
        let mut device = Device::new(speed, 0, 0, (0, 0), 1);
        device.address = address;
        device.state = EnumState::Active;
        let id = self.devices.alloc(device).unwrap();
        let control = self
            .create_pipe(
                id,
                PipeType::Control,
                0,
                Direction::Out,
                speed.default_max_packet(),
                PipeCallback::Enumeration,
            )
            .unwrap();
        self.devices.get_mut(id).unwrap().control = Some(control);
        debug!("test device {:?} at address {}", id, address);
        id
    }
}
