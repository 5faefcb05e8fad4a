//! Chapter 9 enumeration, one control request per step.
//!
//! Each completion on the default control pipe of a device that is not yet active moves it one
//! state forward and issues the next request. Only one device at a time answers at address 0:
//! devices attached meanwhile wait and start in slot order once the address is released.

use std::fmt;

use log::{debug, info, trace, warn};
use plain::Plain;
use smallvec::SmallVec;

use super::device::{Device, EnumState, ENUM_BUF};
use super::irq_reactor::Parked;
use super::regs::EhciRegs;
use super::{HostState, UsbHost};
use crate::driver_interface::{
    Completion, DeviceId, Direction, DmaBuf, Error, PipeCallback, PipeType, Resource, Result, Speed,
};
use crate::usb::{ConfigDescriptor, DescriptorKind, DeviceDescriptor, DeviceDescriptor8Byte, Setup};

/// What a completion did to an enumerating device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    Continue,
    Active,
    Abandoned,
}

fn read<T: Plain + Default>(bytes: &[u8]) -> T {
    let mut value = T::default();
    let _ = plain::copy_from_bytes(&mut value, bytes);
    value
}

impl HostState {
    /// Issues the request of the device's current state.
    pub(crate) fn issue(&mut self, id: DeviceId) -> Result<()> {
        let device = self.device_mut(id)?;
        let setup = match device.state {
            EnumState::Attached => {
                Setup::get_descriptor(DescriptorKind::Device, 0, 0, DeviceDescriptor8Byte::SIZE as u16)
            }
            EnumState::SettingAddress => Setup::set_address(u16::from(device.address)),
            EnumState::ReadingDevice => {
                Setup::get_descriptor(DescriptorKind::Device, 0, 0, DeviceDescriptor::SIZE as u16)
            }
            EnumState::ReadingLanguage => Setup::get_descriptor(DescriptorKind::String, 0, 0, 4),
            EnumState::ReadingConfigHeader => Setup::get_descriptor(
                DescriptorKind::Configuration,
                0,
                0,
                ConfigDescriptor::SIZE as u16,
            ),
            EnumState::ReadingConfig => Setup::get_descriptor(
                DescriptorKind::Configuration,
                0,
                0,
                device.config.total_length,
            ),
            EnumState::Configuring => Setup::set_configuration(device.config.configuration_value),
            EnumState::Waiting | EnumState::Active | EnumState::Detaching => return Ok(()),
        };
        debug!("device {:?}: {:?}", id, device.state);
        device.setup = setup;
        let pipe = device.control.ok_or(Error::NoSuchPipe)?;
        // The descriptor buffer lives in the device's pool slot and stays put until the slot is
        // freed, which unlinks the pipe first.
        let buf = unsafe { DmaBuf::from_raw(device.buf.as_mut_ptr(), ENUM_BUF) };
        self.queue_control(pipe, &setup, buf)?;
        Ok(())
    }

    /// Hands address 0 to the next waiting device, if it is free.
    pub(crate) fn start_next_waiting(&mut self) {
        while self.default_address.is_none() {
            let next = self
                .devices
                .iter()
                .find(|(_, device)| device.state == EnumState::Waiting)
                .map(|(id, _)| id);
            let Some(id) = next else {
                return;
            };
            if let Some(device) = self.devices.get_mut(id) {
                device.state = EnumState::Attached;
                device.retries = 0;
            }
            self.default_address = Some(id);
            if let Err(err) = self.issue(id) {
                warn!("device {:?}: failed to start enumeration: {}", id, err);
                self.teardown(id);
            }
        }
    }

    fn release_default_address(&mut self, id: DeviceId) {
        if self.default_address == Some(id) {
            self.default_address = None;
            self.start_next_waiting();
        }
    }

    /// Frees everything a device owns: its pipes (through the unlink handshake), its address and
    /// its slot. Drivers must already have been told.
    ///
    /// The slot holds the descriptor buffer queued requests point at, so it stays `Detaching`
    /// until the last of the device's pipes is reclaimed.
    pub(crate) fn teardown(&mut self, id: DeviceId) {
        let pipes = self.device_pipes(id);
        for pipe in pipes {
            if let Err(err) = self.unlink_pipe(pipe) {
                warn!("device {:?}: failed to free pipe {:?}: {}", id, pipe, err);
            }
        }
        match self.devices.get_mut(id) {
            Some(device) => {
                device.state = EnumState::Detaching;
                device.control = None;
            }
            None => return,
        }
        self.free_detached(id);
    }

    /// Frees a detaching device once no pipe of it is left, linked or waiting for reclaim.
    pub(crate) fn free_detached(&mut self, id: DeviceId) {
        let address = match self.devices.get(id) {
            Some(device) if device.state == EnumState::Detaching => device.address,
            _ => return,
        };
        if self.pipes.iter().any(|(_, pipe)| pipe.device == Some(id)) {
            trace!("device {:?} waits for its pipes", id);
            return;
        }
        self.addresses.release(address);
        if let Err(err) = self.devices.free(id) {
            warn!("device {:?}: {}", id, err);
        }
        debug!("device {:?} freed", id);
        self.release_default_address(id);
    }

    fn abandon(&mut self, id: DeviceId, reason: impl fmt::Display) -> Step {
        warn!("device {:?}: enumeration abandoned: {}", id, reason);
        self.teardown(id);
        Step::Abandoned
    }

    /// Moves an enumerating device forward on the completion of its outstanding request.
    pub(crate) fn advance(&mut self, id: DeviceId, completion: &Completion, retries: u8) -> Step {
        let Ok(device) = self.device_mut(id) else {
            return Step::Abandoned;
        };
        let state = device.state;
        let needed = match state {
            EnumState::Attached => DeviceDescriptor8Byte::SIZE as u32,
            EnumState::ReadingDevice => DeviceDescriptor::SIZE as u32,
            EnumState::ReadingLanguage => 4,
            EnumState::ReadingConfigHeader => ConfigDescriptor::SIZE as u32,
            EnumState::ReadingConfig => u32::from(device.config.total_length),
            _ => 0,
        };

        if completion.status.is_err() || completion.actual < needed {
            device.retries += 1;
            if device.retries > retries {
                return self.abandon(id, "out of retries");
            }
            warn!(
                "device {:?}: {:?} failed ({:?}, {} of {} bytes), retry {}",
                id, state, completion.status, completion.actual, needed, device.retries
            );
            return match self.issue(id) {
                Ok(()) => Step::Continue,
                Err(err) => {
                    warn!("device {:?}: {}", id, err);
                    self.abandon(id, "retry not issued")
                }
            };
        }
        device.retries = 0;

        let control = device.control;
        match state {
            EnumState::Attached => {
                let short: DeviceDescriptor8Byte = read(&device.buf);
                let packet_size = short.packet_size;
                if !matches!(packet_size, 8 | 16 | 32 | 64) {
                    return self.abandon(id, "bad ep0 max packet size");
                }
                let Some(address) = self.addresses.alloc() else {
                    return self.abandon(id, Error::NoAddress);
                };
                if let Some(device) = self.devices.get_mut(id) {
                    device.address = address;
                    device.state = EnumState::SettingAddress;
                }
                if let Some(control) = control {
                    let _ = self.set_pipe_max_packet(control, u16::from(packet_size));
                }
            }
            EnumState::SettingAddress => {
                let address = device.address;
                device.state = EnumState::ReadingDevice;
                if let Some(control) = control {
                    let _ = self.set_pipe_address(control, address);
                }
                info!("device {:?} at address {}", id, address);
                self.release_default_address(id);
            }
            EnumState::ReadingDevice => {
                let descriptor: DeviceDescriptor = read(&device.buf);
                device.descriptor = descriptor;
                device.state = if descriptor.has_strings() {
                    EnumState::ReadingLanguage
                } else {
                    EnumState::ReadingConfigHeader
                };
            }
            EnumState::ReadingLanguage => {
                device.language = u16::from_le_bytes([device.buf[2], device.buf[3]]);
                device.state = EnumState::ReadingConfigHeader;
            }
            EnumState::ReadingConfigHeader => {
                let config: ConfigDescriptor = read(&device.buf);
                let total = usize::from(config.total_length);
                device.config = config;
                if total > ENUM_BUF {
                    return self.abandon(id, "configuration descriptor too large");
                }
                if total < ConfigDescriptor::SIZE {
                    return self.abandon(id, "configuration descriptor too short");
                }
                device.state = EnumState::ReadingConfig;
            }
            EnumState::ReadingConfig => device.state = EnumState::Configuring,
            EnumState::Configuring => {
                device.state = EnumState::Active;
                let descriptor = device.descriptor;
                let (vendor, product) = (descriptor.vendor, descriptor.product);
                info!(
                    "device {:?} ({:04x}:{:04x}) configured",
                    id, vendor, product
                );
                return Step::Active;
            }
            EnumState::Waiting | EnumState::Active | EnumState::Detaching => {
                return Step::Continue
            }
        }

        match self.issue(id) {
            Ok(()) => Step::Continue,
            Err(err) => {
                warn!("device {:?}: {}", id, err);
                self.abandon(id, "request not issued")
            }
        }
    }
}

impl<R: EhciRegs> UsbHost<R> {
    pub(crate) fn attach(&self, speed: Speed, hub_address: u8, hub_port: u8) -> Result<DeviceId> {
        let mut state = self.critical();
        state.check_running()?;

        let (tier, tt) = if hub_address == 0 {
            (1, (0, 0))
        } else {
            let parent = state
                .devices
                .iter()
                .map(|(_, device)| device)
                .find(|device| device.address == hub_address && device.state == EnumState::Active)
                .ok_or(Error::NoSuchDevice)?;
            let tt = if parent.speed == Speed::High {
                (hub_address, hub_port)
            } else {
                parent.tt
            };
            (parent.tier + 1, tt)
        };
        if tier > self.config.max_tier {
            return Err(Error::TooDeep(tier));
        }

        let id = state
            .devices
            .alloc(Device::new(speed, hub_address, hub_port, tt, tier))
            .ok_or(Error::ResourceExhausted(Resource::Devices))?;
        let control = match state.create_pipe(
            id,
            PipeType::Control,
            0,
            Direction::Out,
            speed.default_max_packet(),
            PipeCallback::Enumeration,
        ) {
            Ok(control) => control,
            Err(err) => {
                let _ = state.devices.free(id);
                return Err(err);
            }
        };
        if let Some(device) = state.devices.get_mut(id) {
            device.control = Some(control);
        }
        info!(
            "new {:?} speed device {:?} on hub {} port {}, tier {}",
            speed, id, hub_address, hub_port, tier
        );

        if state.default_address.is_none() {
            if let Some(device) = state.devices.get_mut(id) {
                device.state = EnumState::Attached;
            }
            state.default_address = Some(id);
            if let Err(err) = state.issue(id) {
                state.teardown(id);
                return Err(err);
            }
        } else {
            debug!("device {:?} waits for address 0", id);
        }
        Ok(id)
    }

    /// A completion on a default control pipe: an enumeration step, or a request a bound driver
    /// issued once the device is active.
    pub(crate) fn control_complete(&self, completion: Completion) {
        let device = completion.device;
        let state = self.critical().devices.get(device).map(Device::state);
        match state {
            Some(EnumState::Active) => self.hand_over(Parked::Control(completion)),
            Some(EnumState::Waiting) | Some(EnumState::Detaching) | None => {
                debug!("dropping control completion for device {:?}", device)
            }
            Some(_) => {
                let retries = self.config.enumeration_retries;
                let step = self.critical().advance(device, &completion, retries);
                if step == Step::Active {
                    self.claim_pass(device);
                }
            }
        }
    }

    /// Disconnects a device and everything attached below it.
    pub(crate) fn detach(&self, id: DeviceId) -> Result<()> {
        let children: SmallVec<[DeviceId; 8]> = {
            let mut state = self.critical();
            let address = state.device(id)?.address;
            let children = state
                .devices
                .iter()
                .filter(|(child, device)| {
                    address != 0
                        && *child != id
                        && device.hub_address == address
                        && device.state != EnumState::Detaching
                })
                .map(|(child, _)| child)
                .collect();
            state.device_mut(id)?.state = EnumState::Detaching;
            let parked = state.parked.len();
            state.parked.retain(|entry| entry.device() != id);
            let dropped = parked - state.parked.len();
            if dropped > 0 {
                debug!("device {:?}: dropped {} parked completions", id, dropped);
            }
            children
        };
        for child in children {
            if let Err(err) = self.detach(child) {
                warn!("device {:?}: child {:?}: {}", id, child, err);
            }
        }

        let drivers = self.critical().take_bound(id);
        for (_, driver) in drivers.iter() {
            self.lock_driver(&**driver).disconnect(self, id);
        }

        let mut state = self.critical();
        for (driver, _) in drivers {
            state.release_driver(driver);
        }
        state.teardown(id);
        info!("device {:?} disconnected", id);
        Ok(())
    }
}
