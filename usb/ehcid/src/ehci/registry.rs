use std::result;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use smallvec::SmallVec;

use super::regs::EhciRegs;
use super::{try_lock_driver, HostState, UsbHost, MAX_DRIVERS};
use crate::driver_interface::{
    ClaimRequest, ClaimScope, Completion, DeviceId, DeviceInfo, DriverId, Error, Resource, Result,
    UsbDriver,
};
use crate::usb::{descriptors, DescriptorKind, InterfaceAssocDescriptor, InterfaceDescriptor};

pub type DriverRef = Arc<Mutex<dyn UsbDriver>>;

struct DriverSlot {
    driver: DriverRef,
    /// The device the driver is bound to.
    device: Option<DeviceId>,
    /// Next driver on the available list, or on the bound list of `device`.
    next: Option<DriverId>,
}

/// Registered drivers. A driver is on exactly one list: the available list, kept in registration
/// order, or the bound list of one device, kept in bind order.
#[derive(Default)]
pub struct Registry {
    slots: [Option<DriverSlot>; MAX_DRIVERS],
    available: Option<DriverId>,
}

impl Registry {
    fn slot(&self, id: DriverId) -> Option<&DriverSlot> {
        self.slots.get(id.index())?.as_ref()
    }

    fn slot_mut(&mut self, id: DriverId) -> Option<&mut DriverSlot> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub(crate) fn driver(&self, id: DriverId) -> Option<DriverRef> {
        self.slot(id).map(|slot| slot.driver.clone())
    }

    pub(crate) fn register(&mut self, driver: DriverRef) -> Result<DriverId> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ResourceExhausted(Resource::Drivers))?;
        self.slots[index] = Some(DriverSlot {
            driver,
            device: None,
            next: None,
        });
        let id = DriverId(index as u8);
        self.make_available(id);
        Ok(id)
    }

    /// Puts a driver back on the available list, at its registration position.
    fn make_available(&mut self, id: DriverId) {
        let mut pred = None;
        let mut cursor = self.available;
        while let Some(current) = cursor {
            if current.index() > id.index() {
                break;
            }
            pred = Some(current);
            cursor = self.slot(current).and_then(|slot| slot.next);
        }
        if let Some(slot) = self.slot_mut(id) {
            slot.device = None;
            slot.next = cursor;
        }
        match pred.and_then(|pred| self.slot_mut(pred)) {
            Some(pred) => pred.next = Some(id),
            None => self.available = Some(id),
        }
    }

    fn take_available(&mut self, id: DriverId) -> bool {
        let next = match self.slot(id) {
            Some(slot) if slot.device.is_none() => slot.next,
            _ => return false,
        };
        if self.available == Some(id) {
            self.available = next;
            return true;
        }
        let mut cursor = self.available;
        while let Some(current) = cursor {
            let Some(slot) = self.slot_mut(current) else {
                break;
            };
            if slot.next == Some(id) {
                slot.next = next;
                return true;
            }
            cursor = slot.next;
        }
        false
    }

    /// Drivers on the available list, in order.
    pub(crate) fn available(&self) -> SmallVec<[(DriverId, DriverRef); MAX_DRIVERS]> {
        let mut drivers = SmallVec::new();
        let mut cursor = self.available;
        while let Some(id) = cursor {
            let Some(slot) = self.slot(id) else {
                break;
            };
            drivers.push((id, slot.driver.clone()));
            cursor = slot.next;
        }
        drivers
    }

    /// Drivers on a bound list starting at `head`, in bind order.
    pub(crate) fn bound(&self, head: Option<DriverId>) -> SmallVec<[(DriverId, DriverRef); 4]> {
        let mut drivers = SmallVec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            let Some(slot) = self.slot(id) else {
                break;
            };
            drivers.push((id, slot.driver.clone()));
            cursor = slot.next;
        }
        drivers
    }

    pub(crate) fn bound_device(&self, id: DriverId) -> Option<DeviceId> {
        self.slot(id)?.device
    }
}

impl HostState {
    /// Moves a driver from the available list to the end of the device's bound list.
    fn bind(&mut self, id: DriverId, device_id: DeviceId) -> bool {
        let Ok(device) = self.device(device_id) else {
            return false;
        };
        let mut tail = None;
        let mut cursor = device.drivers;
        while let Some(current) = cursor {
            tail = Some(current);
            cursor = self.drivers.slot(current).and_then(|slot| slot.next);
        }
        if !self.drivers.take_available(id) {
            return false;
        }
        if let Some(slot) = self.drivers.slot_mut(id) {
            slot.device = Some(device_id);
            slot.next = None;
        }
        match tail.and_then(|tail| self.drivers.slot_mut(tail)) {
            Some(tail) => tail.next = Some(id),
            None => {
                if let Ok(device) = self.device_mut(device_id) {
                    device.drivers = Some(id);
                }
            }
        }
        true
    }

    /// Detaches the bound list of a device, for disconnect.
    pub(crate) fn take_bound(&mut self, device_id: DeviceId) -> SmallVec<[(DriverId, DriverRef); 4]> {
        let head = match self.devices.get_mut(device_id) {
            Some(device) => device.drivers.take(),
            None => return SmallVec::new(),
        };
        self.drivers.bound(head)
    }

    /// Returns a driver whose device went away to the available list.
    pub(crate) fn release_driver(&mut self, id: DriverId) {
        self.drivers.make_available(id);
    }
}

/// How a configuration descriptor splits into the groups offered to drivers, as `(scope, start,
/// end)` byte ranges.
///
/// An interface association descriptor starts a group that takes in every interface it covers.
/// Otherwise a group runs from an interface's default setting up to the next default setting,
/// so alternate settings, endpoints and class descriptors stay with their interface.
pub fn groupings(config: &[u8]) -> SmallVec<[(ClaimScope, usize, usize); 8]> {
    let mut groups: SmallVec<[(ClaimScope, usize, usize); 8]> = SmallVec::new();
    let mut current: Option<(ClaimScope, usize)> = None;
    let mut association: Option<InterfaceAssocDescriptor> = None;
    let mut offset = 0;

    for desc in descriptors(config) {
        let start = offset;
        offset += desc.bytes.len();

        let boundary = if desc.kind == DescriptorKind::InterfaceAssociation as u8 {
            association = desc.parse();
            Some(ClaimScope::InterfaceAssociation)
        } else if desc.kind == DescriptorKind::Interface as u8 {
            match desc.parse::<InterfaceDescriptor>() {
                Some(interface) if interface.alternate_setting == 0 => {
                    let number = interface.number;
                    let inside = current.map_or(false, |(scope, _)| {
                        scope == ClaimScope::InterfaceAssociation
                    }) && association.map_or(false, |iad| iad.covers(number));
                    if inside {
                        None
                    } else {
                        association = None;
                        Some(ClaimScope::Interface)
                    }
                }
                _ => None,
            }
        } else {
            None
        };

        if let Some(scope) = boundary {
            if let Some((scope, begin)) = current.take() {
                groups.push((scope, begin, start));
            }
            current = Some((scope, start));
        }
    }
    if let Some((scope, begin)) = current {
        groups.push((scope, begin, offset));
    }
    groups
}

impl<R: EhciRegs> UsbHost<R> {
    pub fn register_driver(&self, driver: DriverRef) -> Result<DriverId> {
        let id = self.critical().drivers.register(driver)?;
        debug!("registered driver {:?}", id);
        Ok(id)
    }

    /// The device a driver is bound to, if any.
    pub fn bound_device(&self, id: DriverId) -> Option<DeviceId> {
        self.critical().drivers.bound_device(id)
    }

    /// Drivers waiting for a device, in the order they are offered one.
    pub fn available_drivers(&self) -> Vec<DriverId> {
        self.critical()
            .drivers
            .available()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Offers a newly configured device to the available drivers: the whole device first, then
    /// each interface group of its configuration.
    pub(crate) fn claim_pass(&self, device: DeviceId) {
        let (info, device_descriptor, config) = {
            let state = self.critical();
            let Ok(dev) = state.device(device) else {
                return;
            };
            let Some(info) = dev.info() else {
                return;
            };
            (
                info,
                dev.descriptor.as_bytes().to_vec(),
                dev.config_bytes().to_vec(),
            )
        };

        if self.offer(device, info, ClaimScope::Device, &device_descriptor) {
            return;
        }
        let mut claimed = 0;
        for (scope, start, end) in groupings(&config) {
            if self.offer(device, info, scope, &config[start..end]) {
                claimed += 1;
            }
        }
        if claimed == 0 {
            info!(
                "device {:?} ({:04x}:{:04x}) has no driver",
                device, info.vendor, info.product
            );
        }
    }

    /// Offers one scope to each available driver in turn; the first to accept is bound.
    fn offer(
        &self,
        device: DeviceId,
        info: DeviceInfo,
        scope: ClaimScope,
        descriptors: &[u8],
    ) -> bool {
        let candidates = self.critical().drivers.available();
        for (id, driver) in candidates {
            let request = ClaimRequest {
                driver: id,
                device,
                info,
                scope,
                descriptors,
            };
            // Bind before asking, so that a driver opening pipes from claim already owns the
            // device; undo if it declines.
            if !self.critical().bind(id, device) {
                continue;
            }
            let claimed = self.lock_driver(&*driver).claim(self, &request);
            if claimed {
                info!("driver {:?} claimed device {:?} at {:?} scope", id, device, scope);
                return true;
            }
            self.critical().unbind(id, device);
        }
        false
    }

    /// Routes a completion on an active device's control pipe to its drivers in bind order.
    /// Nothing is offered while any of them is locked; the completion comes back instead.
    pub(crate) fn route_control(&self, mut completion: Completion) -> result::Result<(), Completion> {
        let drivers = {
            let state = self.critical();
            match state.devices.get(completion.device) {
                Some(device) => state.drivers.bound(device.drivers),
                None => return Ok(()),
            }
        };
        let mut guards: SmallVec<[_; 4]> = SmallVec::new();
        for (_, driver) in drivers.iter() {
            match try_lock_driver(&**driver) {
                Some(guard) => guards.push(guard),
                None => return Err(completion),
            }
        }
        for guard in guards.iter_mut() {
            if guard.control(self, &mut completion) {
                return Ok(());
            }
        }
        warn!(
            "unhandled control completion on device {:?}: {:?}",
            completion.device, completion.setup
        );
        Ok(())
    }
}

impl HostState {
    /// Takes a driver that declined back off the device's bound list.
    fn unbind(&mut self, id: DriverId, device_id: DeviceId) {
        let next = self.drivers.slot(id).and_then(|slot| slot.next);
        let head = self.devices.get(device_id).and_then(|device| device.drivers);
        if head == Some(id) {
            if let Some(device) = self.devices.get_mut(device_id) {
                device.drivers = next;
            }
        } else {
            let mut cursor = head;
            while let Some(current) = cursor {
                let Some(slot) = self.drivers.slot_mut(current) else {
                    break;
                };
                if slot.next == Some(id) {
                    slot.next = next;
                    break;
                }
                cursor = slot.next;
            }
        }
        self.drivers.make_available(id);
    }
}
