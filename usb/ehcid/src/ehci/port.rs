//! Root port handling.
//!
//! A new connection is reset right away. The controller clears PR itself once the reset is over
//! and raises a port change with the port enabled, which is when the device is handed to
//! enumeration. Hubs downstream report their own ports through the hub driver.

use log::{debug, info, warn};

use super::regs::{EhciRegs, PortSc};
use super::{HostState, UsbHost, MAX_ROOT_PORTS};
use crate::driver_interface::{DeviceId, Speed};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PortState {
    #[default]
    Idle,
    Resetting,
    Enabled,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RootPort {
    pub(crate) state: PortState,
    pub(crate) device: Option<DeviceId>,
}

impl RootPort {
    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PortAction {
    Reset,
    Attach(Speed),
    Detach(DeviceId),
}

impl HostState {
    fn port_actions(&mut self, port: u8, portsc: PortSc, speed: Speed) -> [Option<PortAction>; 2] {
        let entry = &mut self.ports[usize::from(port)];
        let connected = portsc.contains(PortSc::CCS);
        let mut actions = [None, None];

        // A connect change with a device still recorded is a replug: drop the old one first.
        if !connected || portsc.contains(PortSc::CSC) {
            if let Some(device) = entry.device.take() {
                actions[0] = Some(PortAction::Detach(device));
            }
            if entry.state != PortState::Resetting || !connected {
                entry.state = PortState::Idle;
            }
        }
        if !connected {
            return actions;
        }

        actions[1] = match entry.state {
            PortState::Idle => {
                entry.state = PortState::Resetting;
                Some(PortAction::Reset)
            }
            PortState::Resetting
                if portsc.contains(PortSc::PE) && !portsc.contains(PortSc::PR) =>
            {
                entry.state = PortState::Enabled;
                Some(PortAction::Attach(speed))
            }
            PortState::Resetting | PortState::Enabled => None,
        };
        actions
    }
}

impl<R: EhciRegs> UsbHost<R> {
    /// Handles a port change interrupt: acknowledges every root port's change bits and acts on
    /// connects, finished resets and disconnects.
    pub(crate) fn port_change(&self) {
        let ports = self.regs.port_count().min(MAX_ROOT_PORTS as u8);
        for port in 0..ports {
            let raw = self.regs.read_port(port);
            let portsc = PortSc::from_bits_truncate(raw);
            let changes = portsc & PortSc::CHANGE_BITS;
            if !changes.is_empty() {
                self.regs
                    .write_port(port, portsc.preserving() | changes.bits());
            }
            if portsc.contains(PortSc::OCC) {
                warn!("root port {}: over-current", port);
            }

            let speed = self.regs.port_speed(raw);
            let actions = self.critical().port_actions(port, portsc, speed);
            for action in actions.iter().flatten().copied() {
                self.port_action(port, portsc, action);
            }
        }
    }

    fn port_action(&self, port: u8, portsc: PortSc, action: PortAction) {
        match action {
            PortAction::Reset => {
                debug!("root port {}: connect, resetting", port);
                let value = (portsc - PortSc::PE).preserving() | PortSc::PR.bits();
                self.regs.write_port(port, value);
            }
            PortAction::Attach(speed) => {
                info!("root port {}: {:?} speed device enabled", port, speed);
                match self.attach(speed, 0, 0) {
                    Ok(device) => self.critical().ports[usize::from(port)].device = Some(device),
                    Err(err) => warn!("root port {}: {}", port, err),
                }
            }
            PortAction::Detach(device) => {
                info!("root port {}: disconnect", port);
                if let Err(err) = self.detach(device) {
                    warn!("root port {}: {}", port, err);
                }
            }
        }
    }

    pub fn root_port(&self, port: u8) -> Option<RootPort> {
        self.critical().ports.get(usize::from(port)).copied()
    }
}
