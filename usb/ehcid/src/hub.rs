//! USB 2.0 hub class driver (USB2 11).
//!
//! The driver powers every downstream port, then polls the hub's status change endpoint. A port
//! flagged there has its status read and each change acknowledged, then the port is acted on: a
//! new connection is reset, a finished reset becomes a new device, a lost connection disconnects
//! the device below. Requests on the hub's control pipe go out one at a time.

use log::{debug, error, info, warn};

use crate::config::DEFAULT_CONFIG;
use crate::driver_interface::{
    ClaimRequest, ClaimScope, Completion, DeviceId, Direction, DmaBuf, DriverId, PipeCallback,
    PipeId, PipeType, Setup, Speed, UsbBus, UsbDriver,
};
use crate::usb::{HubDescriptor, HubPortFeature, HubPortStatus, CLASS_HUB};

/// Downstream ports served per hub. Larger hubs have the rest left unpowered.
pub const MAX_HUB_PORTS: u8 = 15;

/// The hub's status change endpoint (USB2 11.12.1).
const STATUS_ENDPOINT: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Request {
    Descriptor,
    Power(u8),
    Status(u8),
    /// Acknowledging the changes of `status` still set in `remaining`, one per request.
    Clear {
        port: u8,
        status: HubPortStatus,
        remaining: HubPortStatus,
    },
    Reset(u8),
}

pub struct UsbHub {
    interval: u8,
    device: Option<DeviceId>,
    driver: Option<DriverId>,
    address: u8,
    control: Option<PipeId>,
    interrupt: Option<PipeId>,
    ports: u8,
    /// The request outstanding on the control pipe.
    request: Option<(Request, Setup)>,
    /// Ports reported by the status change endpoint and not looked at yet, bit n for port n.
    pending: u32,
    children: [Option<DeviceId>; MAX_HUB_PORTS as usize],
    control_mem: Box<[u8]>,
    status_mem: Box<[u8]>,
}

impl Default for UsbHub {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbHub {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_CONFIG.hub_interval)
    }

    /// A hub driver polling the status change endpoint every `interval` frames.
    pub fn with_interval(interval: u8) -> Self {
        Self {
            interval,
            device: None,
            driver: None,
            address: 0,
            control: None,
            interrupt: None,
            ports: 0,
            request: None,
            pending: 0,
            children: [None; MAX_HUB_PORTS as usize],
            control_mem: vec![0; HubDescriptor::MAX_SIZE].into_boxed_slice(),
            status_mem: vec![0; usize::from(MAX_HUB_PORTS) / 8 + 1].into_boxed_slice(),
        }
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    pub fn ports(&self) -> u8 {
        self.ports
    }

    /// The device attached below `port`, 1 based.
    pub fn child(&self, port: u8) -> Option<DeviceId> {
        *self.children.get(usize::from(port).checked_sub(1)?)?
    }

    fn control_buf(&mut self) -> DmaBuf {
        // The storage is owned by the driver and only reached through the completion while the
        // controller has it.
        unsafe { DmaBuf::from_raw(self.control_mem.as_mut_ptr(), self.control_mem.len()) }
    }

    fn status_buf(&mut self) -> DmaBuf {
        let len = usize::from(self.ports) / 8 + 1;
        unsafe { DmaBuf::from_raw(self.status_mem.as_mut_ptr(), len) }
    }

    fn submit(&mut self, bus: &dyn UsbBus, request: Request, setup: Setup) {
        let Some(control) = self.control else {
            return;
        };
        let buf = self.control_buf();
        match bus.control_transfer(control, &setup, buf) {
            Ok(()) => self.request = Some((request, setup)),
            Err(rejected) => warn!("hub {}: {:?} not sent: {}", self.address, request, rejected),
        }
    }

    fn arm(&mut self, bus: &dyn UsbBus, buf: DmaBuf) {
        let Some(interrupt) = self.interrupt else {
            return;
        };
        if let Err(rejected) = bus.new_transfer(interrupt, buf) {
            warn!("hub {}: status change endpoint not armed: {}", self.address, rejected);
        }
    }

    /// Starts on the next flagged port if the control pipe is free.
    fn kick(&mut self, bus: &dyn UsbBus) {
        if self.request.is_some() {
            return;
        }
        let Some(port) = (1..=self.ports).find(|port| self.pending & (1 << port) != 0) else {
            return;
        };
        self.pending &= !(1 << port);
        self.submit(bus, Request::Status(port), Setup::get_port_status(port));
    }

    fn open_status_pipe(&mut self, bus: &dyn UsbBus) {
        let (Some(device), Some(driver)) = (self.device, self.driver) else {
            return;
        };
        let max_packet = u16::from(self.ports) / 8 + 1;
        match bus.new_pipe(
            device,
            PipeType::Interrupt {
                interval: u16::from(self.interval),
            },
            STATUS_ENDPOINT,
            Direction::In,
            max_packet,
            PipeCallback::Driver(driver),
        ) {
            Ok(pipe) => {
                self.interrupt = Some(pipe);
                let buf = self.status_buf();
                self.arm(bus, buf);
                info!("hub {}: {} ports powered", self.address, self.ports);
            }
            Err(err) => error!("hub {}: failed to open status change pipe: {}", self.address, err),
        }
    }

    fn completed(&mut self, bus: &dyn UsbBus, request: Request, completion: &Completion) {
        if let Err(err) = completion.status {
            warn!("hub {}: {:?} failed: {}", self.address, request, err);
            if let Request::Descriptor = request {
                error!("hub {}: unusable without its descriptor", self.address);
                return;
            }
            self.kick(bus);
            return;
        }

        match request {
            Request::Descriptor => {
                let mut descriptor = HubDescriptor::default();
                if plain::copy_from_bytes(&mut descriptor, completion.data()).is_err() {
                    error!("hub {}: short hub descriptor", self.address);
                    return;
                }
                let ports = descriptor.ports;
                if ports > MAX_HUB_PORTS {
                    warn!(
                        "hub {}: {} ports, serving the first {}",
                        self.address, ports, MAX_HUB_PORTS
                    );
                }
                self.ports = ports.min(MAX_HUB_PORTS);
                if self.ports == 0 {
                    warn!("hub {}: no ports", self.address);
                    return;
                }
                self.power(bus, 1);
            }
            Request::Power(port) => {
                if port < self.ports {
                    self.power(bus, port + 1);
                } else {
                    self.open_status_pipe(bus);
                }
            }
            Request::Status(port) => {
                let mut bytes = [0; 4];
                let data = completion.data();
                if data.len() < bytes.len() {
                    warn!("hub {}: short status for port {}", self.address, port);
                    self.kick(bus);
                    return;
                }
                bytes.copy_from_slice(&data[..4]);
                let status = HubPortStatus::from_bytes(bytes);
                debug!("hub {}: port {} status {:?}", self.address, port, status);
                self.acknowledge(bus, port, status, status);
            }
            Request::Clear {
                port,
                status,
                remaining,
            } => self.acknowledge(bus, port, status, remaining),
            Request::Reset(_) => self.kick(bus),
        }
    }

    fn power(&mut self, bus: &dyn UsbBus, port: u8) {
        let setup = Setup::set_port_feature(HubPortFeature::PortPower as u16, port);
        self.submit(bus, Request::Power(port), setup);
    }

    /// Clears the next change still set in `remaining`, or acts on the port once none is left.
    fn acknowledge(
        &mut self,
        bus: &dyn UsbBus,
        port: u8,
        status: HubPortStatus,
        remaining: HubPortStatus,
    ) {
        match remaining.changes().next() {
            Some(feature) => {
                let remaining = remaining - HubPortStatus::from_bits_truncate(1 << feature as u32);
                let request = Request::Clear {
                    port,
                    status,
                    remaining,
                };
                let setup = Setup::clear_port_feature(feature as u16, port);
                self.submit(bus, request, setup);
            }
            None => self.act(bus, port, status),
        }
    }

    fn act(&mut self, bus: &dyn UsbBus, port: u8, status: HubPortStatus) {
        let index = usize::from(port - 1);
        let replugged = status.contains(HubPortStatus::CONNECTION_CHANGED);
        if !status.is_connected() || replugged {
            if let Some(child) = self.children[index].take() {
                info!("hub {}: port {} disconnected", self.address, port);
                if let Err(err) = bus.disconnect_device(child) {
                    warn!("hub {}: port {}: {}", self.address, port, err);
                }
            }
        }

        if status.is_connected() && self.children[index].is_none() {
            if !status.is_enabled() && !status.is_resetting() {
                debug!("hub {}: port {} connected, resetting", self.address, port);
                let setup = Setup::set_port_feature(HubPortFeature::PortReset as u16, port);
                self.submit(bus, Request::Reset(port), setup);
                return;
            }
            if status.is_enabled() {
                let speed = if status.contains(HubPortStatus::LOW_SPEED) {
                    Speed::Low
                } else if status.contains(HubPortStatus::HIGH_SPEED) {
                    Speed::High
                } else {
                    Speed::Full
                };
                info!("hub {}: port {} {:?} speed device", self.address, port, speed);
                match bus.new_device(speed, self.address, port) {
                    Ok(child) => self.children[index] = Some(child),
                    Err(err) => warn!("hub {}: port {}: {}", self.address, port, err),
                }
            }
        }
        self.kick(bus);
    }
}

impl UsbDriver for UsbHub {
    fn claim(&mut self, bus: &dyn UsbBus, request: &ClaimRequest) -> bool {
        if request.scope != ClaimScope::Device
            || request.info.class != CLASS_HUB
            || self.device.is_some()
        {
            return false;
        }
        self.device = Some(request.device);
        self.driver = Some(request.driver);
        self.address = request.info.address;
        self.control = Some(request.info.control_pipe);
        self.ports = 0;
        self.pending = 0;
        self.children = [None; MAX_HUB_PORTS as usize];

        let setup = Setup::get_hub_descriptor(HubDescriptor::MAX_SIZE as u16);
        self.submit(bus, Request::Descriptor, setup);
        info!("hub at address {} claimed", self.address);
        true
    }

    fn control(&mut self, bus: &dyn UsbBus, completion: &mut Completion) -> bool {
        let ours = match self.request {
            Some((_, setup)) => {
                Some(completion.device) == self.device && completion.setup == Some(setup)
            }
            None => false,
        };
        if !ours {
            return false;
        }
        if let Some((request, _)) = self.request.take() {
            self.completed(bus, request, completion);
        }
        true
    }

    fn transfer(&mut self, bus: &dyn UsbBus, mut completion: Completion) {
        if Some(completion.pipe) != self.interrupt {
            return;
        }
        match completion.status {
            Ok(()) => {
                let bitmap = completion
                    .data()
                    .iter()
                    .enumerate()
                    .fold(0u32, |bitmap, (i, byte)| bitmap | (u32::from(*byte) << (8 * i)));
                // Bit 0 is the hub itself.
                let ports = ((1u32 << (self.ports + 1)) - 1) & !1;
                self.pending |= bitmap & ports;
            }
            Err(err) => warn!("hub {}: status change endpoint: {}", self.address, err),
        }
        let buf = completion.take_buf();
        self.arm(bus, buf);
        self.kick(bus);
    }

    fn disconnect(&mut self, bus: &dyn UsbBus, device: DeviceId) {
        if self.device != Some(device) {
            return;
        }
        if let Some(interrupt) = self.interrupt.take() {
            if let Err(err) = bus.free_pipe(interrupt) {
                warn!("hub {}: {}", self.address, err);
            }
        }
        info!("hub at address {} gone", self.address);
        self.device = None;
        self.driver = None;
        self.control = None;
        self.request = None;
        self.pending = 0;
        self.children = [None; MAX_HUB_PORTS as usize];
    }
}
