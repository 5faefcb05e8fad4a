//! A software EHCI controller for tests.
//!
//! [SimRegs] is a register file with the hardware side effects the host core relies on: write
//! one to clear status bits, self clearing reset, the doorbell and port resets. [Sim::step]
//! plays one frame: it walks the async ring and the frame's periodic slot through the queue
//! heads' horizontal links, executes active qTDs against fake devices and raises the interrupt.

use std::collections::VecDeque;
use std::pin::Pin;
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::qtd::{
    LINK_TERMINATE, QTD_TOKEN_ACTIVE, QTD_TOKEN_BYTES_MASK, QTD_TOKEN_BYTES_SHIFT,
    QTD_TOKEN_HALTED, QTD_TOKEN_IOC, QTD_TOKEN_PID_MASK, QTD_TOKEN_PID_SHIFT, QTD_TOKEN_XACT_ERROR,
};
use super::regs::{EhciRegs, OpReg, PortSc, UsbCmd, UsbSts, PORTSC_PSPD_MASK, PORTSC_PSPD_SHIFT};
use super::transfer::{Stage, TransferId};
use super::{HostState, UsbHost, MAX_PIPES, MAX_TRANSFERS};
use crate::config::HostConfig;
use crate::driver_interface::{PipeId, Speed};
use crate::usb::{HubPortStatus, Setup};
use common::io::Io;

const PID_OUT: u32 = 0;
const PID_IN: u32 = 1;

struct RegFile {
    cmd: u32,
    sts: u32,
    intr: u32,
    frindex: u32,
    ctrl_ds_segment: u32,
    periodic_list_base: u32,
    async_list_addr: u32,
    config_flag: u32,
    ports: Vec<u32>,
    stuck_in_reset: bool,
}

impl RegFile {
    fn new(ports: u8) -> Self {
        Self {
            cmd: 0,
            sts: UsbSts::HCHALTED.bits(),
            intr: 0,
            frindex: 0,
            ctrl_ds_segment: 0,
            periodic_list_base: 0,
            async_list_addr: 0,
            config_flag: 0,
            ports: vec![0; usize::from(ports)],
            stuck_in_reset: false,
        }
    }
}

#[derive(Clone)]
pub(crate) struct SimRegs(Arc<Mutex<RegFile>>);

impl SimRegs {
    fn new(ports: u8) -> Self {
        Self(Arc::new(Mutex::new(RegFile::new(ports))))
    }

    fn lock(&self) -> MutexGuard<'_, RegFile> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EhciRegs for SimRegs {
    fn read(&self, reg: OpReg) -> u32 {
        let regs = self.lock();
        match reg {
            OpReg::UsbCmd => regs.cmd,
            OpReg::UsbSts => regs.sts,
            OpReg::UsbIntr => regs.intr,
            OpReg::FrIndex => regs.frindex,
            OpReg::CtrlDsSegment => regs.ctrl_ds_segment,
            OpReg::PeriodicListBase => regs.periodic_list_base,
            OpReg::AsyncListAddr => regs.async_list_addr,
            OpReg::ConfigFlag => regs.config_flag,
        }
    }

    fn write(&self, reg: OpReg, value: u32) {
        let mut regs = self.lock();
        match reg {
            OpReg::UsbCmd => {
                if value & UsbCmd::HCRESET.bits() != 0 && !regs.stuck_in_reset {
                    regs.cmd = 0x0008_0000;
                    regs.sts = UsbSts::HCHALTED.bits();
                    regs.intr = 0;
                    regs.frindex = 0;
                    regs.config_flag = 0;
                } else {
                    regs.cmd = value;
                    if value & UsbCmd::RS.bits() == 0 {
                        regs.sts |= UsbSts::HCHALTED.bits();
                    } else {
                        regs.sts &= !UsbSts::HCHALTED.bits();
                    }
                }
            }
            OpReg::UsbSts => regs.sts &= !(value & 0x3F),
            OpReg::UsbIntr => regs.intr = value,
            OpReg::FrIndex => regs.frindex = value & 0x3FFF,
            OpReg::CtrlDsSegment => regs.ctrl_ds_segment = value,
            OpReg::PeriodicListBase => regs.periodic_list_base = value,
            OpReg::AsyncListAddr => regs.async_list_addr = value,
            OpReg::ConfigFlag => regs.config_flag = value,
        }
    }

    fn port_count(&self) -> u8 {
        self.lock().ports.len() as u8
    }

    fn read_port(&self, port: u8) -> u32 {
        self.lock().ports[usize::from(port)]
    }

    fn write_port(&self, port: u8, value: u32) {
        let mut regs = self.lock();
        let old = regs.ports[usize::from(port)];
        let rw = (PortSc::PR | PortSc::PP | PortSc::SUSPEND | PortSc::FPR | PortSc::PO).bits();
        let mut new = old & !(value & PortSc::CHANGE_BITS.bits());
        new = (new & !rw) | (value & rw);
        // Software can disable a port, never enable one.
        if value & PortSc::PE.bits() == 0 {
            new &= !PortSc::PE.bits();
        }
        regs.ports[usize::from(port)] = new;
    }
}

enum Outcome {
    Done(usize),
    Nak,
    Stall,
}

#[derive(Clone, Debug, Default)]
struct Control {
    setup: Setup,
    response: Vec<u8>,
    sent: usize,
    stall: bool,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct FakePort {
    status: u16,
    change: u16,
    device: Option<Box<FakeDevice>>,
}

#[derive(Clone, Debug)]
pub(crate) struct FakeHub {
    ports: Vec<FakePort>,
}

impl FakeHub {
    fn port(&mut self, port: u16) -> Option<&mut FakePort> {
        self.ports.get_mut(usize::from(port).checked_sub(1)?)
    }

    fn bitmap(&self) -> u32 {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, port)| port.change != 0)
            .fold(0, |bitmap, (i, _)| bitmap | (1 << (i + 1)))
    }

    fn set_feature(&mut self, port: u16, feature: u16) {
        let Some(port) = self.port(port) else {
            return;
        };
        let status = HubPortStatus::from_bits_truncate(u32::from(port.status));
        match feature {
            8 => {
                port.status |= HubPortStatus::POWER.bits() as u16;
                if port.device.is_some() && !status.is_connected() {
                    port.status |= HubPortStatus::CONNECTION.bits() as u16;
                    port.change |= 1;
                }
            }
            4 => {
                let Some(device) = port.device.as_mut() else {
                    return;
                };
                let speed = match device.speed {
                    Speed::Low => HubPortStatus::LOW_SPEED,
                    Speed::High => HubPortStatus::HIGH_SPEED,
                    Speed::Full => HubPortStatus::empty(),
                };
                device.address = 0;
                device.configured = 0;
                port.status |= (HubPortStatus::ENABLE | speed).bits() as u16;
                port.change |= (HubPortStatus::RESET_CHANGED.bits() >> 16) as u16;
            }
            _ => (),
        }
    }

    fn clear_feature(&mut self, port: u16, feature: u16) {
        let Some(port) = self.port(port) else {
            return;
        };
        match feature {
            1 => port.status &= !(HubPortStatus::ENABLE.bits() as u16),
            16..=20 => port.change &= !(1 << (feature - 16)),
            _ => (),
        }
    }
}

/// A device answering chapter 9 requests from canned descriptors.
#[derive(Clone, Debug)]
pub(crate) struct FakeDevice {
    pub(crate) speed: Speed,
    pub(crate) address: u8,
    pub(crate) configured: u8,
    /// Every SETUP packet received, in order.
    pub(crate) requests: Vec<Setup>,
    /// Bytes received on OUT endpoints.
    pub(crate) received: Vec<u8>,
    descriptor: [u8; 18],
    config: Vec<u8>,
    /// Answers for IN endpoints, one per transaction. NAK while empty.
    responses: VecDeque<Vec<u8>>,
    stalls: u32,
    control: Option<Control>,
    hub: Option<FakeHub>,
}

impl FakeDevice {
    /// A device with one interface of `class` and no endpoints.
    pub(crate) fn new(speed: Speed, class: u8) -> Self {
        let packet_size = speed.default_max_packet() as u8;
        let descriptor = [
            18, 1, 0x00, 0x02, class, 0, 0, packet_size, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0,
            0, 0, 1,
        ];
        let interface = [9, 4, 0, 0, 0, class, 0, 0, 0];
        Self {
            speed,
            address: 0,
            configured: 0,
            requests: Vec::new(),
            received: Vec::new(),
            descriptor,
            config: Vec::new(),
            responses: VecDeque::new(),
            stalls: 0,
            control: None,
            hub: None,
        }
        .with_interfaces(&interface)
    }

    /// A high speed hub with `ports` downstream ports and its status change endpoint.
    pub(crate) fn hub(ports: u8) -> Self {
        let mut hub = Self::new(Speed::High, 9).with_interfaces(&[
            9, 4, 0, 0, 1, 9, 0, 0, 0, //
            7, 5, 0x81, 3, 1, 0, 12,
        ]);
        hub.descriptor[6] = 1;
        hub.hub = Some(FakeHub {
            ports: vec![FakePort::default(); usize::from(ports)],
        });
        hub
    }

    /// Replaces everything after the configuration header.
    pub(crate) fn with_interfaces(mut self, interfaces: &[u8]) -> Self {
        let total = (9 + interfaces.len()) as u16;
        let count = interface_count(interfaces);
        let [low, high] = total.to_le_bytes();
        self.config = vec![9, 2, low, high, count, 1, 0, 0x80, 50];
        self.config.extend_from_slice(interfaces);
        self
    }

    /// Claims a configuration descriptor length other than what is actually sent.
    pub(crate) fn with_config_length(mut self, total: u16) -> Self {
        let [low, high] = total.to_le_bytes();
        self.config[2] = low;
        self.config[3] = high;
        self
    }

    pub(crate) fn with_strings(mut self) -> Self {
        self.descriptor[14] = 1;
        self
    }

    /// Stalls the next `count` control requests.
    pub(crate) fn stalling(mut self, count: u32) -> Self {
        self.stalls = count;
        self
    }

    pub(crate) fn respond_with(mut self, data: &[u8]) -> Self {
        self.responses.push_back(data.to_vec());
        self
    }

    fn respond(&self, setup: &Setup) -> Option<Vec<u8>> {
        let (kind, request, value, index) = (setup.kind, setup.request, setup.value, setup.index);
        let hub = self.hub.as_ref();
        let mut data = match (kind, request) {
            (0x80, 6) => match value >> 8 {
                1 => self.descriptor.to_vec(),
                2 => self.config.clone(),
                3 if value & 0xFF == 0 => vec![4, 3, 0x09, 0x04],
                3 => vec![4, 3, b'x', 0],
                _ => return None,
            },
            (0x80, 0) => vec![1, 0],
            (0xA0, 6) if value >> 8 == 0x29 => {
                let ports = hub?.ports.len() as u8;
                vec![9, 0x29, ports, 0, 0, 50, 0, 0, 0xFF]
            }
            (0xA0, 0) if hub.is_some() => vec![0; 4],
            (0xA3, 0) => {
                let port = hub?.ports.get(usize::from(index).checked_sub(1)?)?;
                let [s0, s1] = port.status.to_le_bytes();
                let [c0, c1] = port.change.to_le_bytes();
                vec![s0, s1, c0, c1]
            }
            (kind, _) if kind & 0x80 == 0 => Vec::new(),
            _ => return None,
        };
        data.truncate(usize::from(setup.length));
        Some(data)
    }

    fn finish(&mut self, setup: &Setup) {
        let (kind, request, value, index) = (setup.kind, setup.request, setup.value, setup.index);
        match (kind, request) {
            (0x00, 5) => self.address = value as u8,
            (0x00, 9) => self.configured = value as u8,
            (0x23, 3) => {
                if let Some(hub) = self.hub.as_mut() {
                    hub.set_feature(index, value);
                }
            }
            (0x23, 1) => {
                if let Some(hub) = self.hub.as_mut() {
                    hub.clear_feature(index, value);
                }
            }
            _ => (),
        }
    }

    fn transact(&mut self, endpoint: u8, stage: Stage, pid: u32, data: &mut [u8]) -> Outcome {
        match stage {
            Stage::Setup => {
                let mut bytes = [0; 8];
                bytes.copy_from_slice(&data[..8]);
                let setup = Setup::from_bytes(&bytes);
                self.requests.push(setup);
                let stall = if self.stalls > 0 {
                    self.stalls -= 1;
                    true
                } else {
                    false
                };
                let response = self.respond(&setup);
                self.control = Some(Control {
                    setup,
                    stall: stall || response.is_none(),
                    response: response.unwrap_or_default(),
                    sent: 0,
                });
                Outcome::Done(8)
            }
            Stage::Data => match self.control.as_mut() {
                Some(control) if !control.stall => {
                    if pid == PID_IN {
                        let n = (control.response.len() - control.sent).min(data.len());
                        data[..n].copy_from_slice(&control.response[control.sent..control.sent + n]);
                        control.sent += n;
                        Outcome::Done(n)
                    } else {
                        Outcome::Done(data.len())
                    }
                }
                _ => Outcome::Stall,
            },
            Stage::Status => match self.control.take() {
                Some(control) if !control.stall => {
                    self.finish(&control.setup);
                    Outcome::Done(0)
                }
                _ => Outcome::Stall,
            },
            Stage::Normal if endpoint == 0 => Outcome::Stall,
            Stage::Normal if pid == PID_OUT => {
                self.received.extend_from_slice(data);
                Outcome::Done(data.len())
            }
            Stage::Normal => {
                let response = match self.hub.as_ref() {
                    Some(hub) => match hub.bitmap() {
                        0 => None,
                        bitmap => Some(bitmap.to_le_bytes()[..(hub.ports.len() + 8) / 8].to_vec()),
                    },
                    None => self.responses.pop_front(),
                };
                match response {
                    Some(response) => {
                        let n = response.len().min(data.len());
                        data[..n].copy_from_slice(&response[..n]);
                        Outcome::Done(n)
                    }
                    None => Outcome::Nak,
                }
            }
        }
    }

    fn find(&mut self, address: u8) -> Option<&mut FakeDevice> {
        if self.address == address {
            return Some(self);
        }
        let hub = self.hub.as_mut()?;
        for port in hub.ports.iter_mut() {
            if port.status & HubPortStatus::ENABLE.bits() as u16 == 0 {
                continue;
            }
            if let Some(found) = port.device.as_deref_mut().and_then(|child| child.find(address)) {
                return Some(found);
            }
        }
        None
    }
}

/// Interface descriptors with alternate setting 0 in a descriptor list.
fn interface_count(bytes: &[u8]) -> u8 {
    let mut count = 0;
    let mut offset = 0;
    while offset + 3 < bytes.len() {
        if bytes[offset + 1] == 4 && bytes[offset + 3] == 0 {
            count += 1;
        }
        offset += usize::from(bytes[offset].max(1));
    }
    count
}

struct World {
    roots: Vec<Option<FakeDevice>>,
}

impl World {
    /// The device answering at `address`, among those reachable through enabled ports.
    fn find(&mut self, address: u8, enabled: u32) -> Option<&mut FakeDevice> {
        for (i, root) in self.roots.iter_mut().enumerate() {
            if enabled & (1 << i) == 0 {
                continue;
            }
            if let Some(found) = root.as_mut().and_then(|root| root.find(address)) {
                return Some(found);
            }
        }
        None
    }
}

pub(crate) struct Sim {
    regs: SimRegs,
    world: Mutex<World>,
    host: Pin<Box<UsbHost<SimRegs>>>,
}

impl Sim {
    /// A started host on a controller with `ports` root ports.
    pub(crate) fn new(ports: u8) -> Self {
        Self::with_config(ports, HostConfig::default())
    }

    pub(crate) fn with_config(ports: u8, config: HostConfig) -> Self {
        let regs = SimRegs::new(ports);
        let host = Box::pin(UsbHost::new(regs.clone(), config));
        host.as_ref().begin().unwrap();
        Self {
            regs,
            world: Mutex::new(World {
                roots: vec![None; usize::from(ports)],
            }),
            host,
        }
    }

    pub(crate) fn host(&self) -> &UsbHost<SimRegs> {
        self.host.as_ref().get_ref()
    }

    /// Another handle on the same register file.
    pub(crate) fn regs(&self) -> SimRegs {
        self.regs.clone()
    }

    /// Makes HCRESET stick, as on a controller that never finishes its reset.
    pub(crate) fn stuck_in_reset(&self) {
        self.regs.lock().stuck_in_reset = true;
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn plug(&self, port: u8, device: FakeDevice) {
        let speed = device.speed as u32;
        self.world().roots[usize::from(port)] = Some(device);
        let mut regs = self.regs.lock();
        let portsc = &mut regs.ports[usize::from(port)];
        *portsc = (*portsc & !PORTSC_PSPD_MASK)
            | (PortSc::CCS | PortSc::CSC).bits()
            | (speed << PORTSC_PSPD_SHIFT);
        regs.sts |= UsbSts::PCD.bits();
    }

    pub(crate) fn unplug(&self, port: u8) {
        self.world().roots[usize::from(port)] = None;
        let mut regs = self.regs.lock();
        let portsc = &mut regs.ports[usize::from(port)];
        *portsc &= !(PORTSC_PSPD_MASK | (PortSc::CCS | PortSc::PE).bits());
        *portsc |= (PortSc::CSC | PortSc::PEC).bits();
        regs.sts |= UsbSts::PCD.bits();
    }

    /// Connects a device to port `port` (1 based) of the hub at `hub_address`.
    pub(crate) fn plug_hub_port(&self, hub_address: u8, port: u16, device: FakeDevice) {
        let mut world = self.world();
        let Some(hub) = world.find(hub_address, u32::MAX).and_then(|hub| hub.hub.as_mut()) else {
            panic!("no hub at address {}", hub_address);
        };
        let Some(port) = hub.port(port) else {
            panic!("hub {} has no port {}", hub_address, port);
        };
        port.device = Some(Box::new(device));
        if port.status & HubPortStatus::POWER.bits() as u16 != 0 {
            port.status |= HubPortStatus::CONNECTION.bits() as u16;
            port.change |= 1;
        }
    }

    pub(crate) fn unplug_hub_port(&self, hub_address: u8, port: u16) {
        let mut world = self.world();
        let Some(port) = world
            .find(hub_address, u32::MAX)
            .and_then(|hub| hub.hub.as_mut())
            .and_then(|hub| hub.port(port))
        else {
            panic!("no hub port {} at address {}", port, hub_address);
        };
        port.device = None;
        let gone = HubPortStatus::CONNECTION
            | HubPortStatus::ENABLE
            | HubPortStatus::LOW_SPEED
            | HubPortStatus::HIGH_SPEED;
        port.status &= !(gone.bits() as u16);
        port.change |= 1;
    }

    /// A snapshot of the device answering at `address`.
    pub(crate) fn fake(&self, address: u8) -> Option<FakeDevice> {
        self.world().find(address, u32::MAX).cloned()
    }

    pub(crate) fn run(&self, frames: usize) {
        for _ in 0..frames {
            self.step();
        }
    }

    /// One frame of controller work, then the interrupt handler if anything is pending.
    pub(crate) fn step(&self) {
        if let Some(status) = self.frame() {
            self.regs.lock().sts |= status;
        }
        let pending = {
            let regs = self.regs.lock();
            regs.sts & regs.intr & 0x3F
        };
        if pending != 0 {
            self.host().isr();
        }
    }

    fn frame(&self) -> Option<u32> {
        let (cmd, frame, enabled) = {
            let mut guard = self.regs.lock();
            let regs = &mut *guard;
            if regs.cmd & UsbCmd::RS.bits() == 0 {
                return None;
            }
            regs.frindex = (regs.frindex + 8) & 0x3FFF;
            if regs.cmd & UsbCmd::IAAD.bits() != 0 {
                regs.cmd &= !UsbCmd::IAAD.bits();
                regs.sts |= UsbSts::IAA.bits();
            }
            let mut enabled = 0;
            for (i, portsc) in regs.ports.iter_mut().enumerate() {
                if *portsc & PortSc::PR.bits() != 0 {
                    *portsc &= !PortSc::PR.bits();
                    if *portsc & PortSc::CCS.bits() != 0 {
                        *portsc |= PortSc::PE.bits();
                    }
                    regs.sts |= UsbSts::PCD.bits();
                }
                if *portsc & PortSc::PE.bits() != 0 {
                    enabled |= 1 << i;
                }
            }
            (regs.cmd, regs.frindex >> 3, enabled)
        };

        let mut state = self.host.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut world = self.world();
        let mut status = 0;
        if cmd & UsbCmd::ASE.bits() != 0 {
            for pipe in async_schedule(&state) {
                status |= execute(&mut state, &mut world, pipe, enabled, false);
            }
        }
        if cmd & UsbCmd::PSE.bits() != 0 {
            for pipe in periodic_schedule(&state, frame) {
                status |= execute(&mut state, &mut world, pipe, enabled, true);
            }
        }
        Some(status)
    }
}

fn pipe_at(state: &HostState, link: u32) -> Option<PipeId> {
    let phys = link & !0x1F;
    state
        .pipes
        .iter()
        .find(|(_, pipe)| pipe.qh.phys() == phys)
        .map(|(id, _)| id)
}

fn transfer_at(state: &HostState, link: u32) -> Option<TransferId> {
    state
        .transfers
        .iter()
        .find(|(_, transfer)| transfer.qtd.phys() == link)
        .map(|(id, _)| id)
}

/// The queue heads reachable from the reclamation head, in ring order.
fn async_schedule(state: &HostState) -> Vec<PipeId> {
    let head = state.async_head.phys();
    let mut pipes = Vec::new();
    let mut link = state.async_head.horizontal.read();
    while link & !0x1F != head && pipes.len() <= MAX_PIPES {
        let Some(pipe) = pipe_at(state, link) else {
            panic!("async ring links to unknown queue head {:#x}", link);
        };
        pipes.push(pipe);
        link = state.pipes.get(pipe).map_or(head, |pipe| pipe.qh.horizontal.read());
    }
    pipes
}

fn periodic_schedule(state: &HostState, frame: u32) -> Vec<PipeId> {
    let slot = frame as usize % state.periodic.0.len();
    let mut pipes = Vec::new();
    let mut link = state.periodic.0[slot].read();
    while link & LINK_TERMINATE == 0 && pipes.len() <= MAX_PIPES {
        let Some(pipe) = pipe_at(state, link) else {
            panic!("frame {} links to unknown queue head {:#x}", slot, link);
        };
        pipes.push(pipe);
        link = state
            .pipes
            .get(pipe)
            .map_or(LINK_TERMINATE, |pipe| pipe.qh.horizontal.read());
    }
    pipes
}

/// Where the data of a qTD lives: the chain's buffer, found through its last element, at the
/// offset the qTD's first page pointer has from the buffer's bus address.
fn data_ptr(state: &HostState, id: TransferId) -> Option<*mut u8> {
    let mut last = id;
    while let Some(next) = state.transfers.get(last)?.chain_next {
        last = next;
    }
    let buf = state.transfers.get(last)?.buf.as_ref()?;
    let offset = state.transfers.get(id)?.qtd.buffer[0]
        .read()
        .wrapping_sub(buf.phys()) as usize;
    Some(unsafe { buf.as_ptr().add(offset) })
}

/// Runs a queue head until it NAKs, halts or reaches its halt qTD. Periodic heads get one
/// transaction per frame. Returns the USBSTS bits raised.
fn execute(
    state: &mut HostState,
    world: &mut World,
    pipe: PipeId,
    enabled: u32,
    periodic: bool,
) -> u32 {
    let mut status = 0;
    for _ in 0..MAX_TRANSFERS {
        let Some(qh) = state.pipes.get(pipe).map(|pipe| &pipe.qh) else {
            break;
        };
        let (address, endpoint, next) = (qh.address(), qh.endpoint(), qh.next.read());
        if qh.is_halted() || next & LINK_TERMINATE != 0 {
            break;
        }
        let Some(id) = transfer_at(state, next) else {
            panic!("queue head links to unknown qTD {:#x}", next);
        };
        let Some(transfer) = state.transfers.get(id) else {
            break;
        };
        let token = transfer.qtd.token.read();
        if token & QTD_TOKEN_ACTIVE == 0 {
            break;
        }
        let len = ((token & QTD_TOKEN_BYTES_MASK) >> QTD_TOKEN_BYTES_SHIFT) as usize;
        let pid = (token & QTD_TOKEN_PID_MASK) >> QTD_TOKEN_PID_SHIFT;
        let stage = transfer.stage;
        let (qtd_next, alt_next) = (transfer.qtd.next.read(), transfer.qtd.alt_next.read());

        let ptr = if len > 0 && stage != Stage::Setup {
            data_ptr(state, id)
        } else {
            None
        };
        let mut data = match (stage, ptr) {
            (Stage::Setup, _) => transfer.setup.to_vec(),
            (_, Some(ptr)) if pid == PID_OUT => unsafe { slice::from_raw_parts(ptr, len) }.to_vec(),
            _ => vec![0; len],
        };

        let outcome = match world.find(address, enabled) {
            Some(device) => device.transact(endpoint, stage, pid, &mut data),
            None => {
                finish(state, pipe, id, token, QTD_TOKEN_HALTED | QTD_TOKEN_XACT_ERROR, 0);
                status |= UsbSts::USBERRINT.bits();
                break;
            }
        };
        match outcome {
            Outcome::Nak => break,
            Outcome::Stall => {
                finish(state, pipe, id, token, QTD_TOKEN_HALTED, 0);
                status |= UsbSts::USBERRINT.bits();
                break;
            }
            Outcome::Done(moved) => {
                if pid == PID_IN && moved > 0 {
                    if let Some(ptr) = ptr {
                        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, moved) };
                    }
                }
                let remaining = (len - moved.min(len)) as u32;
                finish(state, pipe, id, token, 0, remaining);
                let short = pid == PID_IN && moved < len;
                let next = if short && alt_next & LINK_TERMINATE == 0 {
                    alt_next
                } else {
                    qtd_next
                };
                if let Some(pipe) = state.pipes.get_mut(pipe) {
                    pipe.qh.next.write(next);
                }
                if short || token & QTD_TOKEN_IOC != 0 {
                    status |= UsbSts::USBINT.bits();
                }
            }
        }
        if periodic {
            break;
        }
    }
    status
}

/// Writes the qTD back and, on an error, halts the overlay.
fn finish(state: &mut HostState, pipe: PipeId, id: TransferId, token: u32, error: u32, remaining: u32) {
    if let Some(transfer) = state.transfers.get_mut(id) {
        let token = (token & !(QTD_TOKEN_ACTIVE | QTD_TOKEN_BYTES_MASK))
            | error
            | (remaining << QTD_TOKEN_BYTES_SHIFT);
        transfer.qtd.token.write(token);
    }
    if let Some(pipe) = state.pipes.get_mut(pipe) {
        let phys = state.transfers.get(id).map_or(0, |transfer| transfer.qtd.phys());
        pipe.qh.current.write(phys);
        if error != 0 {
            pipe.qh.token.write(QTD_TOKEN_HALTED | error);
        }
    }
}
