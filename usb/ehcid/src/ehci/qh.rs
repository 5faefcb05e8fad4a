use common::io::{Io, Mmio};
use std::fmt;

use super::qtd::LINK_TERMINATE;
use crate::driver_interface::Speed;

/// Type field of a horizontal link pointer (EHCI 3.1): bits 1-2, 01b selects a queue head.
pub const LINK_TYPE_QH: u32 = 1 << 1;

pub const QH_CHAR_RL_SHIFT: u8 = 28;
pub const QH_CHAR_RL_MASK: u32 = 0xF000_0000;
pub const QH_CHAR_CONTROL_ENDPOINT: u32 = 1 << 27;
pub const QH_CHAR_MAX_PACKET_SHIFT: u8 = 16;
pub const QH_CHAR_MAX_PACKET_MASK: u32 = 0x07FF_0000;
pub const QH_CHAR_HEAD: u32 = 1 << 15;
pub const QH_CHAR_DTC: u32 = 1 << 14;
pub const QH_CHAR_EPS_SHIFT: u8 = 12;
pub const QH_CHAR_EPS_MASK: u32 = 0x0000_3000;
pub const QH_CHAR_ENDPOINT_SHIFT: u8 = 8;
pub const QH_CHAR_ENDPOINT_MASK: u32 = 0x0000_0F00;
pub const QH_CHAR_ADDRESS_MASK: u32 = 0x0000_007F;

pub const QH_CAPS_MULT_SHIFT: u8 = 30;
pub const QH_CAPS_PORT_SHIFT: u8 = 23;
pub const QH_CAPS_HUB_SHIFT: u8 = 16;
pub const QH_CAPS_CMASK_SHIFT: u8 = 8;
pub const QH_CAPS_SMASK_MASK: u32 = 0x0000_00FF;

/// NAK reload count for asynchronous queue heads. Periodic heads must use 0.
pub const NAK_RELOAD: u32 = 15;
/// Interrupt pipes start in microframe 0.
pub const INTERRUPT_SMASK: u32 = 0x01;
/// Complete-splits for interrupt pipes behind a transaction translator, microframes 2 to 4.
pub const INTERRUPT_CMASK: u32 = 0x1C;

/// The characteristics word (endpoint characteristics, EHCI 3.6.2) of a queue head.
#[derive(Clone, Copy, Debug)]
pub struct Characteristics {
    pub address: u8,
    pub endpoint: u8,
    pub speed: Speed,
    pub max_packet: u16,
    pub control: bool,
    pub periodic: bool,
}

impl Characteristics {
    pub fn bits(&self) -> u32 {
        let reload = if self.periodic { 0 } else { NAK_RELOAD };
        let mut bits = (reload << QH_CHAR_RL_SHIFT)
            | ((u32::from(self.max_packet) << QH_CHAR_MAX_PACKET_SHIFT) & QH_CHAR_MAX_PACKET_MASK)
            | ((self.speed as u32) << QH_CHAR_EPS_SHIFT)
            | ((u32::from(self.endpoint) << QH_CHAR_ENDPOINT_SHIFT) & QH_CHAR_ENDPOINT_MASK)
            | (u32::from(self.address) & QH_CHAR_ADDRESS_MASK);
        if self.control {
            bits |= QH_CHAR_DTC;
            if self.speed != Speed::High {
                bits |= QH_CHAR_CONTROL_ENDPOINT;
            }
        }
        bits
    }
}

/// The capabilities word (EHCI 3.6.2): split transaction routing and the periodic masks.
pub fn capabilities(hub_address: u8, hub_port: u8, interrupt: bool, split: bool) -> u32 {
    let mut bits = (1 << QH_CAPS_MULT_SHIFT)
        | (u32::from(hub_port & 0x7F) << QH_CAPS_PORT_SHIFT)
        | (u32::from(hub_address & 0x7F) << QH_CAPS_HUB_SHIFT);
    if interrupt {
        bits |= INTERRUPT_SMASK;
        if split {
            bits |= INTERRUPT_CMASK << QH_CAPS_CMASK_SHIFT;
        }
    }
    bits
}

/// An EHCI Queue Head (EHCI 3.6): one endpoint's entry in a schedule plus the transfer overlay
/// the controller executes from.
#[repr(C, align(32))]
#[derive(Default)]
pub struct QueueHead {
    pub horizontal: Mmio<u32>,
    pub characteristics: Mmio<u32>,
    pub capabilities: Mmio<u32>,
    /// Address of the qTD the overlay was loaded from. Written by the controller.
    pub current: Mmio<u32>,
    pub next: Mmio<u32>,
    pub alt_next: Mmio<u32>,
    pub token: Mmio<u32>,
    pub buffer: [Mmio<u32>; 5],
}

impl QueueHead {
    pub fn phys(&self) -> u32 {
        self as *const Self as usize as u32
    }

    /// This head as the target of a horizontal link.
    pub fn link(&self) -> u32 {
        self.phys() | LINK_TYPE_QH
    }

    /// Resets the head to the rest state: not linked anywhere, an empty overlay whose next
    /// pointer is the pipe's halt qTD.
    pub fn init(&mut self, characteristics: u32, capabilities: u32, halt: u32) {
        self.horizontal.write(LINK_TERMINATE);
        self.characteristics.write(characteristics);
        self.capabilities.write(capabilities);
        self.current.write(0);
        self.next.write(halt);
        self.alt_next.write(LINK_TERMINATE);
        for buffer in self.buffer.iter_mut() {
            buffer.write(0);
        }
        self.token.write(0);
    }

    /// Turns this head into the permanent head of the asynchronous ring, pointing at itself.
    pub fn init_reclamation_head(&mut self) {
        self.init(QH_CHAR_HEAD, 1 << QH_CAPS_MULT_SHIFT, LINK_TERMINATE);
        self.token.write(super::qtd::QTD_TOKEN_HALTED);
        let link = self.link();
        self.horizontal.write(link);
    }

    pub fn address(&self) -> u8 {
        (self.characteristics.read() & QH_CHAR_ADDRESS_MASK) as u8
    }

    pub fn endpoint(&self) -> u8 {
        ((self.characteristics.read() & QH_CHAR_ENDPOINT_MASK) >> QH_CHAR_ENDPOINT_SHIFT) as u8
    }

    pub fn max_packet(&self) -> u16 {
        ((self.characteristics.read() & QH_CHAR_MAX_PACKET_MASK) >> QH_CHAR_MAX_PACKET_SHIFT)
            as u16
    }

    pub fn set_address(&mut self, address: u8) {
        self.characteristics
            .modify(QH_CHAR_ADDRESS_MASK, u32::from(address));
    }

    pub fn set_max_packet(&mut self, max_packet: u16) {
        self.characteristics.modify(
            QH_CHAR_MAX_PACKET_MASK,
            u32::from(max_packet) << QH_CHAR_MAX_PACKET_SHIFT,
        );
    }

    pub fn is_halted(&self) -> bool {
        self.token.readf(super::qtd::QTD_TOKEN_HALTED)
    }

    /// Clears a halted overlay so the controller resumes at `next`.
    pub fn restart(&mut self, next: u32) {
        self.next.write(next);
        self.alt_next.write(LINK_TERMINATE);
        self.token.write(0);
    }
}

impl fmt::Debug for QueueHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "QueueHead {{ horizontal: {:>08X}, characteristics: {:>08X}, capabilities: {:>08X}, next: {:>08X}, token: {:>08X} }}",
            self.horizontal.read(),
            self.characteristics.read(),
            self.capabilities.read(),
            self.next.read(),
            self.token.read(),
        )
    }
}
