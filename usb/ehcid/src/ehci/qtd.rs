use common::io::{Io, Mmio};
use std::fmt;
use std::sync::atomic::{fence, Ordering};

use crate::driver_interface::TransferError;

/// Bytes one qTD can move: five 4 KiB page pointers, minus the worst-case offset into the first.
pub const QTD_MAX_TRANSFER: usize = 16 * 1024;
pub const QTD_PAGE_SIZE: u32 = 4096;

/// T bit of every EHCI link pointer.
pub const LINK_TERMINATE: u32 = 1;

pub const QTD_TOKEN_STATUS_MASK: u32 = 0x0000_00FF;
pub const QTD_TOKEN_ACTIVE: u32 = 1 << 7;
pub const QTD_TOKEN_HALTED: u32 = 1 << 6;
pub const QTD_TOKEN_DATA_BUFFER_ERROR: u32 = 1 << 5;
pub const QTD_TOKEN_BABBLE: u32 = 1 << 4;
pub const QTD_TOKEN_XACT_ERROR: u32 = 1 << 3;
pub const QTD_TOKEN_MISSED_MICROFRAME: u32 = 1 << 2;
pub const QTD_TOKEN_SPLIT_STATE: u32 = 1 << 1;
pub const QTD_TOKEN_PING: u32 = 1 << 0;

pub const QTD_TOKEN_PID_SHIFT: u8 = 8;
pub const QTD_TOKEN_PID_MASK: u32 = 0x0000_0300;

pub const QTD_TOKEN_CERR_SHIFT: u8 = 10;
pub const QTD_TOKEN_CERR_MASK: u32 = 0x0000_0C00;

pub const QTD_TOKEN_IOC: u32 = 1 << 15;

pub const QTD_TOKEN_BYTES_SHIFT: u8 = 16;
pub const QTD_TOKEN_BYTES_MASK: u32 = 0x7FFF_0000;

pub const QTD_TOKEN_TOGGLE: u32 = 1 << 31;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

/// A Queue Element Transfer Descriptor (EHCI 3.5).
///
/// Controllers require 32-byte alignment. The record is shared with hardware, which rewrites
/// the token (and the buffer pointers while a transfer runs), so every field is volatile.
#[repr(C, align(32))]
#[derive(Default)]
pub struct Qtd {
    pub next: Mmio<u32>,
    pub alt_next: Mmio<u32>,
    pub token: Mmio<u32>,
    pub buffer: [Mmio<u32>; 5],
}

/// The contents of a qTD, built in normal memory and written to a live descriptor in one go.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QtdWords {
    pub next: u32,
    pub alt_next: u32,
    pub token: u32,
    pub buffer: [u32; 5],
}

/// Page pointers for a buffer starting at `addr`: the first keeps the offset, the rest are the
/// following page frames.
pub fn page_pointers(addr: u32) -> [u32; 5] {
    let page = addr & !(QTD_PAGE_SIZE - 1);
    let mut buffer = [0; 5];
    buffer[0] = addr;
    for (i, pointer) in buffer.iter_mut().enumerate().skip(1) {
        *pointer = page.wrapping_add(i as u32 * QTD_PAGE_SIZE);
    }
    buffer
}

pub fn token(pid: Pid, len: u32, toggle: bool, ioc: bool) -> u32 {
    debug_assert!(len as usize <= QTD_MAX_TRANSFER);
    (u32::from(toggle) << 31)
        | ((len << QTD_TOKEN_BYTES_SHIFT) & QTD_TOKEN_BYTES_MASK)
        | (u32::from(ioc) << 15)
        | (3 << QTD_TOKEN_CERR_SHIFT)
        | ((pid as u32) << QTD_TOKEN_PID_SHIFT)
        | QTD_TOKEN_ACTIVE
}

impl QtdWords {
    pub fn setup(addr: u32) -> Self {
        Self {
            next: LINK_TERMINATE,
            alt_next: LINK_TERMINATE,
            token: token(Pid::Setup, 8, false, false),
            buffer: page_pointers(addr),
        }
    }

    pub fn data(addr: u32, len: u32, pid: Pid, toggle: bool, ioc: bool) -> Self {
        Self {
            next: LINK_TERMINATE,
            alt_next: LINK_TERMINATE,
            token: token(pid, len, toggle, ioc),
            buffer: page_pointers(addr),
        }
    }

    /// The zero-length handshake closing a control transfer, always DATA1.
    pub fn status(pid: Pid) -> Self {
        Self {
            next: LINK_TERMINATE,
            alt_next: LINK_TERMINATE,
            token: token(pid, 0, true, true),
            buffer: [0; 5],
        }
    }
}

impl Qtd {
    pub fn phys(&self) -> u32 {
        self as *const Self as usize as u32
    }

    /// Writes every word, the token last: once the token is stored the controller may start on
    /// the descriptor, so everything else has to be in place before.
    pub fn set(&mut self, words: &QtdWords) {
        self.next.write(words.next);
        self.alt_next.write(words.alt_next);
        for (reg, value) in self.buffer.iter_mut().zip(words.buffer.iter()) {
            reg.write(*value);
        }
        fence(Ordering::Release);
        self.token.write(words.token);
    }

    /// Turns this descriptor into an inactive queue terminator.
    pub fn halt(&mut self) {
        self.token.write(0);
        self.next.write(LINK_TERMINATE);
        self.alt_next.write(LINK_TERMINATE);
    }

    pub fn words(&self) -> QtdWords {
        let mut buffer = [0; 5];
        for (value, reg) in buffer.iter_mut().zip(self.buffer.iter()) {
            *value = reg.read();
        }
        QtdWords {
            next: self.next.read(),
            alt_next: self.alt_next.read(),
            token: self.token.read(),
            buffer,
        }
    }

    pub fn is_active(&self) -> bool {
        self.token.readf(QTD_TOKEN_ACTIVE)
    }

    pub fn is_halted(&self) -> bool {
        self.token.readf(QTD_TOKEN_HALTED)
    }

    pub fn has_ioc(&self) -> bool {
        self.token.readf(QTD_TOKEN_IOC)
    }

    /// Bytes the controller has not moved yet. Counts down while the descriptor executes.
    pub fn remaining(&self) -> u32 {
        (self.token.read() & QTD_TOKEN_BYTES_MASK) >> QTD_TOKEN_BYTES_SHIFT
    }

    pub fn pid(&self) -> u8 {
        ((self.token.read() & QTD_TOKEN_PID_MASK) >> QTD_TOKEN_PID_SHIFT) as u8
    }

    pub fn deactivate(&mut self) {
        self.token.writef(QTD_TOKEN_ACTIVE, false);
    }

    /// Decodes the error bits of a halted descriptor.
    pub fn status(&self) -> Result<(), TransferError> {
        status_from_token(self.token.read())
    }
}

pub fn status_from_token(token: u32) -> Result<(), TransferError> {
    if token & QTD_TOKEN_HALTED == 0 {
        return Ok(());
    }
    Err(if token & QTD_TOKEN_BABBLE != 0 {
        TransferError::Babble
    } else if token & QTD_TOKEN_DATA_BUFFER_ERROR != 0 {
        TransferError::DataBuffer
    } else if token & QTD_TOKEN_XACT_ERROR != 0 {
        TransferError::Transaction
    } else if token & QTD_TOKEN_MISSED_MICROFRAME != 0 {
        TransferError::MissedMicroframe
    } else {
        TransferError::Stall
    })
}

impl fmt::Debug for Qtd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Qtd {{ next: {:>08X}, alt_next: {:>08X}, token: {:>08X}, buffer0: {:>08X} }}",
            self.next.read(),
            self.alt_next.read(),
            self.token.read(),
            self.buffer[0].read(),
        )
    }
}
