use common::io::{Io, Mmio, ReadOnly};
use std::ptr::{addr_of_mut, NonNull};

use crate::driver_interface::Speed;

// RO - read-only
// RW - read/write
// RWC - read/write-1-to-clear
// Writes to USBSTS and the change bits of PORTSC must only carry the bits meant to be cleared.

bitflags::bitflags! {
    pub struct UsbCmd: u32 {
        const RS = 1 << 0; // RW
        const HCRESET = 1 << 1; // RW
        const FLS_0 = 1 << 2; // RW
        const FLS_1 = 1 << 3; // RW
        const PSE = 1 << 4; // RW
        const ASE = 1 << 5; // RW
        const IAAD = 1 << 6; // RW
        const LHCR = 1 << 7; // RW
        const ASPM_0 = 1 << 8; // RW
        const ASPM_1 = 1 << 9; // RW
        const ASPME = 1 << 11; // RW
    }
}

pub const USBCMD_FLS_MASK: u32 = 0x0000_000C;
/// FLS encoding of a 256 entry frame list.
pub const USBCMD_FLS_256: u32 = 2 << 2;
pub const USBCMD_ITC_SHIFT: u8 = 16;
pub const USBCMD_ITC_MASK: u32 = 0x00FF_0000;

bitflags::bitflags! {
    pub struct UsbSts: u32 {
        const USBINT = 1 << 0; // RWC
        const USBERRINT = 1 << 1; // RWC
        const PCD = 1 << 2; // RWC
        const FLR = 1 << 3; // RWC
        const HSE = 1 << 4; // RWC
        const IAA = 1 << 5; // RWC
        const HCHALTED = 1 << 12; // RO
        const RECLAMATION = 1 << 13; // RO
        const PSS = 1 << 14; // RO
        const ASS = 1 << 15; // RO
    }
}

bitflags::bitflags! {
    pub struct UsbIntr: u32 {
        const USBINT = 1 << 0;
        const USBERRINT = 1 << 1;
        const PCD = 1 << 2;
        const FLR = 1 << 3;
        const HSE = 1 << 4;
        const IAA = 1 << 5;
    }
}

bitflags::bitflags! {
    pub struct PortSc: u32 {
        const CCS = 1 << 0; // RO
        const CSC = 1 << 1; // RWC
        const PE = 1 << 2; // RW
        const PEC = 1 << 3; // RWC
        const OCA = 1 << 4; // RO
        const OCC = 1 << 5; // RWC
        const FPR = 1 << 6; // RW
        const SUSPEND = 1 << 7; // RW
        const PR = 1 << 8; // RW
        const HSP = 1 << 9; // RO
        const LS_0 = 1 << 10; // RO
        const LS_1 = 1 << 11; // RO
        const PP = 1 << 12; // RW
        const PO = 1 << 13; // RW
        const PSPD_0 = 1 << 26; // RO
        const PSPD_1 = 1 << 27; // RO
    }
}

impl PortSc {
    pub const CHANGE_BITS: PortSc = PortSc::CSC.union(PortSc::PEC).union(PortSc::OCC);

    /// The value to write back to set or clear RW bits without clearing any pending change.
    pub fn preserving(self) -> u32 {
        (self - Self::CHANGE_BITS).bits()
    }
}

pub const PORTSC_PSPD_SHIFT: u8 = 26;
pub const PORTSC_PSPD_MASK: u32 = 0x0C00_0000;

/// The operational registers the host core touches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpReg {
    UsbCmd,
    UsbSts,
    UsbIntr,
    FrIndex,
    CtrlDsSegment,
    PeriodicListBase,
    AsyncListAddr,
    ConfigFlag,
}

/// Access to an EHCI operational register block.
///
/// The host core never depends on where the block lives or how it is reached, only on the
/// documented register semantics.
pub trait EhciRegs: Send + Sync {
    fn read(&self, reg: OpReg) -> u32;
    fn write(&self, reg: OpReg, value: u32);

    fn port_count(&self) -> u8;
    fn read_port(&self, port: u8) -> u32;
    fn write_port(&self, port: u8, value: u32);

    /// Speed of the device on an enabled port. The default reads the PSPD field that controllers
    /// with an integrated transaction translator report in PORTSC.
    fn port_speed(&self, portsc: u32) -> Speed {
        match (portsc & PORTSC_PSPD_MASK) >> PORTSC_PSPD_SHIFT {
            1 => Speed::Low,
            2 => Speed::High,
            _ => Speed::Full,
        }
    }

    fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_truncate(self.read(OpReg::UsbCmd))
    }

    fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_truncate(self.read(OpReg::UsbSts))
    }

    /// Sets (or clears) `flags` in USBCMD, keeping every other field, ITC and FLS included.
    fn set_usbcmd(&self, flags: UsbCmd, value: bool) {
        let cmd = self.read(OpReg::UsbCmd);
        let cmd = if value {
            cmd | flags.bits()
        } else {
            cmd & !flags.bits()
        };
        self.write(OpReg::UsbCmd, cmd);
    }
}

/// Represents the memory-mapped Capability Registers (EHCI 2.2).
#[repr(C)]
pub struct CapabilityRegs {
    /// Offset of the operational registers from the start of this block.
    pub len: ReadOnly<Mmio<u8>>,
    _rsvd: ReadOnly<Mmio<u8>>,
    pub hci_ver: ReadOnly<Mmio<u16>>,
    /// HCSPARAMS: bits 0-3 are the number of ports.
    pub hcs_params: ReadOnly<Mmio<u32>>,
    pub hcc_params: ReadOnly<Mmio<u32>>,
}

pub const HCSPARAMS_N_PORTS_MASK: u32 = 0x0000_000F;

/// Represents the memory-mapped Operational Registers (EHCI 2.3).
#[repr(C)]
pub struct OperationalRegs {
    pub usb_cmd: Mmio<u32>,
    pub usb_sts: Mmio<u32>,
    pub usb_intr: Mmio<u32>,
    pub fr_index: Mmio<u32>,
    pub ctrl_ds_segment: Mmio<u32>,
    pub periodic_list_base: Mmio<u32>,
    pub async_list_addr: Mmio<u32>,
    _rsvd: [Mmio<u32>; 9],
    pub config_flag: Mmio<u32>,
    pub port_sc: [Mmio<u32>; 15],
}

/// [EhciRegs] over a standard memory mapped EHCI register block.
pub struct MmioRegs {
    op: NonNull<OperationalRegs>,
    ports: u8,
}

// The register block is reached through volatile accesses only.
unsafe impl Send for MmioRegs {}
unsafe impl Sync for MmioRegs {}

impl MmioRegs {
    /// # Safety
    ///
    /// `base` must point at the capability registers of an EHCI controller, mapped uncached, and
    /// stay valid for the lifetime of the returned value.
    pub unsafe fn new(base: NonNull<CapabilityRegs>) -> Self {
        let cap = base.as_ref();
        let len = usize::from(cap.len.read());
        let ports = (cap.hcs_params.read() & HCSPARAMS_N_PORTS_MASK) as u8;
        let op = NonNull::new_unchecked((base.as_ptr() as *mut u8).add(len) as *mut OperationalRegs);
        Self { op, ports }
    }

    fn reg(&self, reg: OpReg) -> *mut Mmio<u32> {
        let op = self.op.as_ptr();
        unsafe {
            match reg {
                OpReg::UsbCmd => addr_of_mut!((*op).usb_cmd),
                OpReg::UsbSts => addr_of_mut!((*op).usb_sts),
                OpReg::UsbIntr => addr_of_mut!((*op).usb_intr),
                OpReg::FrIndex => addr_of_mut!((*op).fr_index),
                OpReg::CtrlDsSegment => addr_of_mut!((*op).ctrl_ds_segment),
                OpReg::PeriodicListBase => addr_of_mut!((*op).periodic_list_base),
                OpReg::AsyncListAddr => addr_of_mut!((*op).async_list_addr),
                OpReg::ConfigFlag => addr_of_mut!((*op).config_flag),
            }
        }
    }

    fn port(&self, port: u8) -> *mut Mmio<u32> {
        assert!(port < self.ports, "port {} out of range", port);
        unsafe { addr_of_mut!((*self.op.as_ptr()).port_sc[usize::from(port)]) }
    }
}

impl EhciRegs for MmioRegs {
    fn read(&self, reg: OpReg) -> u32 {
        unsafe { (*self.reg(reg)).read() }
    }

    fn write(&self, reg: OpReg, value: u32) {
        unsafe { (*self.reg(reg)).write(value) }
    }

    fn port_count(&self) -> u8 {
        self.ports
    }

    fn read_port(&self, port: u8) -> u32 {
        unsafe { (*self.port(port)).read() }
    }

    fn write_port(&self, port: u8, value: u32) {
        unsafe { (*self.port(port)).write(value) }
    }
}
