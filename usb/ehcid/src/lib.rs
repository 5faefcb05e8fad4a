//! The Enhanced Host Controller Interface (EHCI) core
//!
//! This crate drives a USB 2.0 EHCI host controller on a system without an operating system
//! underneath it: the caller maps the register window, hands it over as an [EhciRegs]
//! implementation and calls [UsbHost::isr] from the controller's interrupt.
//!
//! Everything the controller reads lives in fixed pools inside the pinned [UsbHost]: queue heads
//! (one per pipe), transfer descriptors, the periodic frame list and the device records. Devices
//! found on the root ports are reset, addressed and read one request at a time by the enumeration
//! state machine, then offered to the registered class drivers. [UsbHub] is one such driver and
//! brings the devices behind a hub into the same tree.
//!
//! This documentation will refer directly to the relevant standards, which are as follows:
//!
//! - EHCI - [Enhanced Host Controller Interface Specification for Universal Serial Bus, Revision 1.0](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/ehci-specification-for-usb.pdf)
//! - USB2 - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//!

pub mod config;
// Drivers are written against this module only.
pub mod driver_interface;
pub mod ehci;
pub mod hub;
pub mod usb;

pub use crate::config::{HostConfig, DEFAULT_CONFIG};
pub use crate::driver_interface::{
    ClaimRequest, ClaimScope, Completion, DeviceId, DeviceInfo, DmaBuf, DriverId, Error, PipeId,
    Result, UsbBus, UsbDriver,
};
pub use crate::ehci::device::EnumState;
pub use crate::ehci::regs::EhciRegs;
pub use crate::ehci::{DriverGuard, UsbHost};
pub use crate::hub::UsbHub;
