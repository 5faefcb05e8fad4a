//! The Universal Serial Bus (USB) Module
//!
//! Chapter 9 and chapter 11 types shared by the host core, the enumeration state machine and class
//! drivers. Everything here is a plain view over wire bytes; nothing in this module touches the
//! controller.
//!
//! The [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! is the document that informs this implementation. Section references are written "USB2 x.y".
pub use self::config::ConfigDescriptor;
pub use self::device::{DeviceDescriptor, DeviceDescriptor8Byte};
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ATTR_TY_MASK};
pub use self::hub::*;
pub use self::interface::{InterfaceAssocDescriptor, InterfaceDescriptor};
pub use self::setup::{ReqDirection, ReqRecipient, ReqType, Setup, SetupReq};

/// Enumerates the list of descriptor kinds that can be reported by a USB device to report its
/// attributes to the system. (See USB2 Sections 9.5 and 9.6)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    None = 0,
    /// A Device Descriptor. See [DeviceDescriptor]
    Device = 1,
    /// A Configuration Descriptor. See [ConfigDescriptor]
    Configuration = 2,
    /// A String Descriptor (USB2 9.6.7). String 0 lists the supported language IDs.
    String = 3,
    /// An Interface Descriptor. See [InterfaceDescriptor]
    Interface = 4,
    /// An Endpoint Descriptor. See [EndpointDescriptor]
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    /// An Interface Association Descriptor. See [InterfaceAssocDescriptor]
    InterfaceAssociation = 11,
    Hid = 33,
    /// A USB Hub Descriptor. See [HubDescriptor]
    Hub = 41,
}

/// USB-IF class code of hubs (bDeviceClass).
pub const CLASS_HUB: u8 = 9;

/// A raw descriptor found inside a configuration descriptor blob.
#[derive(Clone, Copy, Debug)]
pub struct RawDescriptor<'a> {
    pub kind: u8,
    /// The whole descriptor, including the bLength and bDescriptorType bytes.
    pub bytes: &'a [u8],
}

impl<'a> RawDescriptor<'a> {
    /// Reinterprets the descriptor as `T`, if it is long enough.
    pub fn parse<T: plain::Plain + Default>(&self) -> Option<T> {
        let mut value = T::default();
        plain::copy_from_bytes(&mut value, self.bytes).ok()?;
        Some(value)
    }
}

/// Iterates over the descriptors packed into `bytes`, stopping at the first truncated or
/// zero-length entry.
pub fn descriptors(bytes: &[u8]) -> Descriptors<'_> {
    Descriptors { bytes }
}

pub struct Descriptors<'a> {
    bytes: &'a [u8],
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = RawDescriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.len() < 2 {
            return None;
        }
        let len = usize::from(self.bytes[0]);
        if len < 2 || len > self.bytes.len() {
            self.bytes = &[];
            return None;
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Some(RawDescriptor {
            kind: head[1],
            bytes: head,
        })
    }
}

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod hub;
pub(crate) mod interface;
pub(crate) mod setup;
