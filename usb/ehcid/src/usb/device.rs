//! Implements the "Device" USB Descriptor.
//!
//! This descriptor is described in USB2 section 9.6.1

/// A USB Device Descriptor.
///
/// "Provides information that applies globally to the device and all the device's
/// configurations" (USB2 9.6.1). A given device will only have one device descriptor.
///
/// USB2 Table 9-8 describes the packet offsets of the fields described by this structure.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// bLength
    pub length: u8,
    /// bDescriptorType. See [super::DescriptorKind]
    pub kind: u8,
    /// The USB standard version in binary-coded decimal. USB 2.0 is encoded as 200H.
    pub usb: u16,
    /// The USB Class Code.
    ///
    /// A value of FF indicates a vendor-specific class. A value of 0 indicates that all the
    /// interfaces in a configuration will provide their own class information.
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// The maximum packet size for endpoint 0: 8, 16, 32 or 64.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    /// The device release number in binary-coded decimal.
    pub release: u16,
    /// Index of the String Descriptor describing the device manufacturer
    pub manufacturer_str: u8,
    /// Index of the String Descriptor describing the product
    pub product_str: u8,
    /// Index of the string descriptor describing the device's serial number
    pub serial_str: u8,
    /// The number of possible configurations (Configuration Descriptors) for this device.
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    /// Gets the USB Minor Version
    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }
    /// Gets the USB Major Version
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }

    /// Whether any string descriptor is referenced, which makes the language table worth reading.
    pub fn has_strings(&self) -> bool {
        self.manufacturer_str != 0 || self.product_str != 0 || self.serial_str != 0
    }

    /// The descriptor in wire format.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { plain::as_bytes(self) }
    }
}

/// The 8-byte version of the Device Descriptor
///
/// The first request sent to a new device asks for only these eight bytes, as the default control
/// pipe's maximum packet size is not known yet and the device may not send more.
///
/// See [DeviceDescriptor]
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor8Byte {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
}

unsafe impl plain::Plain for DeviceDescriptor8Byte {}

impl DeviceDescriptor8Byte {
    pub const SIZE: usize = 8;
}
