use plain::Plain;

/// An Interface Descriptor (USB2 9.6.5). One per alternate setting of each interface.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub number: u8,
    pub alternate_setting: u8,
    pub endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: u8,
}

unsafe impl Plain for InterfaceDescriptor {}

/// Interface Association Descriptor (USB2 ECN, 9.6.4 of the IAD addendum). Groups
/// `interface_count` consecutive interfaces, starting at `first_interface`, into one function.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceAssocDescriptor {
    pub length: u8,
    pub kind: u8,
    pub first_interface: u8,
    pub interface_count: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub function_str: u8,
}

unsafe impl Plain for InterfaceAssocDescriptor {}

impl InterfaceAssocDescriptor {
    pub fn covers(&self, interface: u8) -> bool {
        let first = self.first_interface;
        interface >= first && u16::from(interface) < u16::from(first) + u16::from(self.interface_count)
    }
}
