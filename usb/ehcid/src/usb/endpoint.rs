use plain::Plain;

/// The descriptor for a USB Endpoint.
///
/// Each endpoint for a particular interface has its own descriptor. This is returned as part of
/// the configuration descriptor and cannot be requested individually.
///
/// See USB2 9.6.6
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Mask that is ANDed to the [EndpointDescriptor].attributes buffer to get the endpoint type.
pub const ENDP_ATTR_TY_MASK: u8 = 0x3;

pub const ENDP_ADDR_NUM_MASK: u8 = 0x0F;
pub const ENDP_ADDR_DIR_IN: u8 = 0x80;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointDescriptor {
    pub fn ty(self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }

    pub fn number(self) -> u8 {
        self.address & ENDP_ADDR_NUM_MASK
    }

    pub fn is_in(self) -> bool {
        self.address & ENDP_ADDR_DIR_IN != 0
    }

    /// wMaxPacketSize without the high-bandwidth transaction bits.
    pub fn max_packet(self) -> u16 {
        self.max_packet_size & 0x07FF
    }
}

unsafe impl Plain for EndpointDescriptor {}
