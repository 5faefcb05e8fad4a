use super::DescriptorKind;

/// The 8-byte SETUP packet that opens every control transfer (USB2 9.3).
///
/// The in-memory layout matches the wire format, but hardware never sees this struct directly:
/// the packet is serialized with [Setup::to_bytes] into the storage the SETUP qTD points at.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
pub enum ReqType {
    /// Standard device requests, such as SET_ADDRESS and SET_CONFIGURATION.
    Standard = 0,
    /// Class specific requests, such as the hub port requests.
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[repr(u8)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;

/// Builds a bmRequestType byte.
pub const fn request_type(direction: ReqDirection, ty: ReqType, recipient: ReqRecipient) -> u8 {
    ((direction as u8) << 7) | ((ty as u8) << USB_SETUP_REQ_TY_SHIFT) | recipient as u8
}

impl Setup {
    pub const fn new(kind: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            kind,
            request,
            value,
            index,
            length,
        }
    }

    /// Decodes the two little-endian words a SETUP packet is often built from:
    /// `word1 = bmRequestType | bRequest << 8 | wValue << 16` and `word2 = wIndex | wLength << 16`.
    pub const fn from_words(word1: u32, word2: u32) -> Self {
        Self {
            kind: word1 as u8,
            request: (word1 >> 8) as u8,
            value: (word1 >> 16) as u16,
            index: word2 as u16,
            length: (word2 >> 16) as u16,
        }
    }

    pub const fn words(&self) -> (u32, u32) {
        let word1 = self.kind as u32 | ((self.request as u32) << 8) | ((self.value as u32) << 16);
        let word2 = self.index as u32 | ((self.length as u32) << 16);
        (word1, word2)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let (value, index, length) = (self.value, self.index, self.length);
        let mut bytes = [0u8; 8];
        bytes[0] = self.kind;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&value.to_le_bytes());
        bytes[4..6].copy_from_slice(&index.to_le_bytes());
        bytes[6..8].copy_from_slice(&length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            kind: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }

    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }

    pub const fn req_recipient(&self) -> u8 {
        self.kind & USB_SETUP_RECIPIENT_MASK
    }

    /// Whether this is one of the chapter 9 requests the host issues itself while enumerating.
    pub fn is_standard(&self) -> bool {
        self.req_ty() == ReqType::Standard as u8
    }

    pub const fn get_status() -> Self {
        Self::new(0b1000_0000, SetupReq::GetStatus as u8, 0, 0, 2)
    }

    pub const fn clear_feature(feature: u16) -> Self {
        Self::new(0b0000_0000, SetupReq::ClearFeature as u8, feature, 0, 0)
    }

    pub const fn set_feature(feature: u16) -> Self {
        Self::new(0b0000_0000, SetupReq::SetFeature as u8, feature, 0, 0)
    }

    pub const fn set_address(address: u16) -> Self {
        Self::new(0b0000_0000, SetupReq::SetAddress as u8, address, 0, 0)
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self::new(
            0b1000_0000,
            SetupReq::GetDescriptor as u8,
            ((kind as u16) << 8) | (index as u16),
            language,
            length,
        )
    }

    pub const fn get_configuration() -> Self {
        Self::new(0b1000_0000, SetupReq::GetConfiguration as u8, 0, 0, 1)
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self::new(0b0000_0000, SetupReq::SetConfiguration as u8, value as u16, 0, 0)
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self::new(
            0b0000_0001,
            SetupReq::SetInterface as u8,
            alternate_setting as u16,
            interface as u16,
            0,
        )
    }

    /// Hub class GET_DESCRIPTOR for the hub descriptor (USB2 11.24.2.5).
    pub const fn get_hub_descriptor(length: u16) -> Self {
        Self::new(
            0b1010_0000,
            SetupReq::GetDescriptor as u8,
            (DescriptorKind::Hub as u16) << 8,
            0,
            length,
        )
    }

    /// Hub class GET_STATUS on a port, answering wPortStatus and wPortChange (USB2 11.24.2.7).
    pub const fn get_port_status(port: u8) -> Self {
        Self::new(0b1010_0011, SetupReq::GetStatus as u8, 0, port as u16, 4)
    }

    pub const fn set_port_feature(feature: u16, port: u8) -> Self {
        Self::new(0b0010_0011, SetupReq::SetFeature as u8, feature, port as u16, 0)
    }

    pub const fn clear_port_feature(feature: u16, port: u8) -> Self {
        Self::new(0b0010_0011, SetupReq::ClearFeature as u8, feature, port as u16, 0)
    }
}
