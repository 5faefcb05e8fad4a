/// The hub descriptor (USB2 11.23.2.1), without the variable length DeviceRemovable and
/// PortPwrCtrlMask bitmaps.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HubDescriptor {
    pub length: u8,
    pub kind: u8,
    pub ports: u8,
    pub characteristics: u16,
    /// Time from power-on to power-good on a port, in 2 ms units.
    pub power_on_good: u8,
    pub current: u8,
}

unsafe impl plain::Plain for HubDescriptor {}

impl HubDescriptor {
    pub const DESCRIPTOR_KIND: u8 = 0x29;
    pub const SIZE: usize = 7;
    /// Large enough for the bitmaps of a hub with the maximum of 255 ports.
    pub const MAX_SIZE: usize = 71;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HubPortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortSuspend = 2,
    PortOverCurrent = 3,
    PortReset = 4,
    PortPower = 8,
    PortLowSpeed = 9,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortSuspend = 18,
    CPortOverCurrent = 19,
    CPortReset = 20,
}

bitflags::bitflags! {
    /// wPortStatus in the low half, wPortChange in the high half, as answered by GET_STATUS on a
    /// hub port (USB2 11.24.2.7).
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HubPortStatus: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        // bits 5-7 reserved
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;
        // bits 13-15 reserved
        const CONNECTION_CHANGED = 1 << 16;
        const ENABLE_CHANGED = 1 << 17;
        const SUSPEND_CHANGED = 1 << 18;
        const OVER_CURRENT_CHANGED = 1 << 19;
        const RESET_CHANGED = 1 << 20;
        // bits 21 - 31 reserved
    }
}

unsafe impl plain::Plain for HubPortStatus {}

impl HubPortStatus {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::from_bits_truncate(u32::from_le_bytes(bytes))
    }

    pub fn is_powered(&self) -> bool {
        self.contains(Self::POWER)
    }

    pub fn is_connected(&self) -> bool {
        self.contains(Self::CONNECTION)
    }

    pub fn is_resetting(&self) -> bool {
        self.contains(Self::RESET)
    }

    pub fn is_enabled(&self) -> bool {
        self.contains(Self::ENABLE)
    }

    /// The change bits paired with the feature that acknowledges each of them.
    pub fn changes(&self) -> impl Iterator<Item = HubPortFeature> + '_ {
        const CHANGES: [(HubPortStatus, HubPortFeature); 5] = [
            (HubPortStatus::CONNECTION_CHANGED, HubPortFeature::CPortConnection),
            (HubPortStatus::ENABLE_CHANGED, HubPortFeature::CPortEnable),
            (HubPortStatus::SUSPEND_CHANGED, HubPortFeature::CPortSuspend),
            (HubPortStatus::OVER_CURRENT_CHANGED, HubPortFeature::CPortOverCurrent),
            (HubPortStatus::RESET_CHANGED, HubPortFeature::CPortReset),
        ];
        CHANGES
            .iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, feature)| *feature)
    }
}
