use crate::driver_interface::{DeviceInfo, DriverId, PipeId, Speed};
use crate::usb::{ConfigDescriptor, DeviceDescriptor, Setup};

/// Size of the per-device descriptor buffer. A configuration descriptor that does not fit is not
/// enumerated.
pub const ENUM_BUF: usize = 512;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnumState {
    /// Attached while another device holds address 0.
    Waiting,
    Attached,
    SettingAddress,
    ReadingDevice,
    ReadingLanguage,
    ReadingConfigHeader,
    ReadingConfig,
    Configuring,
    Active,
    /// Being torn down; completions and claims for it are ignored.
    Detaching,
}

impl EnumState {
    /// Whether the device answers at address 0 in this state.
    pub fn uses_default_address(self) -> bool {
        matches!(self, EnumState::Attached | EnumState::SettingAddress)
    }
}

pub struct Device {
    pub(crate) speed: Speed,
    pub(crate) address: u8,
    pub(crate) hub_address: u8,
    pub(crate) hub_port: u8,
    /// Hub address and port of the transaction translator serving a full or low speed device.
    pub(crate) tt: (u8, u8),
    pub(crate) tier: u8,
    pub(crate) state: EnumState,
    pub(crate) descriptor: DeviceDescriptor,
    pub(crate) config: ConfigDescriptor,
    pub(crate) language: u16,
    pub(crate) control: Option<PipeId>,
    /// Head of the bound driver list, in bind order.
    pub(crate) drivers: Option<DriverId>,
    /// The request enumeration has outstanding, kept for retries.
    pub(crate) setup: Setup,
    pub(crate) retries: u8,
    /// Descriptor buffer the controller writes enumeration responses into.
    pub(crate) buf: [u8; ENUM_BUF],
}

impl Default for Device {
    fn default() -> Self {
        Self {
            speed: Speed::Full,
            address: 0,
            hub_address: 0,
            hub_port: 0,
            tt: (0, 0),
            tier: 0,
            state: EnumState::Waiting,
            descriptor: DeviceDescriptor::default(),
            config: ConfigDescriptor::default(),
            language: 0,
            control: None,
            drivers: None,
            setup: Setup::default(),
            retries: 0,
            buf: [0; ENUM_BUF],
        }
    }
}

impl Device {
    pub fn new(speed: Speed, hub_address: u8, hub_port: u8, tt: (u8, u8), tier: u8) -> Self {
        Self {
            speed,
            hub_address,
            hub_port,
            tt,
            tier,
            ..Self::default()
        }
    }

    pub fn state(&self) -> EnumState {
        self.state
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Full and low speed traffic goes through a transaction translator, either in a high speed
    /// hub or integrated in the root hub.
    pub fn is_split(&self) -> bool {
        self.speed != Speed::High
    }

    pub fn info(&self) -> Option<DeviceInfo> {
        let descriptor = self.descriptor;
        let config = self.config;
        Some(DeviceInfo {
            address: self.address,
            speed: self.speed,
            hub_address: self.hub_address,
            hub_port: self.hub_port,
            tier: self.tier,
            class: descriptor.class,
            sub_class: descriptor.sub_class,
            protocol: descriptor.protocol,
            vendor: descriptor.vendor,
            product: descriptor.product,
            language: self.language,
            configuration: config.configuration_value,
            attributes: config.attributes,
            max_power: config.max_power,
            control_pipe: self.control?,
        })
    }

    /// The configuration descriptor blob, once read.
    pub fn config_bytes(&self) -> &[u8] {
        let total = usize::from(self.config.total_length).min(ENUM_BUF);
        &self.buf[..total]
    }
}

/// Bus addresses 1 to 127.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddressMap(u128);

impl AddressMap {
    pub fn alloc(&mut self) -> Option<u8> {
        let free = !self.0 & !1;
        if free == 0 {
            return None;
        }
        let address = free.trailing_zeros() as u8;
        self.0 |= 1 << address;
        Some(address)
    }

    pub fn release(&mut self, address: u8) {
        if address != 0 {
            self.0 &= !(1u128 << (address & 0x7F));
        }
    }

    pub fn in_use(&self) -> u32 {
        self.0.count_ones()
    }
}
