use embassy_usb_driver::{EndpointAddress, EndpointInfo, EndpointType};

/// Descriptor type codes.
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
}

/// `bmAttributes` bits of a configuration descriptor.
pub mod config_attributes {
    pub const SELF_POWERED: u8 = 1 << 6;
    pub const REMOTE_WAKEUP: u8 = 1 << 5;
}

/// Descriptor tables served by the device.
///
/// All descriptors are raw USB byte images. `strings[0]` is the language table, further entries
/// are addressed by their string index.
#[derive(Copy, Clone, Debug)]
pub struct Descriptors<'d> {
    pub device: &'d [u8],
    pub configs: &'d [&'d [u8]],
    pub strings: &'d [&'d [u8]],
}

impl<'d> Descriptors<'d> {
    /// Full configuration at `index`, trimmed to its `wTotalLength`.
    pub fn config(&self, index: usize) -> Option<&'d [u8]> {
        let config = *self.configs.get(index)?;
        let total = config_total_length(config)?;
        config.get(..total)
    }

    pub fn string(&self, index: usize) -> Option<&'d [u8]> {
        self.strings.get(index).copied().filter(|s| !s.is_empty())
    }

    /// Configuration with `bConfigurationValue == value`.
    pub fn find_config(&self, value: u8) -> Option<usize> {
        self.configs.iter().position(|c| c.get(5) == Some(&value))
    }
}

fn config_total_length(config: &[u8]) -> Option<usize> {
    let raw = config.get(2..4)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]) as usize)
}

pub fn config_value(config: &[u8]) -> u8 {
    config.get(5).copied().unwrap_or(0)
}

pub fn config_attributes(config: &[u8]) -> u8 {
    config.get(7).copied().unwrap_or(0)
}

/// Iterate the sub-descriptors of a configuration as `(type, bytes)`.
pub fn walk(config: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut rest = config;
    core::iter::from_fn(move || {
        let len = *rest.first()? as usize;
        if len < 2 || len > rest.len() {
            return None;
        }
        let (desc, tail) = rest.split_at(len);
        rest = tail;
        Some((desc[1], desc))
    })
}

/// Endpoint descriptor for `address` inside a configuration.
pub fn find_endpoint(config: &[u8], address: EndpointAddress) -> Option<EndpointInfo> {
    let raw: u8 = address.into();
    walk(config)
        .filter(|(kind, desc)| *kind == descriptor_type::ENDPOINT && desc.len() >= 7)
        .find(|(_, desc)| desc[2] == raw)
        .map(|(_, desc)| EndpointInfo {
            addr: address,
            ep_type: match desc[3] & 3 {
                0 => EndpointType::Control,
                1 => EndpointType::Isochronous,
                2 => EndpointType::Bulk,
                _ => EndpointType::Interrupt,
            },
            max_packet_size: u16::from_le_bytes([desc[4], desc[5]]) & 0x7FF,
            interval_ms: desc[6],
        })
}
