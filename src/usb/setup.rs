use embassy_usb_driver::Direction;

/// Standard request codes (`bRequest`).
pub mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
}

/// Standard feature selectors.
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

/// Control request type, bits 5..6 of `bmRequestType`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Control request recipient, bits 0..4 of `bmRequestType`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

/// The 8 byte packet opening every control transfer.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const fn parse(raw: &[u8; 8]) -> Self {
        Self {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let [v0, v1] = self.value.to_le_bytes();
        let [i0, i1] = self.index.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [self.request_type, self.request, v0, v1, i0, i1, l0, l1]
    }

    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 3 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Descriptor type of a `GET_DESCRIPTOR` request.
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index of a `GET_DESCRIPTOR` request.
    pub fn descriptor_index(&self) -> u8 {
        self.value as u8
    }

    /// Whether an OUT data stage follows.
    pub fn has_out_data(&self) -> bool {
        !self.is_in() && self.length != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_get_descriptor() {
        let setup = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(setup.request, request::GET_DESCRIPTOR);
        assert_eq!(setup.descriptor_type(), 1);
        assert_eq!(setup.descriptor_index(), 0);
        assert_eq!(setup.length, 18);
        assert!(setup.is_in());
        assert_eq!(setup.kind(), RequestType::Standard);
        assert_eq!(setup.recipient(), Recipient::Device);
    }

    #[test]
    fn vendor_out_to_interface() {
        let raw = [0x41, 0x22, 0x34, 0x12, 0x02, 0x00, 0x08, 0x00];
        let setup = SetupPacket::parse(&raw);
        assert_eq!(setup.kind(), RequestType::Vendor);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert_eq!(setup.value, 0x1234);
        assert!(setup.has_out_data());
        assert_eq!(setup.to_bytes(), raw);
    }
}
