use bitflags::bitflags;

use super::DescriptorKind;

bitflags! {
    /// The `bmRequestType` field of a setup packet (USB2 Section 9.3).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RequestType: u8 {
        const DEVICE_TO_HOST = 1 << 7;
        const TY_CLASS = 1 << 5;
        const TY_VENDOR = 2 << 5;
        const RECIP_INTERFACE = 1;
        const RECIP_ENDPOINT = 2;
        const RECIP_OTHER = 3;
    }
}

/// A control-request setup packet (USB2 Section 9.3, Table 9-2).
///
/// The builders below cover the standard requests the enumeration core and
/// class drivers issue over ep0.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

impl Setup {
    pub fn get_status() -> Self {
        Self {
            kind: RequestType::DEVICE_TO_HOST.bits(),
            request: 0x00,
            value: 0,
            index: 0,
            length: 2,
        }
    }

    pub fn clear_feature(recipient: RequestType, feature: u16, index: u16) -> Self {
        Self {
            kind: recipient.bits(),
            request: 0x01,
            value: feature,
            index,
            length: 0,
        }
    }

    pub fn set_feature(recipient: RequestType, feature: u16, index: u16) -> Self {
        Self {
            kind: recipient.bits(),
            request: 0x03,
            value: feature,
            index,
            length: 0,
        }
    }

    pub fn set_address(address: u8) -> Self {
        Self {
            kind: RequestType::empty().bits(),
            request: 0x05,
            value: address.into(),
            index: 0,
            length: 0,
        }
    }

    pub fn get_descriptor(kind: DescriptorKind, index: u8, language: u16, length: u16) -> Self {
        Self {
            kind: RequestType::DEVICE_TO_HOST.bits(),
            request: 0x06,
            value: ((kind as u16) << 8) | u16::from(index),
            index: language,
            length,
        }
    }

    pub fn get_configuration() -> Self {
        Self {
            kind: RequestType::DEVICE_TO_HOST.bits(),
            request: 0x08,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        Self {
            kind: RequestType::empty().bits(),
            request: 0x09,
            value: value.into(),
            index: 0,
            length: 0,
        }
    }

    pub fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: RequestType::RECIP_INTERFACE.bits(),
            request: 0x0B,
            value: alternate_setting.into(),
            index: interface.into(),
            length: 0,
        }
    }

    /// True when the data stage, if any, moves device-to-host.
    pub fn is_in(&self) -> bool {
        self.kind & RequestType::DEVICE_TO_HOST.bits() != 0
    }
}
