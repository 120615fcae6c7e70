//! Owned views over a raw configuration-descriptor blob.
//!
//! A configuration descriptor transfer returns one packed buffer holding the
//! configuration header followed by interface, endpoint and class-specific
//! descriptors. [`parse_configuration`] walks that buffer by the standard
//! `(bLength, bDescriptorType)` prefix and produces owned structures; kinds
//! this core does not know are skipped, since class-specific descriptors may
//! appear anywhere in the chain.

use std::mem;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{ConfigDescriptor, DescriptorKind, EndpointDescriptor, InterfaceDescriptor};
use super::ENDP_ATTR_TY_MASK;
use crate::error::Error;
use crate::usb::EndpointTy;

/// An owned device-descriptor view, with its parsed configurations attached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DevDesc {
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub config_descs: SmallVec<[ConfDesc; 1]>,
}

impl DevDesc {
    pub fn major_version(&self) -> u8 {
        ((self.usb & 0xFF00) >> 8) as u8
    }
    pub fn minor_version(&self) -> u8 {
        self.usb as u8
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfDesc {
    pub configuration_value: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interface_descs: SmallVec<[IfDesc; 1]>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IfDesc {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub endpoints: SmallVec<[EndpDesc; 4]>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EndpDesc {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpDirection {
    Out,
    In,
    Bidirectional,
}

impl EndpDesc {
    pub fn ty(self) -> EndpointTy {
        match self.attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            3 => EndpointTy::Interrupt,
            _ => unreachable!(),
        }
    }
    pub fn is_control(&self) -> bool {
        self.ty() == EndpointTy::Ctrl
    }
    pub fn is_bulk(&self) -> bool {
        self.ty() == EndpointTy::Bulk
    }
    pub fn is_interrupt(&self) -> bool {
        self.ty() == EndpointTy::Interrupt
    }
    pub fn direction(&self) -> EndpDirection {
        if self.is_control() {
            return EndpDirection::Bidirectional;
        }
        if self.address & 0x80 != 0 {
            EndpDirection::In
        } else {
            EndpDirection::Out
        }
    }
    /// The endpoint number without the direction bit.
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
}

impl From<EndpointDescriptor> for EndpDesc {
    fn from(desc: EndpointDescriptor) -> Self {
        Self {
            address: desc.address,
            attributes: desc.attributes,
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
        }
    }
}

impl From<InterfaceDescriptor> for IfDesc {
    fn from(desc: InterfaceDescriptor) -> Self {
        Self {
            number: desc.number,
            alternate_setting: desc.alternate_setting,
            class: desc.class,
            sub_class: desc.sub_class,
            protocol: desc.protocol,
            endpoints: SmallVec::new(),
        }
    }
}

/// Any descriptor that can follow the configuration header in the blob.
#[derive(Debug)]
enum AnyDescriptor {
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    /// Recognized framing, unknown kind. Carried so the walker can skip it.
    Other,
}

impl AnyDescriptor {
    fn parse(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < 2 {
            return Err(Error::Descriptor("truncated descriptor header"));
        }
        let len = usize::from(bytes[0]);
        let kind = bytes[1];
        if len < 2 {
            return Err(Error::Descriptor("descriptor length below header size"));
        }
        if bytes.len() < len {
            return Err(Error::Descriptor("descriptor exceeds buffer"));
        }

        let desc = match kind {
            k if k == DescriptorKind::Interface as u8 => {
                if len < mem::size_of::<InterfaceDescriptor>() {
                    return Err(Error::Descriptor("short interface descriptor"));
                }
                Self::Interface(
                    *plain::from_bytes(&bytes[..mem::size_of::<InterfaceDescriptor>()])
                        .map_err(|_| Error::Descriptor("unaligned interface descriptor"))?,
                )
            }
            k if k == DescriptorKind::Endpoint as u8 => {
                if len < mem::size_of::<EndpointDescriptor>() {
                    return Err(Error::Descriptor("short endpoint descriptor"));
                }
                Self::Endpoint(
                    *plain::from_bytes(&bytes[..mem::size_of::<EndpointDescriptor>()])
                        .map_err(|_| Error::Descriptor("unaligned endpoint descriptor"))?,
                )
            }
            _ => Self::Other,
        };
        Ok((desc, len))
    }
}

/// Reads the configuration header alone. Used for the short probe read that
/// learns `total_length` before the full transfer is issued.
pub fn parse_config_header(buf: &[u8]) -> Result<ConfigDescriptor, Error> {
    let len = mem::size_of::<ConfigDescriptor>();
    if buf.len() < len {
        return Err(Error::Descriptor("truncated configuration header"));
    }
    let desc: &ConfigDescriptor = plain::from_bytes(&buf[..len])
        .map_err(|_| Error::Descriptor("unaligned configuration header"))?;
    if desc.kind != DescriptorKind::Configuration as u8 {
        return Err(Error::Descriptor("not a configuration descriptor"));
    }
    if usize::from(desc.total_length) < len {
        return Err(Error::Descriptor("configuration total length below header"));
    }
    Ok(*desc)
}

/// Walks a full configuration blob into an owned [`ConfDesc`].
///
/// Endpoint descriptors bind to the most recent interface descriptor.
/// Unknown kinds (HID, class-specific, companions) are skipped.
pub fn parse_configuration(buf: &[u8]) -> Result<ConfDesc, Error> {
    let header = parse_config_header(buf)?;
    let total = usize::from(header.total_length).min(buf.len());

    let mut conf = ConfDesc {
        configuration_value: header.configuration_value,
        attributes: header.attributes,
        max_power: header.max_power,
        interface_descs: SmallVec::new(),
    };

    let mut offset = usize::from(header.length);
    while offset < total {
        let (desc, len) = AnyDescriptor::parse(&buf[offset..total])?;
        match desc {
            AnyDescriptor::Interface(if_desc) => {
                conf.interface_descs.push(if_desc.into());
            }
            AnyDescriptor::Endpoint(endp_desc) => {
                let if_desc = conf
                    .interface_descs
                    .last_mut()
                    .ok_or(Error::Descriptor("endpoint descriptor before any interface"))?;
                if_desc.endpoints.push(endp_desc.into());
            }
            AnyDescriptor::Other => {}
        }
        offset += len;
    }

    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_blob() -> Vec<u8> {
        let mut buf = Vec::new();
        // Configuration header, total length patched below.
        buf.extend_from_slice(&[9, 2, 0, 0, 1, 1, 0, 0xC0, 50]);
        // Mass-storage bulk-only interface.
        buf.extend_from_slice(&[9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0]);
        // A class-specific descriptor the walker must skip.
        buf.extend_from_slice(&[6, 0x24, 1, 2, 3, 4]);
        // Bulk IN 0x81, bulk OUT 0x02, 512-byte packets.
        buf.extend_from_slice(&[7, 5, 0x81, 0x02, 0x00, 0x02, 0]);
        buf.extend_from_slice(&[7, 5, 0x02, 0x02, 0x00, 0x02, 0]);
        let total = buf.len() as u16;
        buf[2..4].copy_from_slice(&total.to_le_bytes());
        buf
    }

    #[test]
    fn walks_interfaces_and_endpoints() {
        let conf = parse_configuration(&config_blob()).unwrap();
        assert_eq!(conf.configuration_value, 1);
        assert_eq!(conf.interface_descs.len(), 1);

        let if_desc = &conf.interface_descs[0];
        assert_eq!(
            (if_desc.class, if_desc.sub_class, if_desc.protocol),
            (0x08, 0x06, 0x50)
        );
        assert_eq!(if_desc.endpoints.len(), 2);
        assert_eq!(if_desc.endpoints[0].direction(), EndpDirection::In);
        assert_eq!(if_desc.endpoints[0].ty(), EndpointTy::Bulk);
        assert_eq!(if_desc.endpoints[1].direction(), EndpDirection::Out);
        assert_eq!(if_desc.endpoints[0].max_packet_size, 512);
    }

    #[test]
    fn rejects_truncation() {
        let mut blob = config_blob();
        blob.truncate(blob.len() - 3);
        // total_length now exceeds the buffer, so the final descriptor is cut.
        assert!(matches!(
            parse_configuration(&blob),
            Err(Error::Descriptor(_))
        ));
    }

    #[test]
    fn rejects_endpoint_without_interface() {
        let mut buf = vec![9, 2, 16, 0, 1, 1, 0, 0xC0, 50];
        buf.extend_from_slice(&[7, 5, 0x81, 0x02, 0x00, 0x02, 0]);
        assert!(matches!(
            parse_configuration(&buf),
            Err(Error::Descriptor("endpoint descriptor before any interface"))
        ));
    }
}
