//! Standard USB definitions shared by the enumeration core and class drivers.
//!
//! The wire-format structs in this module mirror the descriptor layouts from
//! the [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! (chapter 9) and are read straight out of transfer buffers via [`plain`].
//! [`parse`] builds owned, walkable views out of a raw configuration blob.

pub use self::config::ConfigDescriptor;
pub use self::device::{DeviceDescriptor, DeviceDescriptor8Byte};
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ATTR_TY_MASK};
pub use self::interface::InterfaceDescriptor;
pub use self::parse::{ConfDesc, DevDesc, EndpDesc, EndpDirection, IfDesc};
pub use self::setup::{RequestType, Setup};

/// The descriptor kinds this core needs to recognize. (USB2 Section 9.4,
/// Table 9-5; hub kinds come from Chapter 11.)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    Hub = 41,
}

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod interface;
pub mod parse;
pub(crate) mod setup;
