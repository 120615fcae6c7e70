//! The host-side USB enumeration and class-binding core.
//!
//! This crate sits between a host-controller driver, which owns physical
//! transfer scheduling on the bus, and pluggable device-class drivers (mass
//! storage, HID, hub, ...). It detects nothing by itself: an external
//! connection monitor watches the root ports and, on attach, calls into
//! [`enumerate::UsbHost`]. The core then walks the descriptor negotiation
//! sequence over the controller's transfer facade, resolves a class driver
//! from the process-wide registry, and hands back a live
//! [`class::ClassBinding`] for the port.
//!
//! USB consists of three kinds of devices: the host controller/root hub,
//! USB hubs, and functions attached to hub ports. The topology is a tree;
//! the controller addresses every hub and function in it, and hubs report
//! when devices are plugged or removed downstream. Control traffic for
//! enumeration flows over each device's default control pipe (ep0), with at
//! most one transfer outstanding per endpoint.
//!
//! This documentation refers directly to the relevant standards:
//!
//! - USB2  - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - USB32 - [Universal Serial Bus 3.2 Specification Revision 1.1](https://usb.org/document-library/usb-32-revision-11-june-2022)

pub extern crate plain;

pub mod class;
pub mod devaddr;
pub mod driver;
pub mod enumerate;
pub mod error;
pub mod port;
pub mod usb;

pub use class::{
    find_match, register, ClassBinding, ClassDriver, ClassFactory, ClassFilter, ClassId,
    ClassRegistration, RegistryError,
};
pub use devaddr::DevAddrPool;
pub use driver::{
    Completion, CompletionSender, DriverBuffer, EndpointConfig, EndpointHandle, HostController,
    IoBuffer, RequestBuffer, TransferError,
};
pub use enumerate::{enumerate_port, EnumerateError, EnumerationPhase, UsbHost};
pub use error::{Error, Result};
pub use port::{HubPort, PortId, Speed};
