use plain::Plain;

/// Mask for the transfer-type bits of an endpoint descriptor's `attributes`
/// field (USB2 Table 9-13).
pub const ENDP_ATTR_TY_MASK: u8 = 0b0000_0011;

/// An Endpoint Descriptor (USB2 Section 9.6.6, Table 9-13).
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

unsafe impl Plain for EndpointDescriptor {}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}
