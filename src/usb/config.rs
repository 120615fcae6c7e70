/// A Configuration Descriptor (USB2 Section 9.6.3, Table 9-10).
///
/// `total_length` covers the descriptor itself plus all interface, endpoint
/// and class-specific descriptors that follow it in the same transfer.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}
