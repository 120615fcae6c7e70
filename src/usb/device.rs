/// A Device Descriptor (USB2 Section 9.6.1, Table 9-8).
///
/// The class/sub-class/protocol triple here describes the device as a whole.
/// A `class` of zero defers class identity to the interface descriptors
/// inside the configuration.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }
    /// True when the device defers its class identity to its interfaces.
    pub fn class_per_interface(&self) -> bool {
        self.class == 0
    }
}

/// The first 8 bytes of the device descriptor.
///
/// Read before the device has a real address to learn `packet_size` (the
/// ep0 max packet size), which every later control transfer depends on.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor8Byte {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
}

unsafe impl plain::Plain for DeviceDescriptor8Byte {}
