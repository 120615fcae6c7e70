//! The enumeration state machine and the connection-monitor entry point.
//!
//! Enumeration drives one port at a time, on the dedicated per-controller
//! thread, through the descriptor negotiation sequence: learn the ep0 max
//! packet size, assign a function address, retrieve the device and
//! configuration descriptors, resolve a class driver from the registry,
//! instantiate it and hand it the configuration. A disconnect can arrive at
//! any point; the transfer facade then fails the in-flight request with
//! `Disconnected`, which aborts the sequence from whatever phase it was in.

use std::mem;
use std::sync::Arc;

use log::{debug, info, warn};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

use crate::class::{self, ClassBinding, ClassId};
use crate::driver::{DriverBuffer, HostController, TransferError};
use crate::error::Error;
use crate::port::HubPort;
use crate::usb::{
    parse, DescriptorKind, DevDesc, DeviceDescriptor, DeviceDescriptor8Byte, Setup,
};

/// Bound on NAK/timeout (and short-read) retries per descriptor request.
/// SET_ADDRESS is never retried; a device that NAKs it is presumed gone.
const DESC_RETRIES: u32 = 3;

/// The phases of one enumeration attempt, in order. Terminal outcomes are
/// the `Result` of [`enumerate_port`], not phases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnumerationPhase {
    /// ep0 at address 0; reading the 8-byte device descriptor to learn the
    /// max packet size.
    Unconfigured,
    /// Function address allocated; SET_ADDRESS and ep0 reconfiguration.
    AddressAssigned,
    /// Full device descriptor and configuration descriptor retrieval.
    DescriptorRetrieved,
    /// Identity derived; registry lookup.
    ClassResolved,
    /// Factory produced a binding.
    Bound,
    /// Configuration delivered to the class driver.
    Connected,
}

#[derive(Debug, Error)]
pub enum EnumerateError {
    /// Enumeration failed; any allocated address was released and no
    /// binding exists. The port may be enumerated again.
    #[error(transparent)]
    Failed(#[from] Error),

    /// The class driver rejected the configuration. The binding is still
    /// valid and the caller owns it: invoke [`ClassBinding::disconnect`] to
    /// release the class driver's resources.
    #[error("class driver rejected configuration: {source}")]
    ConnectFailed {
        binding: ClassBinding,
        source: Error,
    },
}

/// Runs the full enumeration sequence for the device attached on `port`,
/// returning the connected class binding.
pub fn enumerate_port(port: &Arc<HubPort>) -> Result<ClassBinding, EnumerateError> {
    let mut machine = Enumeration {
        port,
        phase: EnumerationPhase::Unconfigured,
    };
    match machine.run() {
        Ok(binding) => {
            info!("port {}: enumeration complete, bound {}", port.id(), binding.port_id());
            Ok(binding)
        }
        Err(err @ EnumerateError::ConnectFailed { .. }) => {
            // The device stays addressed; the binding owns the attachment
            // until the caller disconnects it.
            warn!("port {}: {}", port.id(), err);
            Err(err)
        }
        Err(err) => {
            warn!(
                "port {}: enumeration failed in phase {:?}: {}",
                port.id(),
                machine.phase,
                err
            );
            port.release_funcaddr();
            Err(err)
        }
    }
}

struct Enumeration<'a> {
    port: &'a Arc<HubPort>,
    phase: EnumerationPhase,
}

impl Enumeration<'_> {
    fn run(&mut self) -> Result<ClassBinding, EnumerateError> {
        let driver = self.port.driver().clone();

        // Unconfigured: ep0 at default address, minimum packet size.
        self.port.ensure_ep0()?;
        self.port.ep0_configure(0, 8)?;

        let mut req_buf = driver.alloc_request_buffer()?;
        let dev8 = self.read_device_desc_8(&mut req_buf)?;
        let max_packet_size = u16::from(dev8.packet_size);
        if max_packet_size == 0 {
            return Err(Error::Descriptor("zero ep0 max packet size").into());
        }
        debug!(
            "port {}: ep0 max packet size {}",
            self.port.id(),
            max_packet_size
        );

        // AddressAssigned: give the device a real address and follow it.
        self.phase = EnumerationPhase::AddressAssigned;
        let funcaddr = self.port.assign_funcaddr()?;
        self.port
            .control_out(&Setup::set_address(funcaddr), &req_buf)
            .map_err(Error::from)?;
        self.port.ep0_configure(funcaddr, max_packet_size)?;

        // DescriptorRetrieved: full device descriptor, then the whole
        // configuration (header first to learn its total length).
        self.phase = EnumerationPhase::DescriptorRetrieved;
        let dev_desc = self.read_device_desc(&mut req_buf)?;
        let header_len = mem::size_of::<crate::usb::ConfigDescriptor>();
        self.get_descriptor(
            DescriptorKind::Configuration,
            0,
            header_len as u16,
            &mut req_buf,
            "configuration header",
        )?;
        let header = parse::parse_config_header(&req_buf.as_slice()[..header_len])?;
        let total_length = usize::from(header.total_length);

        let mut io_buf = driver.alloc_io_buffer(total_length)?;
        self.get_descriptor(
            DescriptorKind::Configuration,
            0,
            header.total_length,
            &mut io_buf,
            "configuration descriptor",
        )?;
        let config_bytes = &io_buf.as_slice()[..total_length];
        let conf_desc = parse::parse_configuration(config_bytes)?;

        let desc = DevDesc {
            usb: dev_desc.usb,
            class: dev_desc.class,
            sub_class: dev_desc.sub_class,
            protocol: dev_desc.protocol,
            packet_size: dev_desc.packet_size,
            vendor: dev_desc.vendor,
            product: dev_desc.product,
            release: dev_desc.release,
            config_descs: smallvec![conf_desc],
        };
        info!(
            "port {}: device {:04x}:{:04x} usb {}.{} class {:02x}:{:02x}:{:02x}, {} interface(s)",
            self.port.id(),
            desc.vendor,
            desc.product,
            desc.major_version(),
            desc.minor_version(),
            desc.class,
            desc.sub_class,
            desc.protocol,
            desc.config_descs[0].interface_descs.len(),
        );

        // ClassResolved: derive identities and ask the registry.
        self.phase = EnumerationPhase::ClassResolved;
        let candidates = identity_candidates(&desc);
        let matched = candidates
            .iter()
            .find_map(|id| class::find_match(id).map(|reg| (reg, *id)));
        let (registration, id) = match matched {
            Some(found) => found,
            None => return Err(Error::NoClassDriver(candidates[0]).into()),
        };
        debug!(
            "port {}: matched {} via {:?}",
            self.port.id(),
            id,
            registration.name
        );

        // Bound: let the factory build the class instance.
        self.phase = EnumerationPhase::Bound;
        let class_driver = registration.factory.create(self.port, &id)?;
        let mut binding = ClassBinding::new(self.port, class_driver);

        // Connected: hand over the configuration descriptor. On failure the
        // binding stays valid and travels back to the caller.
        self.phase = EnumerationPhase::Connected;
        match binding.connect(config_bytes) {
            Ok(()) => Ok(binding),
            Err(source) => Err(EnumerateError::ConnectFailed { binding, source }),
        }
    }

    fn read_device_desc_8(
        &self,
        buf: &mut dyn DriverBuffer,
    ) -> Result<DeviceDescriptor8Byte, Error> {
        let len = mem::size_of::<DeviceDescriptor8Byte>();
        self.get_descriptor(
            DescriptorKind::Device,
            0,
            len as u16,
            buf,
            "minimal device descriptor",
        )?;
        let desc: &DeviceDescriptor8Byte = plain::from_bytes(&buf.as_slice()[..len])
            .map_err(|_| Error::Descriptor("unaligned device descriptor"))?;
        Ok(*desc)
    }

    fn read_device_desc(&self, buf: &mut dyn DriverBuffer) -> Result<DeviceDescriptor, Error> {
        let len = mem::size_of::<DeviceDescriptor>();
        self.get_descriptor(
            DescriptorKind::Device,
            0,
            len as u16,
            buf,
            "device descriptor",
        )?;
        let desc: &DeviceDescriptor = plain::from_bytes(&buf.as_slice()[..len])
            .map_err(|_| Error::Descriptor("unaligned device descriptor"))?;
        Ok(*desc)
    }

    /// One GET_DESCRIPTOR with the bounded retry policy: NAK/timeout and
    /// short reads retry up to [`DESC_RETRIES`] times; a stall or worse is
    /// fatal to the attempt immediately.
    fn get_descriptor(
        &self,
        kind: DescriptorKind,
        index: u8,
        length: u16,
        buf: &mut dyn DriverBuffer,
        what: &'static str,
    ) -> Result<usize, Error> {
        if buf.capacity() < usize::from(length) {
            return Err(Error::ResourceExhausted("transfer buffer capacity"));
        }
        let req = Setup::get_descriptor(kind, index, 0, length);
        let mut retries = 0;
        loop {
            match self.port.control_in(&req, buf) {
                Ok(n) if n >= usize::from(length) => return Ok(n),
                Ok(n) => {
                    if retries >= DESC_RETRIES {
                        return Err(Error::DataIntegrity("short descriptor read"));
                    }
                    retries += 1;
                    debug!(
                        "port {}: short {} read ({} < {}), retry {}/{}",
                        self.port.id(),
                        what,
                        n,
                        length,
                        retries,
                        DESC_RETRIES
                    );
                }
                Err(TransferError::Nak) => {
                    if retries >= DESC_RETRIES {
                        return Err(Error::TransientBus);
                    }
                    retries += 1;
                    debug!(
                        "port {}: {} NAKed, retry {}/{}",
                        self.port.id(),
                        what,
                        retries,
                        DESC_RETRIES
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Identities to probe, most authoritative first: the device-level triple
/// when the device declares one, then the first interface of the first
/// configuration for devices that defer class identity (or whose
/// device-level identity no registration claims).
fn identity_candidates(desc: &DevDesc) -> SmallVec<[ClassId; 2]> {
    let mut candidates = SmallVec::new();
    if desc.class != 0 {
        candidates.push(ClassId {
            class: desc.class,
            sub_class: desc.sub_class,
            protocol: desc.protocol,
            vendor: desc.vendor,
            product: desc.product,
        });
    }
    if let Some(if_desc) = desc
        .config_descs
        .first()
        .and_then(|conf| conf.interface_descs.first())
    {
        candidates.push(ClassId {
            class: if_desc.class,
            sub_class: if_desc.sub_class,
            protocol: if_desc.protocol,
            vendor: desc.vendor,
            product: desc.product,
        });
    }
    if candidates.is_empty() {
        // No device-level class and a configuration without interfaces;
        // probe the all-zero identity so vendor overrides can still claim it.
        candidates.push(ClassId {
            class: 0,
            sub_class: 0,
            protocol: 0,
            vendor: desc.vendor,
            product: desc.product,
        });
    }
    candidates
}

/// The per-controller root-port set and the entry point the connection
/// monitor calls after it observes an attach.
///
/// The monitor's wait-for-change primitive stays with the controller
/// driver; this type owns the topology side: one [`HubPort`] per root port,
/// created up front, each carrying its own address pool.
pub struct UsbHost {
    driver: Arc<dyn HostController>,
    roots: Vec<Arc<HubPort>>,
}

impl UsbHost {
    /// Builds the root-port records for a controller with `root_ports`
    /// ports, numbered 1..=root_ports.
    pub fn new(driver: Arc<dyn HostController>, root_ports: u8) -> Self {
        let roots = (1..=root_ports)
            .map(|n| HubPort::new_root(driver.clone(), n))
            .collect();
        Self { driver, roots }
    }

    pub fn driver(&self) -> &Arc<dyn HostController> {
        &self.driver
    }

    pub fn root_ports(&self) -> usize {
        self.roots.len()
    }

    /// The root port at `index` (0-based, matching the connection monitor's
    /// port indexing).
    pub fn root_port(&self, index: usize) -> Option<&Arc<HubPort>> {
        self.roots.get(index)
    }

    /// Enumerates the device attached on root port `index`.
    pub fn enumerate(&self, index: usize) -> Result<ClassBinding, EnumerateError> {
        let port = self
            .roots
            .get(index)
            .expect("root port index out of range");
        enumerate_port(port)
    }

    /// Tears down root port `index` after a disconnect: releases its
    /// address and ep0 and invalidates any outstanding binding.
    pub fn detach(&self, index: usize) {
        let port = self
            .roots
            .get(index)
            .expect("root port index out of range");
        port.detach();
    }
}
