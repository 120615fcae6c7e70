//! The class registry and the port/class-driver binding.
//!
//! Class implementations register once at boot and are never removed; the
//! registry is a process-wide append-only table. Lookup scans in
//! registration order and the first matching entry wins. There is no
//! wildcard-specificity scoring: when two registrations could claim the same
//! identity, registration order decides.

use std::sync::{Arc, RwLock, Weak};
use std::{fmt, ptr};

use lazy_static::lazy_static;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;
use crate::port::{HubPort, PortId};

/// The identity a device presents: class triple plus vendor/product.
/// Extracted from the device descriptor, or from an interface descriptor
/// when the device defers class identity to its interfaces.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ClassId {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub vendor: u16,
    pub product: u16,
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "class {:02x}:{:02x}:{:02x} vid {:04x} pid {:04x}",
            self.class, self.sub_class, self.protocol, self.vendor, self.product
        )
    }
}

/// One entry of a registration's identity list. `None` fields are
/// wildcards: they match any probe value. A filter with every field
/// populated is a vendor-specific override for one exact product.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClassFilter {
    pub class: Option<u8>,
    pub sub_class: Option<u8>,
    pub protocol: Option<u8>,
    pub vendor: Option<u16>,
    pub product: Option<u16>,
}

impl ClassFilter {
    /// Matches everything. A catch-all registration should come last.
    pub const fn any() -> Self {
        Self {
            class: None,
            sub_class: None,
            protocol: None,
            vendor: None,
            product: None,
        }
    }

    /// Every populated field must equal the probe; wildcards are skipped.
    pub fn matches(&self, id: &ClassId) -> bool {
        fn field<T: Eq>(filter: Option<T>, probe: T) -> bool {
            match filter {
                Some(want) => want == probe,
                None => true,
            }
        }
        field(self.class, id.class)
            && field(self.sub_class, id.sub_class)
            && field(self.protocol, id.protocol)
            && field(self.vendor, id.vendor)
            && field(self.product, id.product)
    }
}

/// Creates class-driver instances for matched devices. One factory serves
/// any number of simultaneously connected devices.
pub trait ClassFactory: Send + Sync {
    fn create(&self, port: &Arc<HubPort>, id: &ClassId) -> Result<Box<dyn ClassDriver>, Error>;
}

/// A registered class implementation. Supplied from the caller's persistent
/// storage (a `static`); the registry links to it without copying.
pub struct ClassRegistration {
    pub name: &'static str,
    pub ids: &'static [ClassFilter],
    pub factory: &'static (dyn ClassFactory),
}

impl fmt::Debug for ClassRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistration")
            .field("name", &self.name)
            .field("ids", &self.ids)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The same registration record was passed twice. A contract violation
    /// by boot wiring, not a runtime condition.
    #[error("class {0:?} is already registered")]
    AlreadyRegistered(&'static str),
}

lazy_static! {
    static ref REGISTRY: RwLock<Vec<&'static ClassRegistration>> = RwLock::new(Vec::new());
}

/// Adds a class implementation to the process-wide registry. Called once
/// per class at boot.
pub fn register(registration: &'static ClassRegistration) -> Result<(), RegistryError> {
    let mut registry = REGISTRY.write().unwrap();
    if registry.iter().any(|reg| ptr::eq(*reg, registration)) {
        return Err(RegistryError::AlreadyRegistered(registration.name));
    }
    info!("registered class driver {:?}", registration.name);
    registry.push(registration);
    Ok(())
}

/// Finds the first registration, in registration order, with an identity
/// entry matching `id`. `None` is "no driver", not an error.
pub fn find_match(id: &ClassId) -> Option<&'static ClassRegistration> {
    let registry = REGISTRY.read().unwrap();
    registry
        .iter()
        .find(|reg| reg.ids.iter().any(|filter| filter.matches(id)))
        .copied()
}

/// The driver side of a binding, implemented by each class (mass storage,
/// HID, hub, ...).
pub trait ClassDriver: Send {
    /// Hands the class the raw configuration descriptor so it can pick its
    /// interface and endpoints. Called once, on the enumeration thread.
    fn connect(&mut self, config_desc: &[u8]) -> Result<(), Error>;

    /// The device is gone; release everything. Never called from interrupt
    /// context.
    fn disconnected(&mut self) -> Result<(), Error>;
}

/// The live pairing of a port and an instantiated class driver.
///
/// Owns the driver instance; holds the port weakly, because the port's
/// driver decides teardown order. The binding snapshots the port's
/// attachment generation at creation and goes stale when the port detaches:
/// a stale binding refuses further use with `Disconnected` rather than
/// touching whatever device got plugged in next.
pub struct ClassBinding {
    port: Weak<HubPort>,
    port_id: PortId,
    generation: u64,
    driver: Box<dyn ClassDriver>,
    connected: bool,
}

impl ClassBinding {
    pub(crate) fn new(port: &Arc<HubPort>, driver: Box<dyn ClassDriver>) -> Self {
        Self {
            port: Arc::downgrade(port),
            port_id: port.id(),
            generation: port.generation(),
            driver,
            connected: false,
        }
    }

    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The port this binding is attached to, while the attachment that
    /// created the binding is still live.
    pub fn port(&self) -> Result<Arc<HubPort>, Error> {
        let port = self.port.upgrade().ok_or(Error::Disconnected)?;
        if port.generation() != self.generation {
            return Err(Error::Disconnected);
        }
        Ok(port)
    }

    /// Delivers the configuration descriptor to the class driver.
    ///
    /// On failure the binding stays valid; the caller decides whether to
    /// disconnect it.
    pub(crate) fn connect(&mut self, config_desc: &[u8]) -> Result<(), Error> {
        self.port()?;
        self.driver.connect(config_desc)?;
        self.connected = true;
        debug!("port {}: class driver connected", self.port_id);
        Ok(())
    }

    /// Tells the class driver the device is gone and consumes the binding.
    pub fn disconnect(mut self) -> Result<(), Error> {
        self.connected = false;
        debug!("port {}: class driver disconnected", self.port_id);
        self.driver.disconnected()
    }
}

impl fmt::Debug for ClassBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassBinding")
            .field("port", &self.port_id)
            .field("generation", &self.generation)
            .field("connected", &self.connected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE: ClassId = ClassId {
        class: 0x08,
        sub_class: 0x06,
        protocol: 0x50,
        vendor: 0x1234,
        product: 0x5678,
    };

    #[test]
    fn populated_fields_must_agree() {
        let exact = ClassFilter {
            class: Some(0x08),
            sub_class: Some(0x06),
            protocol: Some(0x50),
            vendor: Some(0x1234),
            product: Some(0x5678),
        };
        assert!(exact.matches(&PROBE));

        let wrong_protocol = ClassFilter {
            protocol: Some(0x51),
            ..exact
        };
        assert!(!wrong_protocol.matches(&PROBE));
    }

    #[test]
    fn wildcards_never_reject() {
        assert!(ClassFilter::any().matches(&PROBE));

        let base_only = ClassFilter {
            class: Some(0x08),
            ..ClassFilter::any()
        };
        assert!(base_only.matches(&PROBE));

        let vendor_override = ClassFilter {
            vendor: Some(0x1234),
            product: Some(0x5678),
            ..ClassFilter::any()
        };
        assert!(vendor_override.matches(&PROBE));
    }

    #[test]
    fn first_registered_wins() {
        struct NullFactory;
        impl ClassFactory for NullFactory {
            fn create(
                &self,
                _port: &Arc<HubPort>,
                _id: &ClassId,
            ) -> Result<Box<dyn ClassDriver>, Error> {
                unreachable!("lookup test never instantiates")
            }
        }
        static FACTORY: NullFactory = NullFactory;
        // Both filters match the same vendor-specific probe; the one
        // registered first must win regardless of specificity.
        static WIDE: ClassRegistration = ClassRegistration {
            name: "tie-wide",
            ids: &[ClassFilter {
                class: Some(0xE0),
                ..ClassFilter::any()
            }],
            factory: &FACTORY,
        };
        static NARROW: ClassRegistration = ClassRegistration {
            name: "tie-narrow",
            ids: &[ClassFilter {
                class: Some(0xE0),
                sub_class: Some(0x01),
                protocol: Some(0x01),
                ..ClassFilter::any()
            }],
            factory: &FACTORY,
        };

        register(&WIDE).unwrap();
        register(&NARROW).unwrap();
        assert!(matches!(
            register(&WIDE),
            Err(RegistryError::AlreadyRegistered("tie-wide"))
        ));

        let probe = ClassId {
            class: 0xE0,
            sub_class: 0x01,
            protocol: 0x01,
            vendor: 0,
            product: 0,
        };
        let reg = find_match(&probe).unwrap();
        assert_eq!(reg.name, "tie-wide");

        let miss = ClassId {
            class: 0xE1,
            sub_class: 0,
            protocol: 0,
            vendor: 0,
            product: 0,
        };
        assert!(find_match(&miss).is_none());
    }
}
