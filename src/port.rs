//! The hub/port topology model.
//!
//! Every attached device hangs off a [`HubPort`]: either a root port built
//! into the host controller, or a downstream port of an external hub. Root
//! ports own the [`DevAddrPool`] for their whole sub-tree; downstream ports
//! reach it by walking their parent chain. The topology layer is purely
//! structural bookkeeping; it issues no transfers and knows nothing about
//! classes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::devaddr::DevAddrPool;
use crate::driver::{EndpointConfig, EndpointHandle, HostController, TransferError};
use crate::error::Error;
use crate::usb::Setup;

/// Hub-route identifier of a port: the 1-based root port number plus one
/// 4-bit component per hub tier below it, lowest tier first. Displays as
/// `2` for a root port or `2.1.3` for a device two hubs down. (The packed
/// route form follows USB 3.2 Section 8.9's route strings.)
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PortId {
    root_port: u8,
    route: u32,
}

/// Hubs cannot nest deeper than five tiers.
const MAX_HUB_DEPTH: u8 = 5;

impl PortId {
    pub fn root(root_port: u8) -> Self {
        Self {
            root_port,
            route: 0,
        }
    }

    pub fn root_port(&self) -> u8 {
        self.root_port
    }

    /// Number of hub tiers between this port and its root.
    pub fn depth(&self) -> u8 {
        let mut depth = 0;
        let mut route = self.route;
        while route != 0 {
            route >>= 4;
            depth += 1;
        }
        depth
    }

    /// The id of downstream port `port` (1-based) on a hub attached here.
    pub fn child(&self, port: u8) -> Result<Self, Error> {
        let depth = self.depth();
        if depth >= MAX_HUB_DEPTH {
            return Err(Error::Descriptor("hub chain too deep"));
        }
        if port == 0 || port & 0xF0 != 0 {
            return Err(Error::Descriptor("port number out of route range"));
        }
        Ok(Self {
            root_port: self.root_port,
            route: self.route | u32::from(port) << (depth * 4),
        })
    }

    /// The parent port id and the hub port number this id occupies on it.
    pub fn parent(&self) -> Option<(Self, u8)> {
        let parent_depth = self.depth().checked_sub(1)?;
        let shift = parent_depth * 4;
        let mask = 0xF << shift;
        Some((
            Self {
                root_port: self.root_port,
                route: self.route & !mask,
            },
            ((self.route & mask) >> shift) as u8,
        ))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root_port)?;
        let mut route = self.route;
        while route != 0 {
            write!(f, ".{}", route & 0xF)?;
            route >>= 4;
        }
        Ok(())
    }
}

/// Negotiated bus speed of the attached device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Speed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
}

enum PortLink {
    /// A root port; owns address generation for everything beneath it.
    Root { addrs: DevAddrPool },
    /// A downstream port of an external hub. The parent reference is weak;
    /// the hub's own teardown order decides when the chain breaks.
    Downstream { parent: Weak<HubPort> },
}

/// One physical attachment point.
///
/// The controller driver is shared, never owned; it outlives every port.
/// The attachment `generation` counts detaches: a [`crate::class::ClassBinding`]
/// snapshots it at creation and refuses to act once it has moved on, so a
/// stale binding can never reach a replacement device.
pub struct HubPort {
    driver: Arc<dyn HostController>,
    link: PortLink,
    id: PortId,
    ep0: Mutex<Option<EndpointHandle>>,
    funcaddr: Mutex<u8>,
    speed: Mutex<Speed>,
    generation: AtomicU64,
}

impl HubPort {
    /// Materializes a root port. Address 0, speed unknown, ep0 unallocated.
    pub fn new_root(driver: Arc<dyn HostController>, root_port: u8) -> Arc<Self> {
        Arc::new(Self {
            driver,
            link: PortLink::Root {
                addrs: DevAddrPool::new(),
            },
            id: PortId::root(root_port),
            ep0: Mutex::new(None),
            funcaddr: Mutex::new(0),
            speed: Mutex::new(Speed::Unknown),
            generation: AtomicU64::new(0),
        })
    }

    /// Materializes downstream port `port` (1-based) of the hub on `parent`.
    pub fn new_downstream(parent: &Arc<HubPort>, port: u8) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Self {
            driver: parent.driver.clone(),
            link: PortLink::Downstream {
                parent: Arc::downgrade(parent),
            },
            id: parent.id.child(port)?,
            ep0: Mutex::new(None),
            funcaddr: Mutex::new(0),
            speed: Mutex::new(Speed::Unknown),
            generation: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        matches!(self.link, PortLink::Root { .. })
    }

    pub fn driver(&self) -> &Arc<dyn HostController> {
        &self.driver
    }

    pub fn funcaddr(&self) -> u8 {
        *self.funcaddr.lock().unwrap()
    }

    pub fn speed(&self) -> Speed {
        *self.speed.lock().unwrap()
    }

    pub fn set_speed(&self, speed: Speed) {
        *self.speed.lock().unwrap() = speed;
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Runs `f` against the address pool of this port's root.
    ///
    /// Fails with `Disconnected` when a hub along the parent chain is
    /// already gone.
    fn with_addr_pool<R>(&self, f: impl FnOnce(&DevAddrPool) -> R) -> Result<R, Error> {
        match &self.link {
            PortLink::Root { addrs } => Ok(f(addrs)),
            PortLink::Downstream { parent } => {
                let parent = parent.upgrade().ok_or(Error::Disconnected)?;
                parent.with_addr_pool(f)
            }
        }
    }

    /// Allocates a function address from the root's pool and records it.
    /// The port must be unaddressed.
    pub(crate) fn assign_funcaddr(&self) -> Result<u8, Error> {
        let mut funcaddr = self.funcaddr.lock().unwrap();
        debug_assert_eq!(*funcaddr, 0, "port {} already addressed", self.id);
        let addr = self.with_addr_pool(|pool| pool.allocate())??;
        *funcaddr = addr;
        debug!("port {}: assigned function address {}", self.id, addr);
        Ok(addr)
    }

    /// Returns this port's function address, if any, to the root's pool.
    /// No-op for an unaddressed port.
    pub(crate) fn release_funcaddr(&self) {
        let mut funcaddr = self.funcaddr.lock().unwrap();
        if *funcaddr == 0 {
            return;
        }
        let addr = std::mem::replace(&mut *funcaddr, 0);
        match self.with_addr_pool(|pool| pool.release(addr)) {
            Ok(()) => debug!("port {}: released function address {}", self.id, addr),
            // The root went away with its whole pool; nothing to return to.
            Err(_) => warn!("port {}: root gone before address {} release", self.id, addr),
        }
    }

    /// Allocates the default control pipe if this port does not have one yet.
    pub(crate) fn ensure_ep0(&self) -> Result<(), Error> {
        let mut ep0 = self.ep0.lock().unwrap();
        if ep0.is_none() {
            *ep0 = Some(self.driver.ep_alloc(&EndpointConfig::ep0(self.id))?);
        }
        Ok(())
    }

    /// Reconfigures ep0 for a new function address or max packet size.
    pub(crate) fn ep0_configure(&self, funcaddr: u8, max_packet_size: u16) -> Result<(), Error> {
        let ep0 = self.ep0.lock().unwrap();
        let ep0 = ep0.as_ref().ok_or(Error::Disconnected)?;
        self.driver.ep0_configure(ep0, funcaddr, max_packet_size)
    }

    /// Control-IN on ep0. The endpoint lock is held for the duration of the
    /// transfer, so a second request cannot start before this one completes.
    pub(crate) fn control_in(
        &self,
        req: &Setup,
        buf: &mut dyn crate::driver::DriverBuffer,
    ) -> Result<usize, TransferError> {
        let ep0 = self.ep0.lock().unwrap();
        let ep0 = ep0.as_ref().ok_or(TransferError::Disconnected)?;
        self.driver.ctrl_in(ep0, req, buf)
    }

    /// Control-OUT on ep0, same single-outstanding discipline.
    pub(crate) fn control_out(
        &self,
        req: &Setup,
        buf: &dyn crate::driver::DriverBuffer,
    ) -> Result<(), TransferError> {
        let ep0 = self.ep0.lock().unwrap();
        let ep0 = ep0.as_ref().ok_or(TransferError::Disconnected)?;
        self.driver.ctrl_out(ep0, req, buf)
    }

    /// Tears down the attachment: bumps the generation (invalidating any
    /// binding created for the old device), returns the function address,
    /// frees ep0 and forgets the speed. The port record itself survives and
    /// can be enumerated again.
    pub fn detach(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.release_funcaddr();
        if let Some(ep0) = self.ep0.lock().unwrap().take() {
            self.driver.ep_free(ep0);
        }
        *self.speed.lock().unwrap() = Speed::Unknown;
        debug!("port {}: detached", self.id);
    }
}

impl fmt::Debug for HubPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubPort")
            .field("id", &self.id)
            .field("root", &self.is_root())
            .field("funcaddr", &self.funcaddr())
            .field("speed", &self.speed())
            .finish()
    }
}
