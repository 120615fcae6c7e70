//! The transfer facade implemented by a host-controller driver.
//!
//! Everything the enumeration core and class drivers do on the bus funnels
//! through [`HostController`]: endpoint allocation, transfer-safe buffer
//! allocation, blocking control and bulk/interrupt transfers, and the
//! non-blocking submit variant whose completion is delivered over a channel
//! from the controller's interrupt path.
//!
//! Only one transfer may be outstanding per endpoint. The core enforces this
//! for ep0 by holding the endpoint lock across each request
//! ([`crate::port::HubPort`]); class drivers own their other endpoints
//! exclusively.

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::error::Error;
use crate::port::PortId;
use crate::usb::{EndpDirection, EndpointTy, Setup};

/// Transfer-level error codes a controller driver reports.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Error)]
pub enum TransferError {
    /// Device NAK or timeout. Retriable; the whole transaction may be
    /// restarted.
    #[error("device NAK or timeout")]
    Nak,
    /// The endpoint halted. Requires a clear before the endpoint is used
    /// again.
    #[error("endpoint stalled")]
    Stall,
    /// TX or data-toggle error.
    #[error("data toggle or I/O error")]
    Io,
    /// Overrun.
    #[error("buffer overrun")]
    Overrun,
    /// The device was removed. A driver must complete any blocked transfer
    /// call with this code rather than hang when its disconnect path runs.
    #[error("device disconnected")]
    Disconnected,
}

/// An endpoint handle issued by `ep_alloc`. Opaque to this crate; the
/// controller driver maps it back to whatever it schedules transfers with.
///
/// Handles are owned: they are not cloneable and go back to the driver
/// through `ep_free`.
#[derive(Debug, Eq, Hash, PartialEq)]
pub struct EndpointHandle(u64);

impl EndpointHandle {
    /// Driver-side constructor.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Describes the endpoint to be allocated. Mirrors the fields of the
/// endpoint descriptor the class driver selected.
#[derive(Clone, Copy, Debug)]
pub struct EndpointConfig {
    /// Port the endpoint belongs to.
    pub port: PortId,
    /// Endpoint address including the direction bit.
    pub address: u8,
    pub ty: EndpointTy,
    pub direction: EndpDirection,
    /// Polling interval, interrupt/isoch only.
    pub interval: u8,
    pub max_packet_size: u16,
}

impl EndpointConfig {
    /// The default control pipe of a freshly attached, unaddressed device.
    pub fn ep0(port: PortId) -> Self {
        Self {
            port,
            address: 0,
            ty: EndpointTy::Ctrl,
            direction: EndpDirection::Bidirectional,
            interval: 0,
            max_packet_size: 8,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::RequestBuffer {}
    impl Sealed for super::IoBuffer {}
}

/// Memory a controller driver accepts for transfers.
///
/// Sealed: the only implementors are [`RequestBuffer`] and [`IoBuffer`],
/// which come out of the facade's own allocators. Some hardware can only
/// reach special transfer memory, so ordinary slices are not accepted.
pub trait DriverBuffer: sealed::Sealed + Send {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
    fn capacity(&self) -> usize;
}

/// A fixed-size buffer from the driver's request/descriptor pool.
///
/// The capacity is the pool's block size, an output of the allocation rather
/// than an input.
#[derive(Debug)]
pub struct RequestBuffer {
    data: Box<[u8]>,
}

impl RequestBuffer {
    /// Driver-side constructor; core code obtains buffers through
    /// [`HostController::alloc_request_buffer`].
    pub fn new(data: Box<[u8]>) -> Self {
        Self { data }
    }
}

impl DriverBuffer for RequestBuffer {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
    fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// A variable-size I/O buffer, for payloads larger than the request pool's
/// block size (full configuration descriptors, bulk data).
#[derive(Debug)]
pub struct IoBuffer {
    data: Box<[u8]>,
}

impl IoBuffer {
    /// Driver-side constructor; core code obtains buffers through
    /// [`HostController::alloc_io_buffer`].
    pub fn new(data: Box<[u8]>) -> Self {
        Self { data }
    }
}

impl DriverBuffer for IoBuffer {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
    fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Completion record of a non-blocking transfer. The buffer rides along so
/// ownership returns to the submitter.
#[derive(Debug)]
pub struct Completion {
    pub buffer: IoBuffer,
    pub result: Result<usize, TransferError>,
}

/// Sending half of the completion channel handed to [`HostController::submit`].
///
/// The send happens on the controller's interrupt or bottom-half path and
/// must not block; the channel should be buffered and the consumer drains it
/// on its own thread. Completion handlers never re-enter enumeration logic.
pub type CompletionSender = Sender<Completion>;

/// The contract a host-controller driver implements for this core.
///
/// Blocking methods park the calling thread until the transfer completes or
/// fails; they are never called from interrupt context.
pub trait HostController: Send + Sync {
    /// Reconfigures the default control pipe after the function address or
    /// learned max packet size changes.
    fn ep0_configure(
        &self,
        ep0: &EndpointHandle,
        funcaddr: u8,
        max_packet_size: u16,
    ) -> Result<(), Error>;

    /// Allocates and configures one endpoint.
    fn ep_alloc(&self, config: &EndpointConfig) -> Result<EndpointHandle, Error>;

    /// Frees an endpoint previously allocated with `ep_alloc`.
    fn ep_free(&self, ep: EndpointHandle);

    /// Allocates a block from the fixed-size request/descriptor pool.
    fn alloc_request_buffer(&self) -> Result<RequestBuffer, Error>;

    /// Allocates a variable-size I/O buffer of at least `len` bytes.
    fn alloc_io_buffer(&self, len: usize) -> Result<IoBuffer, Error>;

    /// Blocking control-IN transfer. Returns the number of bytes the device
    /// actually produced, which may be short of `req.length`.
    fn ctrl_in(
        &self,
        ep0: &EndpointHandle,
        req: &Setup,
        buf: &mut dyn DriverBuffer,
    ) -> Result<usize, TransferError>;

    /// Blocking control-OUT (or no-data) transfer.
    fn ctrl_out(
        &self,
        ep0: &EndpointHandle,
        req: &Setup,
        buf: &dyn DriverBuffer,
    ) -> Result<(), TransferError>;

    /// Blocking bulk or interrupt transfer of `len` bytes.
    fn transfer(
        &self,
        ep: &EndpointHandle,
        buf: &mut dyn DriverBuffer,
        len: usize,
        direction: EndpDirection,
    ) -> Result<usize, TransferError>;

    /// Non-blocking transfer. Returns once the transfer is queued; the
    /// completion, with the buffer, is sent on `done` from the interrupt
    /// completion path.
    fn submit(
        &self,
        ep: &EndpointHandle,
        buf: IoBuffer,
        len: usize,
        direction: EndpDirection,
        done: CompletionSender,
    ) -> Result<(), TransferError>;

    /// Called by the class layer when it hit an error and considers the
    /// device gone. The driver unblocks outstanding transfers on that port
    /// with [`TransferError::Disconnected`] and discards its own per-port
    /// state.
    fn disconnect_notify(&self, port: PortId);
}
