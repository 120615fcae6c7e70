//! End-to-end enumeration against a scripted mock controller.
//!
//! The mock plays one attached device: it serves descriptors over the
//! control pipe and can be told to NAK, stall, or disconnect at a chosen
//! point so every terminal outcome of the state machine is reachable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use usbhost::driver::{
    Completion, CompletionSender, DriverBuffer, EndpointConfig, EndpointHandle, HostController,
    IoBuffer, RequestBuffer, TransferError,
};
use usbhost::usb::{EndpDirection, Setup};
use usbhost::{
    ClassBinding, ClassDriver, ClassFactory, ClassFilter, ClassId, ClassRegistration,
    EnumerateError, Error, HubPort, PortId, UsbHost,
};

const GET_DESCRIPTOR: u8 = 0x06;
const SET_ADDRESS: u8 = 0x05;

const KIND_DEVICE: u8 = 1;
const KIND_CONFIGURATION: u8 = 2;

fn device_desc(class: (u8, u8, u8), vendor: u16, product: u16, mps: u8) -> Vec<u8> {
    let mut desc = vec![18, KIND_DEVICE, 0x00, 0x02, class.0, class.1, class.2, mps];
    desc.extend_from_slice(&vendor.to_le_bytes());
    desc.extend_from_slice(&product.to_le_bytes());
    desc.extend_from_slice(&[0x01, 0x00]); // bcdDevice
    desc.extend_from_slice(&[0, 0, 0]); // string indexes
    desc.push(1); // bNumConfigurations
    desc
}

fn msc_config_desc() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[9, 2, 0, 0, 1, 1, 0, 0xC0, 50]);
    // Mass-storage SCSI bulk-only interface.
    buf.extend_from_slice(&[9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0]);
    buf.extend_from_slice(&[7, 5, 0x81, 0x02, 0x00, 0x02, 0]);
    buf.extend_from_slice(&[7, 5, 0x02, 0x02, 0x00, 0x02, 0]);
    let total = buf.len() as u16;
    buf[2..4].copy_from_slice(&total.to_le_bytes());
    buf
}

#[derive(Default)]
struct Script {
    /// Stall every configuration-descriptor read.
    stall_config: bool,
    /// NAK the first N control-IN transfers.
    nak_first: u32,
    /// Complete the Nth (1-based) and every later control transfer with
    /// `Disconnected`, as the facade does when the device is unplugged
    /// while a transfer is blocked.
    disconnect_at: Option<u32>,
}

#[derive(Default)]
struct MockState {
    ctrl_transfers: u32,
    naks_left: u32,
    set_addresses: Vec<u8>,
    ep0_configs: Vec<(u8, u16)>,
    endpoints_alive: u32,
    next_endpoint: u64,
}

struct MockController {
    dev_desc: Vec<u8>,
    config: Vec<u8>,
    script: Mutex<Script>,
    state: Mutex<MockState>,
}

impl MockController {
    fn new(dev_desc: Vec<u8>, config: Vec<u8>, script: Script) -> Arc<Self> {
        let naks = script.nak_first;
        Arc::new(Self {
            dev_desc,
            config,
            script: Mutex::new(script),
            state: Mutex::new(MockState {
                naks_left: naks,
                ..MockState::default()
            }),
        })
    }

    fn set_stall_config(&self, stall: bool) {
        self.script.lock().unwrap().stall_config = stall;
    }

    fn set_addresses(&self) -> Vec<u8> {
        self.state.lock().unwrap().set_addresses.clone()
    }

    fn endpoints_alive(&self) -> u32 {
        self.state.lock().unwrap().endpoints_alive
    }

    /// Counts the transfer and reports whether the scripted disconnect has
    /// been reached.
    fn disconnected(&self, state: &mut MockState) -> bool {
        state.ctrl_transfers += 1;
        match self.script.lock().unwrap().disconnect_at {
            Some(at) => state.ctrl_transfers >= at,
            None => false,
        }
    }
}

impl HostController for MockController {
    fn ep0_configure(
        &self,
        _ep0: &EndpointHandle,
        funcaddr: u8,
        max_packet_size: u16,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.ep0_configs.push((funcaddr, max_packet_size));
        Ok(())
    }

    fn ep_alloc(&self, _config: &EndpointConfig) -> Result<EndpointHandle, Error> {
        let mut state = self.state.lock().unwrap();
        state.endpoints_alive += 1;
        state.next_endpoint += 1;
        Ok(EndpointHandle::new(state.next_endpoint))
    }

    fn ep_free(&self, _ep: EndpointHandle) {
        self.state.lock().unwrap().endpoints_alive -= 1;
    }

    fn alloc_request_buffer(&self) -> Result<RequestBuffer, Error> {
        Ok(RequestBuffer::new(vec![0; 64].into_boxed_slice()))
    }

    fn alloc_io_buffer(&self, len: usize) -> Result<IoBuffer, Error> {
        Ok(IoBuffer::new(vec![0; len].into_boxed_slice()))
    }

    fn ctrl_in(
        &self,
        _ep0: &EndpointHandle,
        req: &Setup,
        buf: &mut dyn DriverBuffer,
    ) -> Result<usize, TransferError> {
        let mut state = self.state.lock().unwrap();
        if self.disconnected(&mut state) {
            return Err(TransferError::Disconnected);
        }
        if state.naks_left > 0 {
            state.naks_left -= 1;
            return Err(TransferError::Nak);
        }

        let request = req.request;
        let value = req.value;
        let length = usize::from(req.length);
        assert_eq!(request, GET_DESCRIPTOR, "unexpected control-IN request");

        let data = match (value >> 8) as u8 {
            KIND_DEVICE => &self.dev_desc,
            KIND_CONFIGURATION => {
                if self.script.lock().unwrap().stall_config {
                    return Err(TransferError::Stall);
                }
                &self.config
            }
            other => panic!("unexpected descriptor kind {}", other),
        };

        let n = length.min(data.len());
        buf.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn ctrl_out(
        &self,
        _ep0: &EndpointHandle,
        req: &Setup,
        _buf: &dyn DriverBuffer,
    ) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        if self.disconnected(&mut state) {
            return Err(TransferError::Disconnected);
        }
        let request = req.request;
        let value = req.value;
        assert_eq!(request, SET_ADDRESS, "unexpected control-OUT request");
        state.set_addresses.push(value as u8);
        Ok(())
    }

    fn transfer(
        &self,
        _ep: &EndpointHandle,
        buf: &mut dyn DriverBuffer,
        len: usize,
        direction: EndpDirection,
    ) -> Result<usize, TransferError> {
        if direction == EndpDirection::In {
            for (i, byte) in buf.as_mut_slice()[..len].iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
        Ok(len)
    }

    fn submit(
        &self,
        _ep: &EndpointHandle,
        mut buf: IoBuffer,
        len: usize,
        direction: EndpDirection,
        done: CompletionSender,
    ) -> Result<(), TransferError> {
        if direction == EndpDirection::In {
            for (i, byte) in buf.as_mut_slice()[..len].iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
        done.send(Completion {
            buffer: buf,
            result: Ok(len),
        })
        .expect("completion channel closed");
        Ok(())
    }

    fn disconnect_notify(&self, _port: PortId) {
        self.script.lock().unwrap().disconnect_at = Some(0);
    }
}

// Mass-storage class registration used by the happy-path tests.

static MSC_CONFIG_LEN: AtomicUsize = AtomicUsize::new(0);

struct MscDriver;
impl ClassDriver for MscDriver {
    fn connect(&mut self, config_desc: &[u8]) -> Result<(), Error> {
        MSC_CONFIG_LEN.store(config_desc.len(), Ordering::SeqCst);
        Ok(())
    }
    fn disconnected(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

struct MscFactory;
impl ClassFactory for MscFactory {
    fn create(&self, _port: &Arc<HubPort>, id: &ClassId) -> Result<Box<dyn ClassDriver>, Error> {
        assert_eq!(id.class, 0x08);
        Ok(Box::new(MscDriver))
    }
}

static MSC_FACTORY: MscFactory = MscFactory;
static MSC_REG: ClassRegistration = ClassRegistration {
    name: "usb-msc",
    ids: &[ClassFilter {
        class: Some(0x08),
        sub_class: Some(0x06),
        protocol: Some(0x50),
        vendor: None,
        product: None,
    }],
    factory: &MSC_FACTORY,
};

fn register_msc() {
    // Tests share the process-wide registry; a second registration of the
    // same record is expected to be refused.
    let _ = usbhost::register(&MSC_REG);
}

// A vendor-specific registration whose driver refuses to connect.

static REJECT_DISCONNECTED: AtomicBool = AtomicBool::new(false);

struct RejectingDriver;
impl ClassDriver for RejectingDriver {
    fn connect(&mut self, _config_desc: &[u8]) -> Result<(), Error> {
        Err(Error::ResourceExhausted("class endpoint"))
    }
    fn disconnected(&mut self) -> Result<(), Error> {
        REJECT_DISCONNECTED.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct RejectingFactory;
impl ClassFactory for RejectingFactory {
    fn create(&self, _port: &Arc<HubPort>, _id: &ClassId) -> Result<Box<dyn ClassDriver>, Error> {
        Ok(Box::new(RejectingDriver))
    }
}

static REJECTING_FACTORY: RejectingFactory = RejectingFactory;
static REJECTING_REG: ClassRegistration = ClassRegistration {
    name: "vendor-reject",
    ids: &[ClassFilter {
        vendor: Some(0xDEAD),
        product: Some(0xBEEF),
        ..ClassFilter::any()
    }],
    factory: &REJECTING_FACTORY,
};

fn vendor_device() -> (Vec<u8>, Vec<u8>) {
    // Vendor-specific device class; identity resolves via the interface.
    (
        device_desc((0xFF, 0x00, 0x00), 0x1234, 0x5678, 64),
        msc_config_desc(),
    )
}

#[test]
fn vendor_device_binds_via_interface_identity() {
    register_msc();
    let (dev, config) = vendor_device();
    let config_len = config.len();
    let mock = MockController::new(dev, config, Script::default());
    let host = UsbHost::new(mock.clone(), 1);

    let binding = host.enumerate(0).expect("enumeration should succeed");
    assert!(binding.is_connected());
    assert_eq!(binding.port_id().to_string(), "1");
    assert_eq!(MSC_CONFIG_LEN.load(Ordering::SeqCst), config_len);

    // The device got the lowest address and ep0 followed it with the
    // descriptor-reported packet size.
    assert_eq!(mock.set_addresses(), vec![1]);
    let port = host.root_port(0).unwrap();
    assert_eq!(port.funcaddr(), 1);
    let configs = mock.state.lock().unwrap().ep0_configs.clone();
    assert_eq!(configs, vec![(0, 8), (1, 64)]);
}

#[test]
fn stall_on_config_descriptor_fails_and_releases_address() {
    register_msc();
    let (dev, config) = vendor_device();
    let mock = MockController::new(
        dev,
        config,
        Script {
            stall_config: true,
            ..Script::default()
        },
    );
    let host = UsbHost::new(mock.clone(), 1);

    let err = host.enumerate(0).unwrap_err();
    assert!(matches!(err, EnumerateError::Failed(Error::Stall)));
    let port = host.root_port(0).unwrap();
    assert_eq!(port.funcaddr(), 0, "failed enumeration must release the address");

    // The port is left re-enumerable: once the device behaves, the same
    // (lowest) address is handed out again.
    mock.set_stall_config(false);
    let binding = host.enumerate(0).expect("re-enumeration should succeed");
    assert!(binding.is_connected());
    assert_eq!(mock.set_addresses(), vec![1, 1]);
}

#[test]
fn unmatched_identity_reports_no_class_driver_without_leaking() {
    // Nothing registers class 0xF0, neither at the device level nor for
    // the (also rewritten) interface.
    let dev = device_desc((0xF0, 0x01, 0x02), 0x0666, 0x0001, 8);
    let mut config = msc_config_desc();
    config[14] = 0xF0; // interface class
    let mock = MockController::new(dev, config, Script::default());
    let host = UsbHost::new(mock.clone(), 1);

    let err = host.enumerate(0).unwrap_err();
    match err {
        EnumerateError::Failed(Error::NoClassDriver(id)) => {
            assert_eq!(id.class, 0xF0);
            assert_eq!(id.vendor, 0x0666);
        }
        other => panic!("expected NoClassDriver, got {:?}", other),
    }
    assert_eq!(
        host.root_port(0).unwrap().funcaddr(),
        0,
        "address must be released even though no binding was created"
    );
}

#[test]
fn disconnect_aborts_from_any_phase() {
    register_msc();
    // Transfer order: dev8 IN, SET_ADDRESS OUT, device IN, config header
    // IN, full config IN. Cut the sequence at several points.
    for (disconnect_at, addressed) in [(1, false), (2, false), (3, true), (5, true)] {
        let (dev, config) = vendor_device();
        let mock = MockController::new(
            dev,
            config,
            Script {
                disconnect_at: Some(disconnect_at),
                ..Script::default()
            },
        );
        let host = UsbHost::new(mock.clone(), 1);

        let err = host.enumerate(0).unwrap_err();
        assert!(
            matches!(err, EnumerateError::Failed(Error::Disconnected)),
            "cut at transfer {}: {:?}",
            disconnect_at,
            err
        );
        assert_eq!(host.root_port(0).unwrap().funcaddr(), 0);
        // SET_ADDRESS may or may not have happened before the cut.
        assert_eq!(mock.set_addresses().len(), usize::from(addressed));
    }
}

#[test]
fn nak_retries_are_bounded() {
    register_msc();
    // Two NAKs stay inside the retry bound.
    let (dev, config) = vendor_device();
    let mock = MockController::new(
        dev,
        config,
        Script {
            nak_first: 2,
            ..Script::default()
        },
    );
    let host = UsbHost::new(mock, 1);
    assert!(host.enumerate(0).is_ok());

    // A device that never stops NAKing exhausts the bound.
    let (dev, config) = vendor_device();
    let mock = MockController::new(
        dev,
        config,
        Script {
            nak_first: 16,
            ..Script::default()
        },
    );
    let host = UsbHost::new(mock, 1);
    let err = host.enumerate(0).unwrap_err();
    assert!(matches!(err, EnumerateError::Failed(Error::TransientBus)));
}

#[test]
fn connect_failure_hands_the_binding_back() {
    usbhost::register(&REJECTING_REG).unwrap();
    let dev = device_desc((0xFF, 0x00, 0x00), 0xDEAD, 0xBEEF, 64);
    let mock = MockController::new(dev, msc_config_desc(), Script::default());
    let host = UsbHost::new(mock, 1);

    let err = host.enumerate(0).unwrap_err();
    let binding: ClassBinding = match err {
        EnumerateError::ConnectFailed { binding, source } => {
            assert!(matches!(source, Error::ResourceExhausted(_)));
            binding
        }
        other => panic!("expected ConnectFailed, got {:?}", other),
    };

    // The binding is still valid and the device keeps its address until the
    // caller disconnects.
    assert!(!binding.is_connected());
    assert!(binding.port().is_ok());
    let port = host.root_port(0).unwrap().clone();
    assert_eq!(port.funcaddr(), 1);

    // After the port detaches, the stale binding refuses further use but
    // can still be disconnected to release the class driver.
    host.detach(0);
    assert!(matches!(binding.port(), Err(Error::Disconnected)));
    binding.disconnect().unwrap();
    assert!(REJECT_DISCONNECTED.load(Ordering::SeqCst));
    assert_eq!(port.funcaddr(), 0);
}

#[test]
fn detaching_a_never_addressed_port_is_a_noop() {
    register_msc();
    let (dev, config) = vendor_device();
    let mock = MockController::new(dev, config, Script::default());
    let host = UsbHost::new(mock.clone(), 1);

    // Nothing was enumerated; detach must not disturb the allocator.
    host.detach(0);
    host.detach(0);
    assert_eq!(host.root_port(0).unwrap().funcaddr(), 0);

    // The first enumeration afterwards still gets the lowest address.
    let binding = host.enumerate(0).expect("enumeration should succeed");
    assert_eq!(mock.set_addresses(), vec![1]);
    drop(binding);
}

#[test]
fn detach_frees_the_control_endpoint() {
    register_msc();
    let (dev, config) = vendor_device();
    let mock = MockController::new(dev, config, Script::default());
    let host = UsbHost::new(mock.clone(), 1);

    let binding = host.enumerate(0).expect("enumeration should succeed");
    assert_eq!(mock.endpoints_alive(), 1);
    host.detach(0);
    assert_eq!(mock.endpoints_alive(), 0);
    assert!(matches!(binding.port(), Err(Error::Disconnected)));
}

#[test]
fn async_submit_completes_over_the_channel() {
    let (dev, config) = vendor_device();
    let mock = MockController::new(dev, config, Script::default());

    let ep = mock
        .ep_alloc(&EndpointConfig::ep0(PortId::root(1)))
        .unwrap();
    let buf = mock.alloc_io_buffer(16).unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    mock.submit(&ep, buf, 16, EndpDirection::In, tx).unwrap();

    let completion = rx.recv().expect("completion must arrive");
    assert_eq!(completion.result.unwrap(), 16);
    assert_eq!(completion.buffer.as_slice()[..4], [0, 1, 2, 3]);
}
