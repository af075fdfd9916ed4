use std::fmt;

/// Opaque handle to the USB host controller instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HostHandle(pub usize);

/// Opaque handle to an enumerated USB device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub usize);

/// Opaque handle to a matched interface of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InterfaceHandle(pub usize);

/// Opaque handle returned by [DfuClass::init].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassHandle(pub usize);

/// Non-success status reported by the host stack, either synchronously when
/// issuing a request or asynchronously in a completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbError {
    Stall,
    Timeout,
    Disconnected,
    Busy,
    InvalidHandle,
    NotSupported,
    Io,
}

impl std::error::Error for UsbError {}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::Stall => write!(f, "endpoint stalled"),
            UsbError::Timeout => write!(f, "transaction timed out"),
            UsbError::Disconnected => write!(f, "device disconnected"),
            UsbError::Busy => write!(f, "host controller busy"),
            UsbError::InvalidHandle => write!(f, "invalid handle"),
            UsbError::NotSupported => write!(f, "not supported"),
            UsbError::Io => write!(f, "I/O error"),
        }
    }
}

/// Asynchronous class operations. At most one is in flight per controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    SetInterface,
    GetStatus,
    Dnload,
    Upload,
    Detach,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::SetInterface => "SET_INTERFACE",
            Operation::GetStatus => "GET_STATUS",
            Operation::Dnload => "DNLOAD",
            Operation::Upload => "UPLOAD",
            Operation::Detach => "DETACH",
        };
        f.write_str(name)
    }
}

/// Completion of an asynchronous class operation.
///
/// Called from whatever context the host stack completes transactions on.
/// On success it receives the bytes returned by the device (empty for
/// host-to-device requests).
pub type Completion =
    Box<dyn FnOnce(Result<Vec<u8>, UsbError>) + Send + 'static>;

/// DFU 1.1 class driver primitives of the host stack.
///
/// Every asynchronous call returns immediately. `Ok(())` means the request
/// was queued and `done` will be called exactly once; on `Err` the
/// completion is dropped without being called.
pub trait DfuClass {
    fn init(&mut self, device: DeviceHandle) -> Result<ClassHandle, UsbError>;

    fn set_interface(
        &mut self,
        class: ClassHandle,
        interface: InterfaceHandle,
        alt_setting: u8,
        done: Completion,
    ) -> Result<(), UsbError>;

    /// `data` is copied before returning. An empty `data` is the
    /// zero-length request that ends the download.
    fn dnload(
        &mut self,
        class: ClassHandle,
        block: u16,
        data: &[u8],
        done: Completion,
    ) -> Result<(), UsbError>;

    fn upload(
        &mut self,
        class: ClassHandle,
        block: u16,
        length: u16,
        done: Completion,
    ) -> Result<(), UsbError>;

    /// Completes with the 6-byte `DFU_GETSTATUS` reply.
    fn get_status(
        &mut self,
        class: ClassHandle,
        done: Completion,
    ) -> Result<(), UsbError>;

    fn detach(
        &mut self,
        class: ClassHandle,
        timeout_ms: u16,
        done: Completion,
    ) -> Result<(), UsbError>;

    fn deinit(
        &mut self,
        device: DeviceHandle,
        class: ClassHandle,
    ) -> Result<(), UsbError>;
}

/// Bus-level primitives of the host controller.
pub trait UsbHost {
    fn bus_reset(&mut self, host: HostHandle);
    fn trigger_re_enumeration(&mut self, device: DeviceHandle);
}
