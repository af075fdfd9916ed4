//! DFU class primitives on top of [`nusb`] control transfers.
//!
//! Each asynchronous request runs on its own short-lived thread which calls
//! the completion when the transfer finishes, so the controller's worker
//! never waits on the bus.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError},
};

use dfu::{
    ClassHandle, Completion, Configuration, ControlRequest, DFU_CLASS,
    DFU_STATE_DFU_IDLE, DFU_SUBCLASS, DeviceHandle, DfuClass, DfuDescriptor,
    DfuStatus, HostHandle, InterfaceDescriptor, InterfaceHandle, Operation,
    UsbError, UsbHost,
};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);

/// A desktop host has a single bus as far as the controller is concerned.
pub(crate) const HOST: HostHandle = HostHandle(0);
pub(crate) const DEVICE: DeviceHandle = DeviceHandle(0);

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

pub(crate) fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<nusb::DeviceInfo>, nusb::Error> {
    Ok(nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect())
}

/// Interfaces of the first configuration, and the DFU functional
/// descriptor if the device has one.
pub(crate) fn describe(
    device: &nusb::Device,
) -> (Configuration, Option<DfuDescriptor>) {
    let mut configuration = Configuration::default();
    let mut descriptor = None;
    if let Some(config) = device.configurations().next() {
        for alt in config.interface_alt_settings() {
            if alt.alternate_setting() != 0 {
                continue;
            }
            configuration.interfaces.push(InterfaceDescriptor {
                handle: InterfaceHandle(alt.interface_number() as usize),
                number: alt.interface_number(),
                alternate_setting: alt.alternate_setting(),
                class: alt.class(),
                subclass: alt.subclass(),
                protocol: alt.protocol(),
            });
            if descriptor.is_none() {
                descriptor =
                    alt.descriptors().find_map(|d| DfuDescriptor::parse(&d));
            }
        }
    }
    (configuration, descriptor)
}

fn transfer_error(err: TransferError) -> UsbError {
    match err {
        TransferError::Stall => UsbError::Stall,
        TransferError::Disconnected => UsbError::Disconnected,
        TransferError::Cancelled => UsbError::Timeout,
        _ => UsbError::Io,
    }
}

fn usb_error(err: nusb::Error) -> UsbError {
    debug!("USB error: {}", err);
    UsbError::Io
}

fn control_out(
    interface: &nusb::Interface,
    req: ControlRequest,
    data: &[u8],
) -> Result<Vec<u8>, UsbError> {
    interface
        .control_out(
            ControlOut {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: req.request,
                value: req.value,
                index: req.index,
                data,
            },
            DEFAULT_TIMEOUT,
        )
        .wait()
        .map(|()| Vec::new())
        .map_err(transfer_error)
}

fn control_in(
    interface: &nusb::Interface,
    req: ControlRequest,
) -> Result<Vec<u8>, UsbError> {
    interface
        .control_in(
            ControlIn {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: req.request,
                value: req.value,
                index: req.index,
                length: req.length,
            },
            DEFAULT_TIMEOUT,
        )
        .wait()
        .map_err(transfer_error)
}

/// Leave any error or unfinished transfer from a previous session.
fn reset_state(
    interface: &nusb::Interface,
    number: u8,
) -> Result<(), UsbError> {
    let get_status = || {
        let data = control_in(interface, ControlRequest::get_status(number))?;
        DfuStatus::parse(&data).map_err(|_| UsbError::Io)
    };
    let mut st = get_status()?;
    if st.status() != 0 {
        control_out(interface, ControlRequest::clear_status(number), &[])?;
        st = get_status()?;
    }
    if st.state() != DFU_STATE_DFU_IDLE {
        control_out(interface, ControlRequest::abort(number), &[])?;
    }
    Ok(())
}

/// Interface claimed by the `SET_INTERFACE` transfer thread.
type Claimed = Arc<Mutex<Option<(u8, nusb::Interface)>>>;

fn lock(claimed: &Claimed) -> MutexGuard<'_, Option<(u8, nusb::Interface)>> {
    claimed.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn(
    operation: Operation,
    done: Completion,
    job: impl FnOnce() -> Result<Vec<u8>, UsbError> + Send + 'static,
) -> Result<(), UsbError> {
    thread::Builder::new()
        .name(format!("usb {operation}"))
        .spawn(move || done(job()))
        .map(|_| ())
        .map_err(|err| {
            warn!("cannot start {} transfer: {}", operation, err);
            UsbError::Busy
        })
}

pub(crate) struct NusbClass {
    device: nusb::Device,
    interface: Claimed,
    class: Option<ClassHandle>,
    next_class: usize,
}

impl NusbClass {
    pub(crate) fn new(device: nusb::Device) -> Self {
        NusbClass {
            device,
            interface: Arc::new(Mutex::new(None)),
            class: None,
            next_class: 1,
        }
    }

    fn check(&self, class: ClassHandle) -> Result<(), UsbError> {
        if self.class == Some(class) {
            Ok(())
        } else {
            Err(UsbError::InvalidHandle)
        }
    }

    /// Run `job` against the claimed interface on a transfer thread.
    fn submit(
        &self,
        class: ClassHandle,
        operation: Operation,
        done: Completion,
        job: impl FnOnce(&nusb::Interface, u8) -> Result<Vec<u8>, UsbError>
        + Send
        + 'static,
    ) -> Result<(), UsbError> {
        self.check(class)?;
        let (number, interface) =
            lock(&self.interface).clone().ok_or(UsbError::InvalidHandle)?;
        spawn(operation, done, move || job(&interface, number))
    }
}

impl DfuClass for NusbClass {
    fn init(&mut self, _device: DeviceHandle) -> Result<ClassHandle, UsbError> {
        let class = ClassHandle(self.next_class);
        self.next_class += 1;
        self.class = Some(class);
        Ok(class)
    }

    fn set_interface(
        &mut self,
        class: ClassHandle,
        interface: InterfaceHandle,
        alt_setting: u8,
        done: Completion,
    ) -> Result<(), UsbError> {
        self.check(class)?;
        let number =
            u8::try_from(interface.0).map_err(|_| UsbError::InvalidHandle)?;
        let device = self.device.clone();
        let claimed = self.interface.clone();
        spawn(Operation::SetInterface, done, move || {
            let intf = device
                .claim_interface(number)
                .wait()
                .map_err(usb_error)?;
            intf.set_alt_setting(alt_setting).wait().map_err(usb_error)?;
            reset_state(&intf, number)?;
            *lock(&claimed) = Some((number, intf));
            Ok(Vec::new())
        })
    }

    fn dnload(
        &mut self,
        class: ClassHandle,
        block: u16,
        data: &[u8],
        done: Completion,
    ) -> Result<(), UsbError> {
        let data = data.to_vec();
        let length =
            u16::try_from(data.len()).map_err(|_| UsbError::NotSupported)?;
        self.submit(class, Operation::Dnload, done, move |intf, number| {
            let req = ControlRequest::dnload(number, block, length);
            control_out(intf, req, &data)
        })
    }

    fn upload(
        &mut self,
        class: ClassHandle,
        block: u16,
        length: u16,
        done: Completion,
    ) -> Result<(), UsbError> {
        self.submit(class, Operation::Upload, done, move |intf, number| {
            control_in(intf, ControlRequest::upload(number, block, length))
        })
    }

    fn get_status(
        &mut self,
        class: ClassHandle,
        done: Completion,
    ) -> Result<(), UsbError> {
        self.submit(class, Operation::GetStatus, done, |intf, number| {
            control_in(intf, ControlRequest::get_status(number))
        })
    }

    fn detach(
        &mut self,
        class: ClassHandle,
        timeout_ms: u16,
        done: Completion,
    ) -> Result<(), UsbError> {
        self.submit(class, Operation::Detach, done, move |intf, number| {
            control_out(intf, ControlRequest::detach(number, timeout_ms), &[])
        })
    }

    fn deinit(
        &mut self,
        _device: DeviceHandle,
        class: ClassHandle,
    ) -> Result<(), UsbError> {
        self.check(class)?;
        self.class = None;
        // dropping the last handle releases the interface
        lock(&self.interface).take();
        Ok(())
    }
}

pub(crate) struct NusbHost {
    device: nusb::Device,
}

impl NusbHost {
    pub(crate) fn new(device: nusb::Device) -> Self {
        NusbHost { device }
    }
}

impl UsbHost for NusbHost {
    fn bus_reset(&mut self, _host: HostHandle) {
        if let Err(err) = self.device.reset().wait() {
            warn!("USB reset failed: {}", err);
        }
    }

    fn trigger_re_enumeration(&mut self, _device: DeviceHandle) {
        // the operating system enumerates the device again after the reset
        info!("waiting for the device to re-enumerate");
    }
}
