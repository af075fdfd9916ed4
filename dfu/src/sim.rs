//! In-memory accelerator in DFU mode.
//!
//! Implements both [DfuClass] and [UsbHost] so a controller can be run end
//! to end without hardware. Every call is recorded, faults can be injected,
//! and completions are either delivered before the issuing call returns or
//! held back until [SimulatedAccelerator::complete_pending].

use std::{
    cmp,
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::trace;

use crate::{
    class::{
        ClassHandle, Completion, DeviceHandle, DfuClass, HostHandle,
        InterfaceHandle, Operation, UsbError, UsbHost,
    },
    device::{Configuration, DFU_CLASS, DFU_SUBCLASS, InterfaceDescriptor},
    host::{EventStatus, HostEvent, UsbHostDispatcher},
    status::{
        DFU_STATE_APP_DETACH, DFU_STATE_DFU_DOWNLOAD_IDLE, DFU_STATE_DFU_ERROR,
        DFU_STATE_DFU_IDLE, DFU_STATE_DFU_UPLOAD_IDLE, DfuStatus,
    },
};

pub const SIM_HOST: HostHandle = HostHandle(1);
pub const SIM_DEVICE: DeviceHandle = DeviceHandle(0x10);
pub const SIM_INTERFACE: InterfaceHandle = InterfaceHandle(0x20);

/// A primitive invoked on the simulator, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Init,
    SetInterface { alt_setting: u8 },
    Dnload { block: u16, length: usize },
    Upload { block: u16, length: u16 },
    GetStatus,
    Detach { timeout_ms: u16 },
    Deinit,
    BusReset,
    ReEnumerate,
}

#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// `DFU class init` fails.
    pub fail_init: bool,
    /// Issuing this operation fails synchronously.
    pub reject: Option<Operation>,
    /// The `DNLOAD` completion for this block reports a stall.
    pub fail_dnload_block: Option<u16>,
    /// This byte of the uploaded image is flipped.
    pub corrupt_upload_offset: Option<usize>,
    /// `bStatus` reported by every `DFU_GETSTATUS`.
    pub status_code: Option<u8>,
}

struct Inner {
    faults: Faults,
    defer: bool,
    memory: Vec<u8>,
    upload_offset: usize,
    dfu_state: u8,
    class: Option<ClassHandle>,
    next_class: usize,
    calls: Vec<Call>,
    pending: VecDeque<(Completion, Result<Vec<u8>, UsbError>)>,
    outstanding: usize,
    max_outstanding: usize,
}

#[derive(Clone)]
pub struct SimulatedAccelerator {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        Self::new(Faults::default())
    }
}

impl SimulatedAccelerator {
    pub fn new(faults: Faults) -> Self {
        SimulatedAccelerator {
            inner: Arc::new(Mutex::new(Inner {
                faults,
                defer: false,
                memory: Vec::new(),
                upload_offset: 0,
                dfu_state: DFU_STATE_DFU_IDLE,
                class: None,
                next_class: 1,
                calls: Vec::new(),
                pending: VecDeque::new(),
                outstanding: 0,
                max_outstanding: 0,
            })),
        }
    }

    /// Hold completions until [Self::complete_pending] is called.
    pub fn deferred(self) -> Self {
        self.lock().defer = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Bytes committed by `DNLOAD` so far.
    pub fn memory(&self) -> Vec<u8> {
        self.lock().memory.clone()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Operations issued but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Largest number of operations ever outstanding at once.
    pub fn max_outstanding(&self) -> usize {
        self.lock().max_outstanding
    }

    /// Deliver the oldest held completion. Returns `false` if none was held.
    pub fn complete_pending(&self) -> bool {
        let next = {
            let mut inner = self.lock();
            let next = inner.pending.pop_front();
            if next.is_some() {
                inner.outstanding -= 1;
            }
            next
        };
        match next {
            Some((done, result)) => {
                done(result);
                true
            }
            None => false,
        }
    }

    /// The configuration offered on attach: a single DFU interface.
    pub fn configuration(&self) -> Configuration {
        Configuration {
            interfaces: vec![InterfaceDescriptor {
                handle: SIM_INTERFACE,
                number: 0,
                alternate_setting: 0,
                class: DFU_CLASS,
                subclass: DFU_SUBCLASS,
                protocol: 2,
            }],
        }
    }

    /// Attach and finish enumeration.
    pub fn plug(
        &self,
        dispatcher: &mut UsbHostDispatcher,
        vid: u16,
        pid: u16,
    ) -> EventStatus {
        let configuration = self.configuration();
        let status = dispatcher.dispatch(
            vid,
            pid,
            SIM_HOST,
            SIM_DEVICE,
            &HostEvent::Attach(&configuration),
        );
        if status != EventStatus::Success {
            return status;
        }
        dispatcher.dispatch(
            vid,
            pid,
            SIM_HOST,
            SIM_DEVICE,
            &HostEvent::EnumerationDone,
        )
    }

    pub fn unplug(
        &self,
        dispatcher: &mut UsbHostDispatcher,
        vid: u16,
        pid: u16,
    ) -> EventStatus {
        dispatcher.dispatch(vid, pid, SIM_HOST, SIM_DEVICE, &HostEvent::Detach)
    }

    fn submit(
        &self,
        class: ClassHandle,
        operation: Operation,
        call: Call,
        respond: impl FnOnce(&mut Inner) -> Result<Vec<u8>, UsbError>,
        done: Completion,
    ) -> Result<(), UsbError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.calls.push(call);
        if inner.class != Some(class) {
            return Err(UsbError::InvalidHandle);
        }
        if inner.faults.reject == Some(operation) {
            return Err(UsbError::Busy);
        }
        let result = respond(inner);
        inner.outstanding += 1;
        inner.max_outstanding =
            cmp::max(inner.max_outstanding, inner.outstanding);
        if inner.defer {
            inner.pending.push_back((done, result));
            return Ok(());
        }
        inner.outstanding -= 1;
        drop(guard);
        done(result);
        Ok(())
    }
}

impl DfuClass for SimulatedAccelerator {
    fn init(&mut self, device: DeviceHandle) -> Result<ClassHandle, UsbError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Init);
        if inner.faults.fail_init || device != SIM_DEVICE {
            return Err(UsbError::NotSupported);
        }
        let class = ClassHandle(inner.next_class);
        inner.next_class += 1;
        inner.class = Some(class);
        Ok(class)
    }

    fn set_interface(
        &mut self,
        class: ClassHandle,
        interface: InterfaceHandle,
        alt_setting: u8,
        done: Completion,
    ) -> Result<(), UsbError> {
        if interface != SIM_INTERFACE {
            return Err(UsbError::InvalidHandle);
        }
        self.submit(
            class,
            Operation::SetInterface,
            Call::SetInterface { alt_setting },
            |inner| {
                inner.dfu_state = DFU_STATE_DFU_IDLE;
                Ok(Vec::new())
            },
            done,
        )
    }

    fn dnload(
        &mut self,
        class: ClassHandle,
        block: u16,
        data: &[u8],
        done: Completion,
    ) -> Result<(), UsbError> {
        let call = Call::Dnload {
            block,
            length: data.len(),
        };
        self.submit(
            class,
            Operation::Dnload,
            call,
            |inner| {
                if !data.is_empty()
                    && inner.faults.fail_dnload_block == Some(block)
                {
                    return Err(UsbError::Stall);
                }
                if data.is_empty() {
                    // manifestation, uploads start over
                    inner.upload_offset = 0;
                    inner.dfu_state = DFU_STATE_DFU_IDLE;
                } else {
                    if block == 0 {
                        inner.memory.clear();
                    }
                    inner.memory.extend_from_slice(data);
                    inner.dfu_state = DFU_STATE_DFU_DOWNLOAD_IDLE;
                }
                trace!("sim: block {} holds {} bytes", block, data.len());
                Ok(Vec::new())
            },
            done,
        )
    }

    fn upload(
        &mut self,
        class: ClassHandle,
        block: u16,
        length: u16,
        done: Completion,
    ) -> Result<(), UsbError> {
        self.submit(
            class,
            Operation::Upload,
            Call::Upload { block, length },
            |inner| {
                let start = cmp::min(inner.upload_offset, inner.memory.len());
                let end = cmp::min(start + length as usize, inner.memory.len());
                let mut data = inner.memory[start..end].to_vec();
                if let Some(offset) = inner.faults.corrupt_upload_offset {
                    if (start..end).contains(&offset) {
                        data[offset - start] ^= 0xff;
                    }
                }
                inner.upload_offset = end;
                inner.dfu_state = DFU_STATE_DFU_UPLOAD_IDLE;
                Ok(data)
            },
            done,
        )
    }

    fn get_status(
        &mut self,
        class: ClassHandle,
        done: Completion,
    ) -> Result<(), UsbError> {
        self.submit(
            class,
            Operation::GetStatus,
            Call::GetStatus,
            |inner| {
                let status = match inner.faults.status_code {
                    Some(code) if code != 0 => {
                        inner.dfu_state = DFU_STATE_DFU_ERROR;
                        DfuStatus::new(code, inner.dfu_state)
                    }
                    _ => DfuStatus::new(0, inner.dfu_state),
                };
                Ok(status.to_bytes().to_vec())
            },
            done,
        )
    }

    fn detach(
        &mut self,
        class: ClassHandle,
        timeout_ms: u16,
        done: Completion,
    ) -> Result<(), UsbError> {
        self.submit(
            class,
            Operation::Detach,
            Call::Detach { timeout_ms },
            |inner| {
                inner.dfu_state = DFU_STATE_APP_DETACH;
                Ok(Vec::new())
            },
            done,
        )
    }

    fn deinit(
        &mut self,
        _device: DeviceHandle,
        class: ClassHandle,
    ) -> Result<(), UsbError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Deinit);
        if inner.class != Some(class) {
            return Err(UsbError::InvalidHandle);
        }
        inner.class = None;
        Ok(())
    }
}

impl UsbHost for SimulatedAccelerator {
    fn bus_reset(&mut self, _host: HostHandle) {
        self.lock().calls.push(Call::BusReset);
    }

    fn trigger_re_enumeration(&mut self, _device: DeviceHandle) {
        self.lock().calls.push(Call::ReEnumerate);
    }
}
