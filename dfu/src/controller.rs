//! Firmware upgrade state machine.
//!
//! All controller fields are mutated by [DfuController::handle], which runs
//! on the worker. Host events and class completions only enqueue
//! [Request]s. Each completion carries the ticket of the operation it
//! finishes, so a completion that lost a race against a bus detach is
//! recognized and dropped.

use std::{
    cmp, fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use log::{debug, error, info, trace, warn};

use crate::{
    class::{
        ClassHandle, Completion, DeviceHandle, DfuClass, HostHandle,
        InterfaceHandle, Operation, UsbError, UsbHost,
    },
    descriptor::DfuDescriptor,
    error::DfuError,
    status::DfuStatus,
    worker::{self, RequestHandler, RequestInbox, RequestSender},
};

pub const DEFAULT_CHUNK_SIZE: u16 = 256;
pub const DEFAULT_DETACH_TIMEOUT_MS: u16 = 1000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

const DFU_ALT_SETTING: u8 = 0;

const NO_TICKET: u64 = u64::MAX;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    Unattached,
    Attached,
    SetInterface,
    GetStatus,
    Transfer,
    ZeroLengthTransfer,
    ReadBack,
    GetStatusRead,
    Detach,
    CheckStatus,
    Complete,
    Error,
}

impl DfuState {
    const ALL: [DfuState; 12] = [
        DfuState::Unattached,
        DfuState::Attached,
        DfuState::SetInterface,
        DfuState::GetStatus,
        DfuState::Transfer,
        DfuState::ZeroLengthTransfer,
        DfuState::ReadBack,
        DfuState::GetStatusRead,
        DfuState::Detach,
        DfuState::CheckStatus,
        DfuState::Complete,
        DfuState::Error,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, DfuState::Complete | DfuState::Error)
    }

    /// States that talk to the device through a live class handle.
    fn needs_class(self) -> bool {
        !matches!(
            self,
            DfuState::Unattached | DfuState::Attached | DfuState::Error
        )
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::Unattached => "UNATTACHED",
            DfuState::Attached => "ATTACHED",
            DfuState::SetInterface => "SET_INTERFACE",
            DfuState::GetStatus => "GET_STATUS",
            DfuState::Transfer => "TRANSFER",
            DfuState::ZeroLengthTransfer => "ZERO_LENGTH_TRANSFER",
            DfuState::ReadBack => "READ_BACK",
            DfuState::GetStatusRead => "GET_STATUS_READ",
            DfuState::Detach => "DETACH",
            DfuState::CheckStatus => "CHECK_STATUS",
            DfuState::Complete => "COMPLETE",
            DfuState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Read-only view of the controller state, usable from any thread.
#[derive(Clone, Debug)]
pub struct StateWatch(Arc<AtomicU8>);

impl StateWatch {
    fn new(state: DfuState) -> Self {
        StateWatch(Arc::new(AtomicU8::new(state as u8)))
    }

    fn set(&self, state: DfuState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> DfuState {
        DfuState::ALL[self.0.load(Ordering::Acquire) as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Largest `DNLOAD`/`UPLOAD` payload.
    pub chunk_size: u16,
    /// `wTimeout` of the `DFU_DETACH` request.
    pub detach_timeout_ms: u16,
    pub queue_capacity: usize,
    /// Poll the status once more after `DFU_DETACH` before completing.
    pub check_status_after_detach: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            detach_timeout_ms: DEFAULT_DETACH_TIMEOUT_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            check_status_after_detach: false,
        }
    }
}

impl ControllerConfig {
    /// Adopt the transfer size advertised by the device and never ask for a
    /// longer detach timeout than it supports.
    pub fn with_descriptor(mut self, desc: &DfuDescriptor) -> Self {
        if desc.transfer_size() > 0 {
            self.chunk_size = desc.transfer_size();
        }
        if desc.detach_timeout() > 0 {
            self.detach_timeout_ms =
                cmp::min(self.detach_timeout_ms, desc.detach_timeout());
        }
        self
    }
}

/// Identifiers captured when a DFU device attaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceBinding {
    pub host: HostHandle,
    pub device: DeviceHandle,
    pub interface: InterfaceHandle,
}

#[derive(Debug)]
pub struct TransferComplete {
    pub ticket: u32,
    pub operation: Operation,
    pub result: Result<Vec<u8>, UsbError>,
}

#[derive(Debug)]
pub enum Request {
    NextState(DfuState),
    Bind(DeviceBinding),
    Completed(TransferComplete),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub state: DfuState,
}

pub type DfuSender = RequestSender<Request, Response>;
pub type DfuInbox = RequestInbox<Request, Response>;

pub fn request_queue(capacity: usize) -> (DfuSender, DfuInbox) {
    worker::bounded(capacity)
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    ticket: u32,
    operation: Operation,
    length: usize,
}

pub struct DfuController<C, H> {
    class: C,
    host: H,
    sender: DfuSender,
    config: ControllerConfig,
    image: &'static [u8],
    host_instance: Option<HostHandle>,
    device_handle: Option<DeviceHandle>,
    interface_handle: Option<InterfaceHandle>,
    class_handle: Option<ClassHandle>,
    bytes_transferred: usize,
    current_block: u16,
    status: Option<DfuStatus>,
    readback: Option<Vec<u8>>,
    readback_allocations: usize,
    readback_frees: usize,
    state: DfuState,
    watch: StateWatch,
    in_flight: Option<InFlight>,
    next_ticket: u32,
    /// Ticket of a completion that could not be enqueued.
    lost_completion: Arc<AtomicU64>,
    last_error: Option<DfuError>,
}

impl<C: DfuClass, H: UsbHost> DfuController<C, H> {
    pub fn new(
        class: C,
        host: H,
        image: &'static [u8],
        config: ControllerConfig,
        sender: DfuSender,
    ) -> Self {
        DfuController {
            class,
            host,
            sender,
            config,
            image,
            host_instance: None,
            device_handle: None,
            interface_handle: None,
            class_handle: None,
            bytes_transferred: 0,
            current_block: 0,
            status: None,
            readback: None,
            readback_allocations: 0,
            readback_frees: 0,
            state: DfuState::Unattached,
            watch: StateWatch::new(DfuState::Unattached),
            in_flight: None,
            next_ticket: 0,
            lost_completion: Arc::new(AtomicU64::new(NO_TICKET)),
            last_error: None,
        }
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn watch(&self) -> StateWatch {
        self.watch.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn bytes_to_transfer(&self) -> usize {
        self.image.len()
    }

    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    pub fn current_block(&self) -> u16 {
        self.current_block
    }

    pub fn class_handle(&self) -> Option<ClassHandle> {
        self.class_handle
    }

    pub fn device_handle(&self) -> Option<DeviceHandle> {
        self.device_handle
    }

    pub fn interface_handle(&self) -> Option<InterfaceHandle> {
        self.interface_handle
    }

    /// Last decoded `DFU_GETSTATUS` reply.
    pub fn last_status(&self) -> Option<&DfuStatus> {
        self.status.as_ref()
    }

    pub fn last_error(&self) -> Option<&DfuError> {
        self.last_error.as_ref()
    }

    pub fn has_readback_buffer(&self) -> bool {
        self.readback.is_some()
    }

    pub fn readback_allocations(&self) -> usize {
        self.readback_allocations
    }

    pub fn readback_frees(&self) -> usize {
        self.readback_frees
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn set_state(&mut self, state: DfuState) {
        debug!("{} -> {}", self.state, state);
        self.state = state;
        self.watch.set(state);
    }

    /// Enqueue the next transition, as completions do.
    fn advance(&mut self, next: DfuState) {
        if let Err(err) = self.sender.send(Request::NextState(next)) {
            self.fail(err.into());
        }
    }

    fn fail(&mut self, err: DfuError) {
        error!("DFU error in {}: {}", self.state, err);
        // The class handle is kept for inspection; a bus detach releases it.
        self.free_readback();
        self.in_flight = None;
        self.last_error = Some(err);
        self.set_state(DfuState::Error);
    }

    fn free_readback(&mut self) {
        if self.readback.take().is_some() {
            self.readback_frees += 1;
        }
    }

    fn reset_counters(&mut self) {
        self.current_block = 0;
        self.bytes_transferred = 0;
    }

    fn remaining(&self) -> usize {
        self.bytes_to_transfer() - self.bytes_transferred
    }

    fn chunk_len(&self) -> usize {
        let chunk_size = cmp::max(self.config.chunk_size, 1) as usize;
        cmp::min(chunk_size, self.remaining())
    }

    fn bind(&mut self, binding: DeviceBinding) {
        if self.state != DfuState::Unattached {
            warn!("ignoring attach of {:?} in {}", binding.device, self.state);
            return;
        }
        debug!("bound to {:?}", binding);
        self.host_instance = Some(binding.host);
        self.device_handle = Some(binding.device);
        self.interface_handle = Some(binding.interface);
    }

    fn enter(&mut self, next: DfuState) {
        if next == DfuState::Unattached {
            self.release();
            self.set_state(next);
            return;
        }
        if next == DfuState::Attached && self.state != DfuState::Unattached {
            warn!("enumeration done while in {}, ignored", self.state);
            return;
        }
        if self.state.is_terminal() {
            warn!("{} is terminal, ignoring {}", self.state, next);
            return;
        }
        if next.needs_class() && self.class_handle.is_none() {
            warn!("no class handle, dropping transition to {}", next);
            return;
        }
        if let Some(op) = self.in_flight {
            warn!(
                "{} still in flight, dropping transition to {}",
                op.operation, next
            );
            return;
        }

        self.set_state(next);
        let result = match next {
            DfuState::Unattached => Ok(()),
            DfuState::Attached => self.init_class(),
            DfuState::SetInterface => self.set_interface(),
            DfuState::GetStatus
            | DfuState::GetStatusRead
            | DfuState::CheckStatus => self.get_status(),
            DfuState::Transfer => self.transfer(),
            DfuState::ZeroLengthTransfer => self.zero_length_transfer(),
            DfuState::ReadBack => self.read_back(),
            DfuState::Detach => self.detach(),
            DfuState::Complete => {
                self.finish();
                Ok(())
            }
            DfuState::Error => {
                error!("DFU error");
                Ok(())
            }
        };
        if let Err(err) = result {
            self.fail(err);
        }
    }

    fn release(&mut self) {
        if let Some(class) = self.class_handle.take() {
            if let Some(device) = self.device_handle {
                if let Err(err) = self.class.deinit(device, class) {
                    debug!("deinit after detach: {}", err);
                }
            }
        }
        if let Some(op) = self.in_flight.take() {
            info!("detached with {} in flight", op.operation);
        }
        self.device_handle = None;
        self.interface_handle = None;
        self.free_readback();
        self.reset_counters();
    }

    fn init_class(&mut self) -> Result<(), DfuError> {
        let device = self.device_handle.ok_or(DfuError::UnsupportedDevice)?;
        let class = self.class.init(device).map_err(DfuError::ClassInit)?;
        self.class_handle = Some(class);
        self.last_error = None;
        self.status = None;
        self.reset_counters();
        info!(
            "DFU device attached, downloading {} bytes",
            self.bytes_to_transfer()
        );
        self.advance(DfuState::SetInterface);
        Ok(())
    }

    /// Completion posting the result back to this controller's queue.
    fn completion(
        &mut self,
        operation: Operation,
        length: usize,
    ) -> Completion {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.in_flight = Some(InFlight {
            ticket,
            operation,
            length,
        });

        let sender = self.sender.clone();
        let lost = self.lost_completion.clone();
        Box::new(move |result| {
            let done = TransferComplete {
                ticket,
                operation,
                result,
            };
            if let Err(err) = sender.send(Request::Completed(done)) {
                error!("lost {} completion: {}", operation, err);
                lost.store(u64::from(ticket), Ordering::Release);
            }
        })
    }

    /// A completion for the operation in flight that never reached the
    /// queue leaves nothing to drive the transfer on.
    fn check_lost_completion(&mut self) {
        let lost = self.lost_completion.swap(NO_TICKET, Ordering::AcqRel);
        if lost == NO_TICKET {
            return;
        }
        match self.in_flight {
            Some(op) if u64::from(op.ticket) == lost => {
                self.fail(DfuError::QueueFull)
            }
            _ => debug!("lost completion {} was stale", lost),
        }
    }

    fn issued(
        &mut self,
        operation: Operation,
        result: Result<(), UsbError>,
    ) -> Result<(), DfuError> {
        result.map_err(|err| {
            self.in_flight = None;
            DfuError::ClassCall(operation, err)
        })
    }

    fn live_class(
        &self,
        operation: Operation,
    ) -> Result<ClassHandle, DfuError> {
        self.class_handle
            .ok_or(DfuError::ClassCall(operation, UsbError::InvalidHandle))
    }

    fn set_interface(&mut self) -> Result<(), DfuError> {
        let class = self.live_class(Operation::SetInterface)?;
        let interface = self.interface_handle.ok_or(DfuError::ClassCall(
            Operation::SetInterface,
            UsbError::InvalidHandle,
        ))?;
        let done = self.completion(Operation::SetInterface, 0);
        let result = self.class.set_interface(
            class,
            interface,
            DFU_ALT_SETTING,
            done,
        );
        self.issued(Operation::SetInterface, result)
    }

    fn get_status(&mut self) -> Result<(), DfuError> {
        let class = self.live_class(Operation::GetStatus)?;
        let done = self.completion(Operation::GetStatus, 0);
        let result = self.class.get_status(class, done);
        self.issued(Operation::GetStatus, result)
    }

    fn transfer(&mut self) -> Result<(), DfuError> {
        let class = self.live_class(Operation::Dnload)?;
        let len = self.chunk_len();
        let start = self.bytes_transferred;
        let image = self.image;
        let done = self.completion(Operation::Dnload, len);
        let result = self.class.dnload(
            class,
            self.current_block,
            &image[start..start + len],
            done,
        );
        self.issued(Operation::Dnload, result)
    }

    fn zero_length_transfer(&mut self) -> Result<(), DfuError> {
        let class = self.live_class(Operation::Dnload)?;
        let done = self.completion(Operation::Dnload, 0);
        let result = self.class.dnload(class, self.current_block, &[], done);
        self.issued(Operation::Dnload, result)
    }

    fn read_back(&mut self) -> Result<(), DfuError> {
        let class = self.live_class(Operation::Upload)?;
        if self.readback.is_none() {
            self.readback = Some(vec![0; self.bytes_to_transfer()]);
            self.readback_allocations += 1;
        }
        let len = self.chunk_len();
        if len == 0 {
            // Nothing to read back from an empty image.
            self.advance(DfuState::GetStatusRead);
            return Ok(());
        }
        let done = self.completion(Operation::Upload, len);
        let result =
            self.class.upload(class, self.current_block, len as u16, done);
        self.issued(Operation::Upload, result)
    }

    fn detach(&mut self) -> Result<(), DfuError> {
        let class = self.live_class(Operation::Detach)?;
        let done = self.completion(Operation::Detach, 0);
        let timeout_ms = self.config.detach_timeout_ms;
        let result = self.class.detach(class, timeout_ms, done);
        self.issued(Operation::Detach, result)
    }

    fn finish(&mut self) {
        if let Some(host) = self.host_instance {
            self.host.bus_reset(host);
        }
        if let (Some(device), Some(class)) =
            (self.device_handle, self.class_handle.take())
        {
            if let Err(err) = self.class.deinit(device, class) {
                warn!("DFU class deinit failed: {}", err);
            }
        }
        if let Some(device) = self.device_handle {
            self.host.trigger_re_enumeration(device);
        }
        info!("firmware update complete, re-enumerating");
    }

    fn complete(&mut self, done: TransferComplete) {
        let expected = match self.in_flight {
            Some(op)
                if op.ticket == done.ticket && self.class_handle.is_some() =>
            {
                op
            }
            _ => {
                warn!(
                    "dropping stale {} completion in {}",
                    done.operation, self.state
                );
                return;
            }
        };
        self.in_flight = None;

        let data = match done.result {
            Ok(data) => data,
            Err(err) => {
                self.fail(DfuError::Transfer(done.operation, err));
                return;
            }
        };

        match self.on_success(expected, data) {
            Ok(next) => self.advance(next),
            Err(err) => self.fail(err),
        }
    }

    /// Bookkeeping after a successful operation; returns the next state.
    fn on_success(
        &mut self,
        done: InFlight,
        data: Vec<u8>,
    ) -> Result<DfuState, DfuError> {
        match self.state {
            DfuState::SetInterface => Ok(DfuState::GetStatus),
            DfuState::GetStatus => {
                self.check_status(&data)?;
                Ok(if self.bytes_transferred < self.bytes_to_transfer() {
                    DfuState::Transfer
                } else {
                    DfuState::ZeroLengthTransfer
                })
            }
            DfuState::Transfer => {
                self.current_block = self.current_block.wrapping_add(1);
                self.bytes_transferred += done.length;
                trace!(
                    "downloaded {}/{} bytes",
                    self.bytes_transferred,
                    self.bytes_to_transfer()
                );
                Ok(DfuState::GetStatus)
            }
            DfuState::ZeroLengthTransfer => {
                info!("download committed, reading back");
                self.reset_counters();
                Ok(DfuState::ReadBack)
            }
            DfuState::ReadBack => {
                self.store_readback(done.length, &data)?;
                self.current_block = self.current_block.wrapping_add(1);
                Ok(DfuState::GetStatusRead)
            }
            DfuState::GetStatusRead => {
                self.check_status(&data)?;
                if self.bytes_transferred < self.bytes_to_transfer() {
                    Ok(DfuState::ReadBack)
                } else {
                    self.verify()?;
                    Ok(DfuState::Detach)
                }
            }
            DfuState::Detach if self.config.check_status_after_detach => {
                Ok(DfuState::CheckStatus)
            }
            DfuState::Detach | DfuState::CheckStatus => Ok(DfuState::Complete),
            state => {
                error!("unexpected {} completion in {}", done.operation, state);
                Err(DfuError::Transfer(done.operation, UsbError::InvalidHandle))
            }
        }
    }

    fn check_status(&mut self, data: &[u8]) -> Result<(), DfuError> {
        let status = DfuStatus::parse(data)?;
        if status.poll_timeout() > 0 {
            trace!("device asks for {} ms poll timeout", status.poll_timeout());
        }
        self.status = Some(status);
        status.ok()
    }

    fn store_readback(
        &mut self,
        requested: usize,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let offset = self.bytes_transferred;
        let len = cmp::min(requested, data.len());
        if let Some(buf) = self.readback.as_mut() {
            buf[offset..offset + len].copy_from_slice(&data[..len]);
        }
        self.bytes_transferred += len;
        if len < requested {
            // Short frame: the device has no more data than this.
            return Err(DfuError::VerificationMismatch {
                offset: self.bytes_transferred,
            });
        }
        trace!(
            "read back {}/{} bytes",
            self.bytes_transferred,
            self.bytes_to_transfer()
        );
        Ok(())
    }

    fn verify(&mut self) -> Result<(), DfuError> {
        let mismatch = match self.readback.as_deref() {
            Some(buf) => buf
                .iter()
                .zip(self.image)
                .position(|(read, written)| read != written),
            None => Some(0),
        };
        self.free_readback();
        self.reset_counters();
        match mismatch {
            Some(offset) => Err(DfuError::VerificationMismatch { offset }),
            None => {
                info!("read back verified, detaching");
                Ok(())
            }
        }
    }
}

impl<C: DfuClass, H: UsbHost> RequestHandler for DfuController<C, H> {
    type Request = Request;
    type Response = Response;

    fn handle(&mut self, request: Request) -> Response {
        self.check_lost_completion();
        match request {
            Request::NextState(state) => self.enter(state),
            Request::Bind(binding) => self.bind(binding),
            Request::Completed(done) => self.complete(done),
        }
        Response { state: self.state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::{HostEvent, UsbHostDispatcher, event_handler},
        sim::{Call, SIM_DEVICE, SIM_HOST, SimulatedAccelerator},
        worker::Worker,
    };

    static IMAGE: [u8; 2500] = [0xa5; 2500];

    type SimWorker =
        Worker<DfuController<SimulatedAccelerator, SimulatedAccelerator>>;

    fn start(
        sim: &SimulatedAccelerator,
        config: ControllerConfig,
    ) -> (SimWorker, UsbHostDispatcher, DfuSender) {
        let (sender, inbox) = request_queue(config.queue_capacity);
        let controller = DfuController::new(
            sim.clone(),
            sim.clone(),
            &IMAGE,
            config,
            sender.clone(),
        );
        let mut dispatcher = UsbHostDispatcher::new();
        dispatcher.register_event_callback(1, 2, event_handler(sender.clone()));
        (Worker::new(controller, inbox), dispatcher, sender)
    }

    fn dnload_lengths(calls: &[Call]) -> Vec<usize> {
        calls
            .iter()
            .filter_map(|call| match call {
                Call::Dnload { length, .. } => Some(*length),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_descriptor_transfer_size() {
        let desc = DfuDescriptor::parse(&[
            9, 0x21, 0x0b, 0xf4, 0x01, 0x00, 0x04, 0x10, 0x01,
        ])
        .unwrap();
        let config = ControllerConfig::default().with_descriptor(&desc);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.detach_timeout_ms, 500);

        let sim = SimulatedAccelerator::default();
        let (mut worker, mut dispatcher, _) = start(&sim, config);
        sim.plug(&mut dispatcher, 1, 2);
        worker.run_pending();

        assert_eq!(worker.handler().state(), DfuState::Complete);
        let calls = sim.calls();
        assert_eq!(dnload_lengths(&calls), vec![1024, 1024, 452, 0]);
        assert!(calls.contains(&Call::Detach { timeout_ms: 500 }));
    }

    #[test]
    fn test_check_status_after_detach() {
        let config = ControllerConfig {
            check_status_after_detach: true,
            ..Default::default()
        };
        let sim = SimulatedAccelerator::default();
        let (mut worker, mut dispatcher, _) = start(&sim, config);
        sim.plug(&mut dispatcher, 1, 2);
        worker.run_pending();

        assert_eq!(worker.handler().state(), DfuState::Complete);
        let calls = sim.calls();
        assert_eq!(
            calls[calls.len() - 5..],
            [
                Call::Detach { timeout_ms: 1000 },
                Call::GetStatus,
                Call::BusReset,
                Call::Deinit,
                Call::ReEnumerate,
            ]
        );
    }

    #[test]
    fn test_transitions_without_device_are_dropped() {
        let sim = SimulatedAccelerator::default();
        let (mut worker, _, sender) = start(&sim, ControllerConfig::default());
        for state in
            [DfuState::Transfer, DfuState::GetStatus, DfuState::Complete]
        {
            sender.send(Request::NextState(state)).unwrap();
        }
        assert_eq!(worker.run_pending(), 3);
        assert_eq!(worker.handler().state(), DfuState::Unattached);
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_enumeration_without_match_is_unsupported() {
        let sim = SimulatedAccelerator::default();
        let (mut worker, _, sender) = start(&sim, ControllerConfig::default());
        sender.send(Request::NextState(DfuState::Attached)).unwrap();
        worker.run_pending();
        assert_eq!(worker.handler().state(), DfuState::Error);
        assert_eq!(
            worker.handler().last_error(),
            Some(&DfuError::UnsupportedDevice)
        );
    }

    #[test]
    fn test_repeated_enumeration_is_ignored() {
        let sim = SimulatedAccelerator::default().deferred();
        let (mut worker, mut dispatcher, _) =
            start(&sim, ControllerConfig::default());
        sim.plug(&mut dispatcher, 1, 2);
        worker.run_pending();
        assert_eq!(worker.handler().state(), DfuState::SetInterface);

        dispatcher.dispatch(
            1,
            2,
            SIM_HOST,
            SIM_DEVICE,
            &HostEvent::EnumerationDone,
        );
        worker.run_pending();
        assert_eq!(worker.handler().state(), DfuState::SetInterface);
        assert_eq!(
            sim.calls(),
            vec![Call::Init, Call::SetInterface { alt_setting: 0 }]
        );
    }

    #[test]
    fn test_response_and_watch_follow_state() {
        let sim = SimulatedAccelerator::default().deferred();
        let (mut worker, mut dispatcher, sender) =
            start(&sim, ControllerConfig::default());
        let watch = worker.handler().watch();
        sim.plug(&mut dispatcher, 1, 2);
        worker.run_pending();
        assert_eq!(watch.get(), DfuState::SetInterface);

        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let slot = seen.clone();
        sender
            .send_with(Request::NextState(DfuState::Unattached), move |resp| {
                *slot.lock().unwrap() = Some(resp.state);
            })
            .unwrap();
        worker.run_pending();
        assert_eq!(*seen.lock().unwrap(), Some(DfuState::Unattached));
        assert_eq!(watch.get(), DfuState::Unattached);
    }

    #[test]
    fn test_full_queue_on_advance_is_an_error() {
        let sim = SimulatedAccelerator::default().deferred();
        let (mut worker, mut dispatcher, sender) =
            start(&sim, ControllerConfig::default());
        sim.plug(&mut dispatcher, 1, 2);
        worker.run_pending();
        assert_eq!(worker.handler().state(), DfuState::SetInterface);
        let ticket = worker.handler().in_flight.unwrap().ticket;

        while sender.send(Request::NextState(DfuState::Transfer)).is_ok() {}
        let response =
            worker.handler_mut().handle(Request::Completed(TransferComplete {
                ticket,
                operation: Operation::SetInterface,
                result: Ok(Vec::new()),
            }));

        assert_eq!(response.state, DfuState::Error);
        assert_eq!(worker.handler().last_error(), Some(&DfuError::QueueFull));
        assert!(worker.handler().in_flight.is_none());

        // queued transitions are ignored once in ERROR
        worker.run_pending();
        assert_eq!(worker.handler().state(), DfuState::Error);
        assert_eq!(
            sim.calls(),
            vec![Call::Init, Call::SetInterface { alt_setting: 0 }]
        );
    }

    #[test]
    fn test_state_names() {
        assert_eq!(
            DfuState::ZeroLengthTransfer.to_string(),
            "ZERO_LENGTH_TRANSFER"
        );
        assert!(DfuState::Error.is_terminal());
        assert!(!DfuState::Unattached.is_terminal());
        for state in DfuState::ALL {
            assert_eq!(DfuState::ALL[state as usize], state);
        }
    }
}
