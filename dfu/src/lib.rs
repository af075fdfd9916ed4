//! USB Device Firmware Upgrade (DFU) host controller for the on-board
//! neural-network accelerator
//!
//! The accelerator enumerates in DFU mode; the controller downloads the
//! firmware image in chunks, uploads it back to verify it byte for byte,
//! then detaches the device so it re-enumerates with its runtime identity.
//!
//! Every step is driven by completions of the host stack's DFU class
//! primitives ([DfuClass], [UsbHost]). Completions and host events never
//! touch controller state; they enqueue [Request]s for a single [Worker],
//! which owns the [DfuController].
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//!
//! # Example
//!
//! Flashing an image into the [sim::SimulatedAccelerator]:
//! ```
//! use dfu::{
//!     ControllerConfig, DfuController, DfuState, UsbHostDispatcher, Worker,
//!     event_handler, request_queue, sim::SimulatedAccelerator,
//! };
//!
//! static IMAGE: [u8; 600] = [0x5a; 600];
//!
//! let sim = SimulatedAccelerator::default();
//! let config = ControllerConfig::default();
//! let (sender, inbox) = request_queue(config.queue_capacity);
//! let controller = DfuController::new(
//!     sim.clone(),
//!     sim.clone(),
//!     &IMAGE,
//!     config,
//!     sender.clone(),
//! );
//! let mut worker = Worker::new(controller, inbox);
//!
//! let mut dispatcher = UsbHostDispatcher::new();
//! dispatcher.register_event_callback(0x1a6e, 0x089a, event_handler(sender));
//! sim.plug(&mut dispatcher, 0x1a6e, 0x089a);
//!
//! worker.run_pending();
//! assert_eq!(worker.handler().state(), DfuState::Complete);
//! ```

mod class;
mod controller;
mod descriptor;
mod device;
mod error;
mod host;
mod request;
mod status;
mod worker;

pub mod sim;

// Re-exports
pub use class::{
    ClassHandle, Completion, DeviceHandle, DfuClass, HostHandle,
    InterfaceHandle, Operation, UsbError, UsbHost,
};
pub use controller::{
    ControllerConfig, DEFAULT_CHUNK_SIZE, DEFAULT_DETACH_TIMEOUT_MS,
    DEFAULT_QUEUE_CAPACITY, DeviceBinding, DfuController, DfuInbox, DfuSender,
    DfuState, Request, Response, StateWatch, TransferComplete, request_queue,
};
pub use descriptor::{DFU_DESC_LEN, DFU_DESC_TYPE, DfuDescriptor};
pub use device::{
    Configuration, DFU_CLASS, DFU_SUBCLASS, InterfaceDescriptor,
    find_dfu_interface,
};
pub use error::DfuError;
pub use host::{
    EventCallback, EventStatus, HostEvent, UsbHostDispatcher, event_handler,
};
pub use request::{
    ControlRequest, DFU_CMD_ABORT, DFU_CMD_CLRSTATUS, DFU_CMD_DETACH,
    DFU_CMD_DOWNLOAD, DFU_CMD_GETSTATUS, DFU_CMD_UPLOAD, Direction,
};
pub use status::{
    DFU_STATE_APP_DETACH, DFU_STATE_DFU_DOWNLOAD_IDLE, DFU_STATE_DFU_ERROR,
    DFU_STATE_DFU_IDLE, DFU_STATE_DFU_UPLOAD_IDLE, DFU_STATUS_LEN, DfuStatus,
};
pub use worker::{
    MIN_QUEUE_CAPACITY, QueueError, RequestHandler, RequestInbox,
    RequestSender, ResponseCallback, Worker, WorkerError, bounded,
};
