//! Board task flashing the neural-network accelerator at boot.
//!
//! The accelerator comes up in DFU mode with [DFU_VID]:[DFU_PID]. Once the
//! image has been downloaded, verified and the device detached, it
//! re-enumerates as [RUNTIME_VID]:[RUNTIME_PID] and is handled by another
//! class driver.

use std::{
    io, thread,
    time::{Duration, Instant},
};

use log::info;

use dfu::{
    ControllerConfig, DfuClass, DfuController, DfuSender, DfuState, StateWatch,
    UsbHost, UsbHostDispatcher, Worker, WorkerError, event_handler,
    request_queue,
};

pub const DFU_VID: u16 = 0x1a6e;
pub const DFU_PID: u16 = 0x089a;
pub const RUNTIME_VID: u16 = 0x18d1;
pub const RUNTIME_PID: u16 = 0x9302;

const WORKER_NAME: &str = "accel-dfu";
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to the running DFU worker.
pub struct AcceleratorDfu {
    watch: StateWatch,
    sender: DfuSender,
}

impl AcceleratorDfu {
    /// Start the worker and register for the accelerator's DFU identity.
    pub fn start<C, H>(
        dispatcher: &mut UsbHostDispatcher,
        class: C,
        host: H,
        image: &'static [u8],
        config: ControllerConfig,
    ) -> io::Result<Self>
    where
        C: DfuClass + Send + 'static,
        H: UsbHost + Send + 'static,
    {
        let (sender, inbox) = request_queue(config.queue_capacity);
        let controller =
            DfuController::new(class, host, image, config, sender.clone());
        let watch = controller.watch();
        Worker::new(controller, inbox).spawn(WORKER_NAME)?;
        dispatcher.register_event_callback(
            DFU_VID,
            DFU_PID,
            event_handler(sender.clone()),
        );
        info!(
            "waiting for accelerator {:04x}:{:04x}, {} byte image",
            DFU_VID,
            DFU_PID,
            image.len()
        );
        Ok(AcceleratorDfu { watch, sender })
    }

    pub fn state(&self) -> DfuState {
        self.watch.get()
    }

    /// Sender feeding the worker, for tasks that share its queue.
    pub fn sender(&self) -> &DfuSender {
        &self.sender
    }

    /// Block until the controller reaches `COMPLETE` or `ERROR`.
    pub fn wait(&self, timeout: Duration) -> Result<DfuState, WorkerError> {
        let start = Instant::now();
        loop {
            let state = self.watch.get();
            if state.is_terminal() {
                return Ok(state);
            }
            if start.elapsed() >= timeout {
                return Err(WorkerError::Timeout);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
