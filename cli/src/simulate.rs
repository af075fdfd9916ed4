use log::debug;

use accel_dfu::{DFU_PID, DFU_VID};
use dfu::{
    ControllerConfig, DfuController, DfuState, UsbHostDispatcher, Worker,
    event_handler, request_queue,
    sim::{Faults, SimulatedAccelerator},
};

use crate::CliError;

pub(crate) struct SimOptions {
    pub faults: Faults,
    pub defer: bool,
    pub chunk_size: Option<u16>,
}

/// Flash `image` into an in-memory accelerator and print every primitive
/// the controller invoked.
pub(crate) fn simulate(
    image: &'static [u8],
    options: SimOptions,
) -> Result<(), CliError> {
    let mut sim = SimulatedAccelerator::new(options.faults);
    if options.defer {
        sim = sim.deferred();
    }
    let mut config = ControllerConfig::default();
    if let Some(size) = options.chunk_size {
        config.chunk_size = size;
    }

    let (sender, inbox) = request_queue(config.queue_capacity);
    let controller = DfuController::new(
        sim.clone(),
        sim.clone(),
        image,
        config,
        sender.clone(),
    );
    let mut worker = Worker::new(controller, inbox);
    let mut dispatcher = UsbHostDispatcher::new();
    dispatcher.register_event_callback(DFU_VID, DFU_PID, event_handler(sender));

    sim.plug(&mut dispatcher, DFU_VID, DFU_PID);
    loop {
        let handled = worker.run_pending();
        debug!("{} requests, state {}", handled, worker.handler().state());
        if !sim.complete_pending() {
            break;
        }
    }

    for call in sim.calls() {
        println!("  {:?}", call);
    }
    let controller = worker.handler();
    println!(
        "{} of {} bytes verified, state {}",
        controller.bytes_transferred(),
        controller.bytes_to_transfer(),
        controller.state()
    );
    match (controller.state(), controller.last_error()) {
        (DfuState::Complete, _) => Ok(()),
        (_, Some(err)) => Err(CliError::Dfu(err.clone())),
        (state, None) => Err(CliError::Failed(state)),
    }
}
