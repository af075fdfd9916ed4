#![allow(dead_code)]

use dfu::{
    ControllerConfig, DfuController, DfuSender, DfuState, UsbHostDispatcher,
    Worker, event_handler, request_queue,
    sim::{Call, SimulatedAccelerator},
};

pub const VID: u16 = 0x1a6e;
pub const PID: u16 = 0x089a;

pub type SimController =
    DfuController<SimulatedAccelerator, SimulatedAccelerator>;

/// Deterministic image: every byte depends on its offset.
pub fn image(len: usize) -> &'static [u8] {
    let data: Vec<u8> = (0..len).map(|i| (i * 7 + (i >> 8)) as u8).collect();
    Box::leak(data.into_boxed_slice())
}

pub struct Rig {
    pub sim: SimulatedAccelerator,
    pub dispatcher: UsbHostDispatcher,
    pub worker: Worker<SimController>,
    pub sender: DfuSender,
}

impl Rig {
    pub fn new(image: &'static [u8], sim: SimulatedAccelerator) -> Self {
        Self::with_config(image, sim, ControllerConfig::default())
    }

    pub fn with_config(
        image: &'static [u8],
        sim: SimulatedAccelerator,
        config: ControllerConfig,
    ) -> Self {
        let (sender, inbox) = request_queue(config.queue_capacity);
        let controller = DfuController::new(
            sim.clone(),
            sim.clone(),
            image,
            config,
            sender.clone(),
        );
        let mut dispatcher = UsbHostDispatcher::new();
        dispatcher.register_event_callback(
            VID,
            PID,
            event_handler(sender.clone()),
        );
        Rig {
            sim,
            dispatcher,
            worker: Worker::new(controller, inbox),
            sender,
        }
    }

    pub fn controller(&self) -> &SimController {
        self.worker.handler()
    }

    pub fn state(&self) -> DfuState {
        self.controller().state()
    }

    pub fn plug(&mut self) {
        self.sim.plug(&mut self.dispatcher, VID, PID);
    }

    pub fn unplug(&mut self) {
        self.sim.unplug(&mut self.dispatcher, VID, PID);
    }

    pub fn run(&mut self) -> usize {
        self.worker.run_pending()
    }

    /// Deliver held completions one at a time until `target` is entered
    /// with its operation in flight, or nothing is left to deliver.
    pub fn step_until(&mut self, target: DfuState) -> bool {
        loop {
            self.run();
            if self.state() == target {
                return true;
            }
            if !self.sim.complete_pending() {
                return false;
            }
        }
    }

    /// Deliver every held completion.
    pub fn run_to_end(&mut self) {
        loop {
            self.run();
            if !self.sim.complete_pending() {
                break;
            }
        }
    }
}

pub fn dnloads(calls: &[Call]) -> Vec<(u16, usize)> {
    calls
        .iter()
        .filter_map(|call| match call {
            Call::Dnload { block, length } => Some((*block, *length)),
            _ => None,
        })
        .collect()
}

pub fn uploads(calls: &[Call]) -> Vec<(u16, u16)> {
    calls
        .iter()
        .filter_map(|call| match call {
            Call::Upload { block, length } => Some((*block, *length)),
            _ => None,
        })
        .collect()
}

pub fn count(calls: &[Call], wanted: &Call) -> usize {
    calls.iter().filter(|call| *call == wanted).count()
}
