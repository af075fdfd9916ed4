//! Routing of host controller events to the class driver registered for a
//! device's Vendor/Product ID pair.

use log::{debug, error, info};

use crate::{
    class::{DeviceHandle, HostHandle},
    controller::{DeviceBinding, DfuSender, DfuState, Request},
    device::{Configuration, find_dfu_interface},
};

#[derive(Clone, Copy, Debug)]
pub enum HostEvent<'a> {
    /// Device attached; its active configuration is offered for matching.
    Attach(&'a Configuration),
    EnumerationDone,
    Detach,
    Other(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Success,
    /// The host stack ignores the device.
    NotSupported,
    /// The event could not be queued.
    Busy,
}

pub type EventCallback = Box<
    dyn FnMut(HostHandle, DeviceHandle, &HostEvent<'_>) -> EventStatus + Send,
>;

struct Registration {
    vid: u16,
    pid: u16,
    callback: EventCallback,
}

#[derive(Default)]
pub struct UsbHostDispatcher {
    registrations: Vec<Registration>,
}

impl UsbHostDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the driver for a Vendor/Product ID pair, replacing any
    /// previous registration of that pair.
    pub fn register_event_callback(
        &mut self,
        vid: u16,
        pid: u16,
        callback: EventCallback,
    ) {
        self.registrations
            .retain(|reg| reg.vid != vid || reg.pid != pid);
        self.registrations.push(Registration { vid, pid, callback });
    }

    pub fn dispatch(
        &mut self,
        vid: u16,
        pid: u16,
        host: HostHandle,
        device: DeviceHandle,
        event: &HostEvent<'_>,
    ) -> EventStatus {
        match self
            .registrations
            .iter_mut()
            .find(|reg| reg.vid == vid && reg.pid == pid)
        {
            Some(reg) => (reg.callback)(host, device, event),
            None => {
                debug!("no driver for {:04x}:{:04x}", vid, pid);
                EventStatus::NotSupported
            }
        }
    }
}

fn enqueue(sender: &DfuSender, request: Request) -> EventStatus {
    match sender.send(request) {
        Ok(()) => EventStatus::Success,
        Err(err) => {
            error!("dropping host event: {}", err);
            EventStatus::Busy
        }
    }
}

/// Event callback driving a DFU controller through `sender`.
///
/// Runs on the host stack's event context: it only matches the interface
/// and enqueues requests for the worker.
pub fn event_handler(sender: DfuSender) -> EventCallback {
    Box::new(move |host, device, event| match event {
        HostEvent::Attach(configuration) => {
            match find_dfu_interface(configuration) {
                Some(intf) => {
                    info!(
                        "DFU interface {} on {:?}",
                        intf.number, device
                    );
                    enqueue(
                        &sender,
                        Request::Bind(DeviceBinding {
                            host,
                            device,
                            interface: intf.handle,
                        }),
                    )
                }
                None => EventStatus::NotSupported,
            }
        }
        HostEvent::EnumerationDone => {
            enqueue(&sender, Request::NextState(DfuState::Attached))
        }
        HostEvent::Detach => {
            enqueue(&sender, Request::NextState(DfuState::Unattached))
        }
        HostEvent::Other(_) => EventStatus::Success,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        class::InterfaceHandle,
        controller::{Response, request_queue},
        device::{DFU_CLASS, DFU_SUBCLASS, InterfaceDescriptor},
        worker::{RequestHandler, Worker},
    };

    struct Collect(Vec<String>);

    impl RequestHandler for Collect {
        type Request = Request;
        type Response = Response;

        fn handle(&mut self, request: Request) -> Response {
            self.0.push(format!("{:?}", request));
            Response {
                state: DfuState::Unattached,
            }
        }
    }

    fn dfu_configuration() -> Configuration {
        Configuration {
            interfaces: vec![InterfaceDescriptor {
                handle: InterfaceHandle(7),
                number: 0,
                alternate_setting: 0,
                class: DFU_CLASS,
                subclass: DFU_SUBCLASS,
                protocol: 2,
            }],
        }
    }

    #[test]
    fn test_events_become_requests() {
        let (sender, inbox) = request_queue(8);
        let mut dispatcher = UsbHostDispatcher::new();
        dispatcher.register_event_callback(
            0x1a6e,
            0x089a,
            event_handler(sender),
        );
        let config = dfu_configuration();
        let (host, dev) = (HostHandle(1), DeviceHandle(2));

        for event in [
            HostEvent::Attach(&config),
            HostEvent::EnumerationDone,
            HostEvent::Other(0x42),
            HostEvent::Detach,
        ] {
            assert_eq!(
                dispatcher.dispatch(0x1a6e, 0x089a, host, dev, &event),
                EventStatus::Success
            );
        }

        let mut worker = Worker::new(Collect(vec![]), inbox);
        assert_eq!(worker.run_pending(), 3);
        let seen = &worker.handler().0;
        assert!(seen[0].starts_with("Bind"));
        assert!(seen[0].contains("InterfaceHandle(7)"));
        assert_eq!(seen[1], "NextState(Attached)");
        assert_eq!(seen[2], "NextState(Unattached)");
    }

    #[test]
    fn test_unsupported_device() {
        let (sender, inbox) = request_queue(8);
        let mut dispatcher = UsbHostDispatcher::new();
        dispatcher.register_event_callback(
            0x1a6e,
            0x089a,
            event_handler(sender),
        );
        let config = Configuration::default();

        assert_eq!(
            dispatcher.dispatch(
                0x1a6e,
                0x089a,
                HostHandle(0),
                DeviceHandle(0),
                &HostEvent::Attach(&config)
            ),
            EventStatus::NotSupported
        );
        // runtime identity is not ours
        assert_eq!(
            dispatcher.dispatch(
                0x18d1,
                0x9302,
                HostHandle(0),
                DeviceHandle(0),
                &HostEvent::Detach
            ),
            EventStatus::NotSupported
        );
        let mut worker = Worker::new(Collect(vec![]), inbox);
        assert_eq!(worker.run_pending(), 0);
    }

    #[test]
    fn test_saturated_queue_is_busy() {
        let (sender, _inbox) = request_queue(8);
        let mut handler = event_handler(sender);
        let statuses: Vec<EventStatus> = (0..9)
            .map(|_| {
                handler(HostHandle(0), DeviceHandle(0), &HostEvent::Detach)
            })
            .collect();
        assert!(statuses[..8].iter().all(|st| *st == EventStatus::Success));
        assert_eq!(statuses[8], EventStatus::Busy);
    }
}
