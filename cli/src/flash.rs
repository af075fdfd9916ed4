use std::time::Duration;

use log::info;
use nusb::MaybeFuture;

use accel_dfu::{AcceleratorDfu, DFU_PID, DFU_VID};
use dfu::{
    ControllerConfig, DfuState, EventStatus, HostEvent, UsbHostDispatcher,
};

use crate::{
    CliError,
    usb::{DEVICE, HOST, NusbClass, NusbHost, describe, find_dfu_devices},
};

fn get_accelerator() -> Result<nusb::DeviceInfo, CliError> {
    let mut devices = find_dfu_devices(Some(DFU_VID), Some(DFU_PID))?;
    match devices.len() {
        0 => Err(CliError::NoDFUDevice),
        1 => Ok(devices.remove(0)),
        _ => Err(CliError::ManyDFUDevices),
    }
}

pub(crate) fn flash(
    image: &'static [u8],
    chunk_size: Option<u16>,
    timeout: Duration,
) -> Result<(), CliError> {
    let info = get_accelerator()?;
    let device = info.open().wait()?;
    let (configuration, descriptor) = describe(&device);

    let mut config = ControllerConfig::default();
    if let Some(desc) = &descriptor {
        config = config.with_descriptor(desc);
    }
    if let Some(size) = chunk_size {
        config.chunk_size = size;
    }
    info!(
        "{} byte image, {} byte blocks, detach timeout {} ms",
        image.len(),
        config.chunk_size,
        config.detach_timeout_ms
    );

    let mut dispatcher = UsbHostDispatcher::new();
    let task = AcceleratorDfu::start(
        &mut dispatcher,
        NusbClass::new(device.clone()),
        NusbHost::new(device),
        image,
        config,
    )?;

    for event in
        [HostEvent::Attach(&configuration), HostEvent::EnumerationDone]
    {
        match dispatcher.dispatch(DFU_VID, DFU_PID, HOST, DEVICE, &event) {
            EventStatus::Success => {}
            EventStatus::NotSupported => return Err(CliError::NoDFUDevice),
            EventStatus::Busy => return Err(CliError::Failed(task.state())),
        }
    }

    match task.wait(timeout)? {
        DfuState::Complete => {
            println!("Flashed {} bytes", image.len());
            Ok(())
        }
        state => Err(CliError::Failed(state)),
    }
}
