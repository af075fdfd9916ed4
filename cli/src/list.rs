use nusb::MaybeFuture;

use accel_dfu::{DFU_PID, DFU_VID};

use crate::{CliError, usb::describe, usb::find_dfu_devices};

pub(crate) fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices =
        find_dfu_devices(vid.or(Some(DFU_VID)), pid.or(Some(DFU_PID)))?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(&devices);
    }
    Ok(())
}

fn print_devices(devices: &[nusb::DeviceInfo]) {
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x}",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
        );

        // descriptors need an open device
        let Ok(open_dev) = device.open().wait() else {
            continue;
        };
        let (configuration, descriptor) = describe(&open_dev);
        for interface in configuration.interfaces.iter().filter(|i| i.is_dfu())
        {
            println!(
                "  DFU interface {} (protocol={})",
                interface.number, interface.protocol,
            );
        }
        if let Some(desc) = descriptor {
            println!(
                "  DFU {:x}.{:02x}: transfer size {}, detach timeout {} ms ({}{}{})",
                desc.dfu_version() >> 8,
                desc.dfu_version() & 0xff,
                desc.transfer_size(),
                desc.detach_timeout(),
                if desc.can_download() { "d" } else { "" },
                if desc.can_upload() { "u" } else { "" },
                if desc.will_detach() { "w" } else { "" },
            );
        }
    }
}
