use std::{fmt::Display, io};

use dfu::{DfuError, DfuState, WorkerError};

pub enum CliError {
    IO(io::Error),
    Usb(nusb::Error),
    Dfu(DfuError),
    Worker(WorkerError),
    NoDFUDevice,
    ManyDFUDevices,
    NoImage,
    Failed(DfuState),
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<nusb::Error> for CliError {
    fn from(value: nusb::Error) -> Self {
        CliError::Usb(value)
    }
}

impl From<DfuError> for CliError {
    fn from(value: DfuError) -> Self {
        CliError::Dfu(value)
    }
}

impl From<WorkerError> for CliError {
    fn from(value: WorkerError) -> Self {
        CliError::Worker(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Usb(err) => write!(f, "USB error: {err}"),
            CliError::Dfu(err) => write!(f, "DFU error: {err}"),
            CliError::Worker(err) => write!(f, "Worker error: {err}"),
            CliError::NoDFUDevice => write!(f, "No DFU device"),
            CliError::ManyDFUDevices => write!(f, "More than one DFU devices"),
            CliError::NoImage => {
                write!(f, "No firmware image (give a file or --pattern)")
            }
            CliError::Failed(state) => write!(f, "DFU ended in state {state}"),
        }
    }
}
