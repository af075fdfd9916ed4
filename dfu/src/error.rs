use crate::class::{Operation, UsbError};
use crate::worker::QueueError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DfuError {
    UnsupportedDevice,
    ClassInit(UsbError),
    ClassCall(Operation, UsbError),
    Transfer(Operation, UsbError),
    Status { status: u8, state: u8 },
    ResponseTooShort { got: usize, expected: usize },
    VerificationMismatch { offset: usize },
    QueueFull,
    QueueClosed,
}

impl std::error::Error for DfuError {}

impl std::fmt::Display for DfuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuError::UnsupportedDevice => {
                write!(f, "No DFU interface on device")
            }
            DfuError::ClassInit(err) => {
                write!(f, "DFU class init failed: {}", err)
            }
            DfuError::ClassCall(op, err) => {
                write!(f, "Failed to issue {}: {}", op, err)
            }
            DfuError::Transfer(op, err) => {
                write!(f, "{} transfer failed: {}", op, err)
            }
            DfuError::Status { status, state } => {
                write!(
                    f,
                    "DFU status error: code {} in state {}",
                    status, state
                )
            }
            DfuError::ResponseTooShort { got, expected } => {
                write!(f, "Response too short: {} of {} bytes", got, expected)
            }
            DfuError::VerificationMismatch { offset } => {
                write!(f, "Read back firmware differs at offset {}", offset)
            }
            DfuError::QueueFull => write!(f, "Request queue full"),
            DfuError::QueueClosed => write!(f, "Request queue closed"),
        }
    }
}

impl From<QueueError> for DfuError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full => DfuError::QueueFull,
            QueueError::Closed => DfuError::QueueClosed,
        }
    }
}
