//! DFU 1.1 class requests framed as control transfer setup packets.

use crate::status::DFU_STATUS_LEN;

pub const DFU_CMD_DETACH: u8 = 0;
pub const DFU_CMD_DOWNLOAD: u8 = 1;
pub const DFU_CMD_UPLOAD: u8 = 2;
pub const DFU_CMD_GETSTATUS: u8 = 3;
pub const DFU_CMD_CLRSTATUS: u8 = 4;
pub const DFU_CMD_ABORT: u8 = 6;

// class request, recipient interface
const REQUEST_TYPE_OUT: u8 = 0x21;
const REQUEST_TYPE_IN: u8 = 0xA1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Setup stage of a DFU class request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub direction: Direction,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    fn out(request: u8, value: u16, interface: u8, length: u16) -> Self {
        ControlRequest {
            direction: Direction::Out,
            request,
            value,
            index: interface as u16,
            length,
        }
    }

    fn r#in(request: u8, value: u16, interface: u8, length: u16) -> Self {
        ControlRequest {
            direction: Direction::In,
            request,
            value,
            index: interface as u16,
            length,
        }
    }

    /// `DFU_DETACH`, `wValue` carries the timeout in milliseconds.
    pub fn detach(interface: u8, timeout_ms: u16) -> Self {
        Self::out(DFU_CMD_DETACH, timeout_ms, interface, 0)
    }

    pub fn dnload(interface: u8, block: u16, length: u16) -> Self {
        Self::out(DFU_CMD_DOWNLOAD, block, interface, length)
    }

    pub fn upload(interface: u8, block: u16, length: u16) -> Self {
        Self::r#in(DFU_CMD_UPLOAD, block, interface, length)
    }

    pub fn get_status(interface: u8) -> Self {
        Self::r#in(DFU_CMD_GETSTATUS, 0, interface, DFU_STATUS_LEN as u16)
    }

    pub fn clear_status(interface: u8) -> Self {
        Self::out(DFU_CMD_CLRSTATUS, 0, interface, 0)
    }

    pub fn abort(interface: u8) -> Self {
        Self::out(DFU_CMD_ABORT, 0, interface, 0)
    }

    /// `bmRequestType`
    pub fn request_type(&self) -> u8 {
        match self.direction {
            Direction::Out => REQUEST_TYPE_OUT,
            Direction::In => REQUEST_TYPE_IN,
        }
    }

    /// The 8-byte setup packet.
    pub fn to_setup_packet(&self) -> [u8; 8] {
        [
            self.request_type(),
            self.request,
            self.value as u8,
            (self.value >> 8) as u8,
            self.index as u8,
            (self.index >> 8) as u8,
            self.length as u8,
            (self.length >> 8) as u8,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detach_setup() {
        let req = ControlRequest::detach(0, 1000);
        assert_eq!(
            req.to_setup_packet(),
            [0x21, DFU_CMD_DETACH, 0xe8, 0x03, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_dnload_setup() {
        let req = ControlRequest::dnload(1, 2, 256);
        assert_eq!(req.direction, Direction::Out);
        assert_eq!(
            req.to_setup_packet(),
            [0x21, DFU_CMD_DOWNLOAD, 2, 0, 1, 0, 0x00, 0x01]
        );
        // zero-length commit
        assert_eq!(ControlRequest::dnload(1, 3, 0).length, 0);
    }

    #[test]
    fn test_in_requests() {
        let req = ControlRequest::get_status(0);
        assert_eq!(req.request_type(), 0xA1);
        assert_eq!(req.length, 6);

        let req = ControlRequest::upload(0, 7, 1);
        assert_eq!(
            req.to_setup_packet(),
            [0xA1, DFU_CMD_UPLOAD, 7, 0, 0, 0, 1, 0]
        );
    }
}
