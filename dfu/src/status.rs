use crate::error::DfuError;

pub const DFU_STATUS_LEN: usize = 6;

const DFU_STATUS_OK: u8 = 0x00;

pub const DFU_STATE_APP_DETACH: u8 = 0x01;
pub const DFU_STATE_DFU_IDLE: u8 = 0x02;
pub const DFU_STATE_DFU_DOWNLOAD_IDLE: u8 = 0x05;
pub const DFU_STATE_DFU_UPLOAD_IDLE: u8 = 0x09;
pub const DFU_STATE_DFU_ERROR: u8 = 0x0a;

/// Decoded `DFU_GETSTATUS` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    status: u8,
    poll_timeout: u32,
    state: u8,
    string_index: u8,
}

impl DfuStatus {
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN {
            return Err(DfuError::ResponseTooShort {
                got: data.len(),
                expected: DFU_STATUS_LEN,
            });
        }
        Ok(DfuStatus {
            status: data[0],
            poll_timeout: (data[3] as u32) << 16
                | (data[2] as u32) << 8
                | (data[1] as u32),
            state: data[4],
            string_index: data[5],
        })
    }

    /// Encode back into the 6-byte wire layout.
    pub fn to_bytes(&self) -> [u8; DFU_STATUS_LEN] {
        [
            self.status,
            self.poll_timeout as u8,
            (self.poll_timeout >> 8) as u8,
            (self.poll_timeout >> 16) as u8,
            self.state,
            self.string_index,
        ]
    }

    pub fn new(status: u8, state: u8) -> Self {
        DfuStatus {
            status,
            poll_timeout: 0,
            state,
            string_index: 0,
        }
    }

    /// `bStatus`
    pub fn status(&self) -> u8 {
        self.status
    }

    /// `bwPollTimeout`, in milliseconds
    pub fn poll_timeout(&self) -> u32 {
        self.poll_timeout
    }

    /// `bState`
    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        if self.status != DFU_STATUS_OK || self.state == DFU_STATE_DFU_ERROR {
            Err(DfuError::from(self))
        } else {
            Ok(())
        }
    }
}

impl From<&DfuStatus> for DfuError {
    fn from(st: &DfuStatus) -> Self {
        DfuError::Status {
            status: st.status,
            state: st.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let st = DfuStatus::parse(&[0, 0x10, 0x27, 0x00, 5, 0]).unwrap();
        assert_eq!(st.status(), 0);
        assert_eq!(st.poll_timeout(), 10_000);
        assert_eq!(st.state(), DFU_STATE_DFU_DOWNLOAD_IDLE);
        assert_eq!(st.ok(), Ok(()));
        assert_eq!(st.to_bytes(), [0, 0x10, 0x27, 0x00, 5, 0]);
    }

    #[test]
    fn test_short_status() {
        assert_eq!(
            DfuStatus::parse(&[0, 0, 0]),
            Err(DfuError::ResponseTooShort {
                got: 3,
                expected: DFU_STATUS_LEN
            })
        );
    }

    #[test]
    fn test_error_status() {
        // errVERIFY
        let st = DfuStatus::new(0x07, DFU_STATE_DFU_ERROR);
        assert_eq!(
            st.ok(),
            Err(DfuError::Status {
                status: 0x07,
                state: DFU_STATE_DFU_ERROR
            })
        );
        assert!(DfuStatus::new(0, DFU_STATE_DFU_ERROR).ok().is_err());
    }
}
