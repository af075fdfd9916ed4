//! DFU functional descriptor (DFU 1.1, section 4.1.3), advertised next to
//! the DFU interface descriptor.

pub const DFU_DESC_TYPE: u8 = 0x21;
pub const DFU_DESC_LEN: usize = 9;

const CAN_DNLOAD: u8 = 0x01;
const CAN_UPLOAD: u8 = 0x02;
const MANIFESTATION_TOLERANT: u8 = 0x04;
const WILL_DETACH: u8 = 0x08;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DfuDescriptor {
    bm_attributes: u8,
    w_detach_timeout: u16,
    w_transfer_size: u16,
    bcd_dfu_version: u16,
}

fn le16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

impl DfuDescriptor {
    /// Decode a raw descriptor starting at its `bLength` byte. Anything that
    /// is not a DFU functional descriptor gives `None`.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            [len, DFU_DESC_TYPE, attributes, rest @ ..]
                if *len as usize == DFU_DESC_LEN && rest.len() >= 6 =>
            {
                Some(DfuDescriptor {
                    bm_attributes: *attributes,
                    w_detach_timeout: le16(&rest[0..2]),
                    w_transfer_size: le16(&rest[2..4]),
                    bcd_dfu_version: le16(&rest[4..6]),
                })
            }
            _ => None,
        }
    }

    fn has(&self, bit: u8) -> bool {
        self.bm_attributes & bit != 0
    }

    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.has(CAN_DNLOAD)
    }

    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.has(CAN_UPLOAD)
    }

    /// The device still talks USB once manifestation is over.
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.has(MANIFESTATION_TOLERANT)
    }

    /// The device detaches and re-attaches by itself on `DFU_DETACH`.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.has(WILL_DETACH)
    }

    /// Longest `DFU_DETACH` timeout the device honours, in milliseconds.
    #[doc(alias = "wDetachTimeOut")]
    pub fn detach_timeout(&self) -> u16 {
        self.w_detach_timeout
    }

    /// Largest payload of a single `DNLOAD`/`UPLOAD`.
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.w_transfer_size
    }

    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.bcd_dfu_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let desc = DfuDescriptor::parse(&[
            9, 0x21, 0x0b, 0xe8, 0x03, 0x00, 0x01, 0x10, 0x01,
        ])
        .unwrap();
        assert!(desc.can_download());
        assert!(desc.can_upload());
        assert!(!desc.manifestation_tolerant());
        assert!(desc.will_detach());
        assert_eq!(desc.detach_timeout(), 1000);
        assert_eq!(desc.transfer_size(), 256);
        assert_eq!(desc.dfu_version(), 0x0110);
    }

    #[test]
    fn test_reject_other_descriptors() {
        assert_eq!(DfuDescriptor::parse(&[9, 0x04, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(DfuDescriptor::parse(&[9, 0x21, 0]), None);
    }
}
