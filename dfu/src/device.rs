use crate::class::InterfaceHandle;

pub const DFU_CLASS: u8 = 0xFE;
pub const DFU_SUBCLASS: u8 = 0x1;

/// Interface descriptor fields the host stack hands over on attach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub handle: InterfaceHandle,
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    pub fn is_dfu(&self) -> bool {
        self.class == DFU_CLASS && self.subclass == DFU_SUBCLASS
    }
}

/// Active configuration of an attached device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Configuration {
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// First interface of the configuration speaking DFU.
pub fn find_dfu_interface(
    configuration: &Configuration,
) -> Option<&InterfaceDescriptor> {
    configuration.interfaces.iter().find(|intf| intf.is_dfu())
}
