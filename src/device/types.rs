use serde::Serialize;

use crate::backend::acl_backend::DeviceIndex;

/// Device family tag understood by host frameworks.
///
/// The NPU occupies the framework's private-use backend slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(i8)]
pub enum DeviceType {
    Cpu = 0,
    Npu = 20,
}

impl DeviceType {
    pub fn tag(self) -> i8 {
        self as i8
    }

    pub fn from_tag(tag: i8) -> Option<Self> {
        match tag {
            0 => Some(DeviceType::Cpu),
            20 => Some(DeviceType::Npu),
            _ => None,
        }
    }
}

/// A (type, index) device reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Device {
    pub device_type: DeviceType,
    pub index: DeviceIndex,
}

impl Device {
    pub fn npu(index: DeviceIndex) -> Self {
        Device {
            device_type: DeviceType::Npu,
            index,
        }
    }
}
