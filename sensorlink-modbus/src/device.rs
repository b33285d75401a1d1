//! Device entities: a bus address bound to one protocol table.

use crate::protocol::RegisterDescriptor;
use crate::reader::ReadError;

/// A Modbus device on the shared bus.
///
/// Built once at startup and never mutated; the descriptor table is owned
/// by value so index lookups stay stable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntity {
    bus_address: u8,
    name: String,
    model: String,
    descriptors: Vec<RegisterDescriptor>,
}

impl DeviceEntity {
    /// Create a device from its address, names and protocol table.
    pub fn new(
        bus_address: u8,
        name: impl Into<String>,
        model: impl Into<String>,
        descriptors: impl Into<Vec<RegisterDescriptor>>,
    ) -> Self {
        Self {
            bus_address,
            name: name.into(),
            model: model.into(),
            descriptors: descriptors.into(),
        }
    }

    /// Modbus unit/slave address.
    pub fn bus_address(&self) -> u8 {
        self.bus_address
    }

    /// Human-readable identifier, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device model whose table this device uses.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The full protocol table, in index order.
    pub fn descriptors(&self) -> &[RegisterDescriptor] {
        &self.descriptors
    }

    /// Look up a descriptor by index.
    pub fn descriptor(&self, index: usize) -> Result<&RegisterDescriptor, ReadError> {
        self.descriptors
            .get(index)
            .ok_or_else(|| ReadError::Configuration {
                device: self.name.clone(),
                index,
                len: self.descriptors.len(),
            })
    }
}

impl std::fmt::Display for DeviceEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} @ {})", self.name, self.model, self.bus_address)
    }
}
