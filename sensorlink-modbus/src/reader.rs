//! Register read operation: one live read decoded into a raw numeric value.

use thiserror::Error;
use tracing::trace;

use crate::device::DeviceEntity;
use crate::protocol::ValueType;
use crate::transport::{RegisterTransport, TransportError};

/// Error type for register reads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The index does not exist in the device's table. A config mismatch,
    /// not a runtime fault.
    #[error("Device '{device}' has no descriptor at index {index} (table has {len} entries)")]
    Configuration {
        device: String,
        index: usize,
        len: usize,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Read the value described by `device`'s descriptor at `index`.
///
/// Returns the raw decoded magnitude; scaling to engineering units is the
/// caller's concern. Every call hits the bus; failures are returned as-is
/// without retrying.
pub async fn read_value<T: RegisterTransport>(
    transport: &mut T,
    device: &DeviceEntity,
    index: usize,
) -> Result<f64, ReadError> {
    let descriptor = *device.descriptor(index)?;

    let words = transport
        .read_registers(
            device.bus_address(),
            descriptor.function_code,
            descriptor.start_address,
            descriptor.register_count,
        )
        .await?;

    if words.len() != usize::from(descriptor.register_count) {
        return Err(TransportError::Malformed {
            expected: usize::from(descriptor.register_count),
            actual: words.len(),
        }
        .into());
    }

    let value = decode_words(&words, descriptor.value_type).ok_or(TransportError::Malformed {
        expected: usize::from(descriptor.register_count),
        actual: words.len(),
    })?;

    trace!(device = %device.name(), index, ?words, value, "Decoded register value");
    Ok(value)
}

/// Decode one or two registers, most significant register first.
///
/// Returns `None` for any other word count.
pub fn decode_words(words: &[u16], value_type: ValueType) -> Option<f64> {
    let value = match (words, value_type) {
        ([word], ValueType::UnsignedInteger) => f64::from(*word),
        ([word], ValueType::SignedInteger) => f64::from(*word as i16),
        ([high, low], value_type) => {
            let raw = (u32::from(*high) << 16) | u32::from(*low);
            match value_type {
                ValueType::UnsignedInteger => f64::from(raw),
                ValueType::SignedInteger => f64::from(raw as i32),
            }
        }
        _ => return None,
    };
    Some(value)
}
