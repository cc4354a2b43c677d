//! Unit planning: maps `(total_size, unit_size)` to an ordered list of byte
//! ranges. Deterministic and pure; the indices assigned here are the permanent
//! unit identities for the rest of the transfer.

use crate::error::TransferError;
use crate::models::TransferUnit;

/// Splits `total_size` bytes into `ceil(total_size / unit_size)` contiguous
/// units: `floor(total_size / unit_size)` full units plus one remainder unit
/// when the division is not exact.
///
/// A zero-length file yields an empty plan (finalize runs with zero units).
/// Fails with a configuration error when `unit_size` is 0.
pub fn plan(total_size: u64, unit_size: u64) -> Result<Vec<TransferUnit>, TransferError> {
    if unit_size == 0 {
        return Err(TransferError::Configuration(
            "unit_size must be greater than 0".into(),
        ));
    }

    let full_units = total_size / unit_size;
    let remainder = total_size % unit_size;
    let count = full_units + u64::from(remainder != 0);

    let mut units = Vec::with_capacity(count as usize);
    let mut pos = 0u64;
    for index in 0..full_units {
        units.push(TransferUnit {
            index: index as usize,
            byte_from: pos,
            byte_to: pos + unit_size,
            length: unit_size,
            local_path: None,
            needs_persist: true,
        });
        pos += unit_size;
    }
    if remainder != 0 {
        units.push(TransferUnit {
            index: full_units as usize,
            byte_from: pos,
            byte_to: pos + remainder,
            length: remainder,
            local_path: None,
            needs_persist: true,
        });
    }
    Ok(units)
}
