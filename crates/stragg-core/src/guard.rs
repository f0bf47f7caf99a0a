//! Pre-flight sizing, per-batch limits and device fault decoding.

use crate::batch::Batch;
use crate::config::AggregatorConfig;
use crate::error::{Error, Phase, Result};
use crate::error_codes::DeviceFault;
use crate::function::AggregateFunction;
use crate::table::layout::SlotLayout;
use crate::table::DeviceHashTable;

/// Largest table the compaction grid can index.
pub const MAX_TABLE_CAPACITY: usize = 1 << 31;

/// Largest per-buffer batch size; key lengths are stored in 32 bits.
pub const MAX_BATCH_BYTES: usize = u32::MAX as usize;

/// Largest record count per batch; one device thread per record.
pub const MAX_BATCH_RECORDS: usize = u32::MAX as usize - 1;

/// Validates a configuration and resolves its function. No side effects.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] for a zero count or capacity, a
/// non-power-of-two table, a byte limit below the record limit, or a limit
/// beyond the device's addressing; [`Error::UnknownFunction`] for an
/// unregistered function name.
pub fn preflight(config: &AggregatorConfig) -> Result<AggregateFunction> {
    let positive = [
        ("chunks_num", config.chunks_num),
        ("table_capacity", config.table_capacity),
        ("arena_capacity", config.arena_capacity),
        ("batch_max_records", config.batch_max_records),
        ("batch_max_bytes", config.batch_max_bytes),
        ("memcpy_threads", config.memcpy_threads),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(Error::config(Phase::Construct, format!("{name} must be positive")));
        }
    }
    if !config.table_capacity.is_power_of_two() {
        return Err(Error::config(
            Phase::Construct,
            format!("table_capacity {} is not a power of two", config.table_capacity),
        ));
    }
    if config.table_capacity > MAX_TABLE_CAPACITY {
        return Err(Error::config(
            Phase::Construct,
            format!("table_capacity {} exceeds {MAX_TABLE_CAPACITY}", config.table_capacity),
        ));
    }
    if config.batch_max_bytes < config.batch_max_records {
        return Err(Error::config(
            Phase::Construct,
            format!(
                "batch_max_bytes {} is below batch_max_records {}",
                config.batch_max_bytes, config.batch_max_records
            ),
        ));
    }
    if config.batch_max_bytes > MAX_BATCH_BYTES {
        return Err(Error::config(
            Phase::Construct,
            format!("batch_max_bytes {} exceeds {MAX_BATCH_BYTES}", config.batch_max_bytes),
        ));
    }
    if config.batch_max_records > MAX_BATCH_RECORDS {
        return Err(Error::config(
            Phase::Construct,
            format!("batch_max_records {} exceeds {MAX_BATCH_RECORDS}", config.batch_max_records),
        ));
    }

    let function = AggregateFunction::lookup(&config.function_name)?;
    let descriptor = function.descriptor();
    let layout = SlotLayout::new(descriptor.state_size, descriptor.state_align);
    if layout.table_bytes(config.table_capacity).is_none() {
        return Err(Error::config(
            Phase::Construct,
            format!(
                "{} slots of {} bytes overflow the address space",
                config.table_capacity, layout.stride
            ),
        ));
    }
    Ok(function)
}

/// Checks a batch against the per-batch limits. No side effects.
///
/// # Errors
///
/// Returns [`Error::BatchTooLarge`] naming the exceeded limit.
pub fn check_batch(batch: &Batch<'_>, config: &AggregatorConfig) -> Result<()> {
    let checks = [
        ("batch_max_records", batch.len(), config.batch_max_records),
        ("batch_max_bytes", batch.keys_buf().len(), config.batch_max_bytes),
        ("batch_max_bytes", batch.values_buf().len(), config.batch_max_bytes),
    ];
    for (limit, actual, max) in checks {
        if actual > max {
            return Err(Error::BatchTooLarge {
                limit,
                actual: actual as u64,
                max: max as u64,
            });
        }
    }
    Ok(())
}

/// Converts a device fault code into the matching capacity error.
#[must_use]
pub fn fault_error(fault: DeviceFault, table: &DeviceHashTable, phase: Phase) -> Error {
    match fault {
        DeviceFault::TableFull => Error::TableCapacityExceeded {
            phase,
            capacity: table.capacity() as u64,
        },
        DeviceFault::ArenaFull => Error::ArenaCapacityExceeded {
            phase,
            capacity: table.arena_capacity() as u64,
        },
    }
}

/// Reads the table's sticky error word.
///
/// # Errors
///
/// Returns the capacity error raised by the device, if any.
pub fn check_table(table: &DeviceHashTable, phase: Phase) -> Result<()> {
    match table.fault().map_err(|e| Error::device(phase, e))? {
        Some(fault) => Err(fault_error(fault, table, phase)),
        None => Ok(()),
    }
}
