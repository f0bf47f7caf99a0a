//! Error types for the aggregation engine.

use std::fmt;

use stragg_device::DeviceError;

use crate::aggregator::AggregatorState;
use crate::error_codes as codes;

/// Result type for aggregation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle phase in which an error arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `Aggregator::new` / `with_context`.
    Construct,
    /// `start_processing`.
    Start,
    /// `queue_data`.
    Queue,
    /// `wait_processed`.
    Drain,
    /// `get_result`.
    Collect,
    /// `AggregateResult::merge`.
    Merge,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Construct => "construct",
            Self::Start => "start",
            Self::Queue => "queue",
            Self::Drain => "drain",
            Self::Collect => "collect",
            Self::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad capacities, non-power-of-two table, mismatched functions.
    ConfigurationInvalid,
    /// Function name not in the registry. A configuration error.
    UnknownFunction,
    /// Device selection or context creation failed.
    DeviceInit,
    /// A device allocation failed.
    OutOfDeviceMemory,
    /// A batch exceeds the configured per-batch limits.
    BatchTooLarge,
    /// A batch violates the offset or terminator invariants.
    MalformedBatch,
    /// Probe exhaustion in the device hash table.
    TableCapacityExceeded,
    /// Key arena overflow.
    ArenaCapacityExceeded,
    /// A device API call or kernel failed.
    DeviceKernelFault,
    /// Operation invoked in a state that does not permit it.
    StateMisuse,
    /// Internal invariant violated.
    Internal,
}

impl ErrorKind {
    /// Whether this kind belongs to the configuration family.
    #[must_use]
    pub const fn is_configuration(self) -> bool {
        matches!(self, Self::ConfigurationInvalid | Self::UnknownFunction)
    }

    /// Whether this kind is a device capacity overflow.
    #[must_use]
    pub const fn is_capacity(self) -> bool {
        matches!(self, Self::TableCapacityExceeded | Self::ArenaCapacityExceeded)
    }
}

/// Errors from aggregation operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration or incompatible operands.
    #[error("[SAG-0001] invalid configuration during {phase}: {reason}")]
    InvalidConfig {
        /// Failing phase.
        phase: Phase,
        /// What was wrong.
        reason: String,
    },

    /// Aggregate function name not recognized.
    #[error("[SAG-0002] unknown aggregate function `{0}`")]
    UnknownFunction(String),

    /// Device selection failed.
    #[error("[SAG-1001] device initialization failed during {phase}: {source}")]
    DeviceInit {
        /// Failing phase.
        phase: Phase,
        /// Device runtime error.
        #[source]
        source: DeviceError,
    },

    /// A device allocation failed.
    #[error("[SAG-1002] out of device memory during {phase}: {source}")]
    OutOfDeviceMemory {
        /// Failing phase.
        phase: Phase,
        /// Device runtime error.
        #[source]
        source: DeviceError,
    },

    /// Batch exceeds a per-batch limit.
    #[error("[SAG-2001] batch exceeds {limit}: {actual} > {max}")]
    BatchTooLarge {
        /// Name of the exceeded limit.
        limit: &'static str,
        /// Observed value.
        actual: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Batch violates the offset or terminator invariants.
    #[error("[SAG-2002] malformed batch: {0}")]
    MalformedBatch(String),

    /// The device hash table ran out of slots.
    #[error("[SAG-3001] hash table capacity of {capacity} slots exceeded during {phase}")]
    TableCapacityExceeded {
        /// Phase in which the overflow was observed.
        phase: Phase,
        /// Configured `table_capacity`.
        capacity: u64,
    },

    /// The key arena ran out of bytes.
    #[error("[SAG-3002] key arena capacity of {capacity} bytes exceeded during {phase}")]
    ArenaCapacityExceeded {
        /// Phase in which the overflow was observed.
        phase: Phase,
        /// Configured `arena_capacity`.
        capacity: u64,
    },

    /// A device command or kernel failed.
    #[error("[SAG-1003] device fault during {phase}: {source}")]
    DeviceKernelFault {
        /// Failing phase.
        phase: Phase,
        /// Device runtime error.
        #[source]
        source: DeviceError,
    },

    /// Operation not permitted in the current state.
    #[error("[SAG-0003] {phase} is not permitted in state {state}")]
    StateMisuse {
        /// Attempted operation.
        phase: Phase,
        /// State the aggregator was in.
        state: AggregatorState,
    },

    /// Internal invariant violated.
    #[error("[SAG-8001] internal error during {phase}: {reason}")]
    Internal {
        /// Failing phase.
        phase: Phase,
        /// Description.
        reason: String,
    },
}

impl Error {
    /// Classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } => ErrorKind::ConfigurationInvalid,
            Self::UnknownFunction(_) => ErrorKind::UnknownFunction,
            Self::DeviceInit { .. } => ErrorKind::DeviceInit,
            Self::OutOfDeviceMemory { .. } => ErrorKind::OutOfDeviceMemory,
            Self::BatchTooLarge { .. } => ErrorKind::BatchTooLarge,
            Self::MalformedBatch(_) => ErrorKind::MalformedBatch,
            Self::TableCapacityExceeded { .. } => ErrorKind::TableCapacityExceeded,
            Self::ArenaCapacityExceeded { .. } => ErrorKind::ArenaCapacityExceeded,
            Self::DeviceKernelFault { .. } => ErrorKind::DeviceKernelFault,
            Self::StateMisuse { .. } => ErrorKind::StateMisuse,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Lifecycle phase in which the error arose.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::UnknownFunction(_) => Phase::Construct,
            Self::BatchTooLarge { .. } | Self::MalformedBatch(_) => Phase::Queue,
            Self::InvalidConfig { phase, .. }
            | Self::DeviceInit { phase, .. }
            | Self::OutOfDeviceMemory { phase, .. }
            | Self::TableCapacityExceeded { phase, .. }
            | Self::ArenaCapacityExceeded { phase, .. }
            | Self::DeviceKernelFault { phase, .. }
            | Self::StateMisuse { phase, .. }
            | Self::Internal { phase, .. } => *phase,
        }
    }

    /// Stable `SAG-NNNN` code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ConfigurationInvalid => codes::INVALID_CONFIG,
            ErrorKind::UnknownFunction => codes::UNKNOWN_FUNCTION,
            ErrorKind::DeviceInit => codes::DEVICE_INIT,
            ErrorKind::OutOfDeviceMemory => codes::OUT_OF_DEVICE_MEMORY,
            ErrorKind::BatchTooLarge => codes::BATCH_TOO_LARGE,
            ErrorKind::MalformedBatch => codes::MALFORMED_BATCH,
            ErrorKind::TableCapacityExceeded => codes::TABLE_CAPACITY_EXCEEDED,
            ErrorKind::ArenaCapacityExceeded => codes::ARENA_CAPACITY_EXCEEDED,
            ErrorKind::DeviceKernelFault => codes::DEVICE_KERNEL_FAULT,
            ErrorKind::StateMisuse => codes::STATE_MISUSE,
            ErrorKind::Internal => codes::INTERNAL,
        }
    }

    pub(crate) fn config(phase: Phase, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            phase,
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(phase: Phase, reason: impl Into<String>) -> Self {
        Self::Internal {
            phase,
            reason: reason.into(),
        }
    }

    /// Maps a device runtime error to the matching kind.
    pub(crate) fn device(phase: Phase, source: DeviceError) -> Self {
        match source {
            DeviceError::InvalidDevice { .. } => Self::DeviceInit { phase, source },
            DeviceError::OutOfMemory { .. } | DeviceError::HostAlloc(_) => {
                Self::OutOfDeviceMemory { phase, source }
            }
            DeviceError::OutOfBounds { .. }
            | DeviceError::InvalidLaunch(_)
            | DeviceError::KernelFault { .. }
            | DeviceError::StreamClosed(_) => Self::DeviceKernelFault { phase, source },
        }
    }
}
