//! # stragg
//!
//! Streaming GROUP BY aggregation over NUL-terminated string keys, executed
//! on a device.
//!
//! This crate provides:
//! - An aggregate function registry (`COUNT`, `uniqHLL12`)
//! - An open-addressed device hash table keyed by byte strings, with a
//!   bump-allocated key arena
//! - A multi-stream batch driver fed by a pinned staging ring with
//!   back-pressure and parallel packing
//! - The [`Aggregator`] facade: `start_processing`, `queue_data`,
//!   `wait_processed`, `get_result`, `destroy`
//! - An owning [`AggregateResult`] container with a merge protocol
//!
//! ## Example
//!
//! ```
//! use stragg_core::{Aggregator, AggregatorConfig, BatchBuilder};
//!
//! let config = AggregatorConfig::new("COUNT")
//!     .with_table_capacity(1024)
//!     .with_arena_capacity(64 * 1024);
//! let agg = Aggregator::new(config).unwrap();
//! agg.start_processing().unwrap();
//!
//! let mut batch = BatchBuilder::new();
//! for key in ["a", "b", "a", "a", "c"] {
//!     batch.push(key.as_bytes(), b"x");
//! }
//! agg.queue_data(&batch.as_batch(), 2).unwrap();
//! agg.wait_processed().unwrap();
//!
//! let result = agg.get_result().unwrap();
//! assert_eq!(result.get(b"a"), Some(3));
//! assert_eq!(result.get(b"b"), Some(1));
//! assert_eq!(result.len(), 3);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
// Offsets and slot indices cross between u32, u64 and usize on purpose;
// every width is bounded by the pre-flight checks.
#![allow(clippy::cast_possible_truncation)]

pub mod aggregator;
pub mod batch;
pub mod config;
pub mod error;
pub mod error_codes;
pub mod function;
pub mod guard;
pub mod hash;
pub mod reference;
pub mod result;
pub mod table;

mod kernel;
mod materialize;
mod staging;

pub use aggregator::{Aggregator, AggregatorState, AggregatorStats};
pub use batch::{Batch, BatchBuilder};
pub use config::AggregatorConfig;
pub use error::{Error, ErrorKind, Phase, Result};
pub use error_codes::DeviceFault;
pub use function::{AggregateDescriptor, AggregateFunction};
pub use reference::HostAggregator;
pub use result::AggregateResult;

pub use stragg_device::{DeviceContext, DeviceProperties};
