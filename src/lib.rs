#![doc = include_str!("../README.md")]
// Declare modules
pub mod ast;
pub mod buffer;
pub mod chunk;
pub mod error;
pub mod index;
mod json;
pub mod series;
pub mod table;
pub mod types;

/// Expression node of a calculated time series.
pub use crate::ast::NodeCalc;
/// Shared handle to an expression node.
pub use crate::ast::NodeRef;
/// Binary operators of the expression model.
pub use crate::ast::BinaryOperator;
/// Unary operators of the expression model.
pub use crate::ast::UnaryOperator;
/// Allocation seam for the big value buffers.
pub use crate::buffer::BufferAllocator;
/// Heap-backed allocator, the default.
pub use crate::buffer::HeapAllocator;
/// Segmented numeric buffer with lazy per-segment allocation.
pub use crate::buffer::BigDoubleBuffer;
/// Segmented text buffer with lazy per-segment allocation.
pub use crate::buffer::BigStringBuffer;
/// Array chunk of a numeric series, uncompressed or run-length-compressed.
pub use crate::chunk::DoubleDataChunk;
/// Array chunk of a text series.
pub use crate::chunk::StringDataChunk;
/// Outcome of a chunk compression attempt.
pub use crate::chunk::CompressionOutcome;
/// Error type for time-series operations.
pub use crate::error::TimeSeriesError;
/// Time index mapping positions to instants.
pub use crate::index::TimeSeriesIndex;
/// Expression-defined numeric series.
pub use crate::series::CalculatedTimeSeries;
/// Chunked numeric series.
pub use crate::series::StoredDoubleTimeSeries;
/// Chunked text series.
pub use crate::series::StoredStringTimeSeries;
/// Any series kind, as found in a JSON series list.
pub use crate::series::TimeSeries;
/// Lookup seam used by calculated series to reach their dependencies.
pub use crate::series::TimeSeriesNameResolver;
/// Multi-version columnar cache with statistics and CSV export.
pub use crate::table::TimeSeriesTable;
/// Element type of a series.
pub use crate::types::TimeSeriesDataType;
/// Metadata shared by stored and calculated series.
pub use crate::types::TimeSeriesMetadata;
/// Type alias for a set of tags (key-value pairs) attached to a series.
pub use crate::types::TagSet;
/// Type alias for a timestamp (milliseconds since epoch).
pub use crate::types::Timestamp;
