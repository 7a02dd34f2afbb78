//! Binary serialization primitives.
//!
//! Everything the consensus wire format needs: a little-endian
//! [`BinaryWriter`], a bounds-checked [`MemoryReader`], and the
//! [`Serializable`] trait implemented by every on-wire type.

pub mod binary_writer;
pub mod error;
pub mod memory_reader;
pub mod serializable;

pub use binary_writer::BinaryWriter;
pub use error::{IoError, IoResult};
pub use memory_reader::MemoryReader;
pub use serializable::{helper, Serializable, SerializableExt};
