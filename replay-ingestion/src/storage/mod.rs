pub mod blob;
pub mod file_parts;
pub mod memory;
pub mod postgres;
pub mod reader;
pub mod s3;

pub use blob::{BlobStore, BlobStoreError};
pub use file_parts::{FilePart, FilePartRow, FilePartStore, FilePartStoreError};
pub use memory::{MemoryBlobStore, MemoryFilePartStore};
pub use reader::{SegmentLocation, SegmentReader};
