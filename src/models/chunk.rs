//! One on-disk slice of an oversized object.

use std::path::PathBuf;

/// A byte-exact, contiguous slice of a staged file written to its own file.
///
/// Lives only while one object is being delivered; the file is removed as
/// soon as this part has been confirmed sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 1-based position; concatenating parts in this order rebuilds the object.
    pub part_number: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    pub local_path: PathBuf,
}
