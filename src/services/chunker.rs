//! Size-based splitting of staged files into byte-exact parts.
//!
//! Parts are plain slices, so the recipient rebuilds the object by
//! concatenating `name.part*` in part order. With ten or more parts the
//! part number is zero-padded to keep shell glob order equal to part order.

use crate::{
    errors::{RelayError, RelayResult},
    models::chunk::ChunkDescriptor,
};
use std::path::Path;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info};

/// Delivery endpoint's single-message ceiling: 50 MiB.
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Size of each part once a file is split: 1.8 GiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1_932_735_283;

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    split_threshold: u64,
    chunk_size: u64,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Chunker {
    pub fn new(split_threshold: u64, chunk_size: u64) -> RelayResult<Self> {
        if split_threshold == 0 {
            return Err(RelayError::validation("split threshold must be greater than zero"));
        }
        if chunk_size == 0 {
            return Err(RelayError::validation("chunk size must be greater than zero"));
        }
        Ok(Self {
            split_threshold,
            chunk_size,
        })
    }

    pub fn split_threshold(&self) -> u64 {
        self.split_threshold
    }

    /// True iff the file at `path` is at least the split threshold.
    pub async fn should_split(&self, path: &Path) -> RelayResult<bool> {
        let meta = fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(RelayError::validation(format!(
                "path is not a file: {}",
                path.display()
            )));
        }
        Ok(meta.len() >= self.split_threshold)
    }

    /// Write `path` out as ordered parts inside `output_dir`.
    ///
    /// The returned descriptors partition the file exactly; every part but
    /// the last is `chunk_size` bytes long.
    pub async fn split(&self, path: &Path, output_dir: &Path) -> RelayResult<Vec<ChunkDescriptor>> {
        let meta = fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(RelayError::validation(format!(
                "path is not a file: {}",
                path.display()
            )));
        }
        let total_size = meta.len();
        if total_size == 0 {
            return Err(RelayError::validation("cannot split an empty file"));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RelayError::validation("staged file has no usable name"))?;

        fs::create_dir_all(output_dir).await?;

        let plan = plan_chunks(total_size, self.chunk_size);
        let total_parts = plan.len() as u32;
        info!("Splitting {} ({} bytes) into {} parts", file_name, total_size, total_parts);

        let mut source = File::open(path).await?;
        let mut chunks = Vec::with_capacity(plan.len());

        for (index, (offset, length)) in plan.into_iter().enumerate() {
            let part_number = index as u32 + 1;
            let local_path = output_dir.join(part_file_name(file_name, part_number, total_parts));

            let mut dest = File::create(&local_path).await?;
            let copied = tokio::io::copy(&mut (&mut source).take(length), &mut dest).await?;
            dest.flush().await?;
            dest.sync_all().await?;

            if copied != length {
                return Err(RelayError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("part {} short: wrote {} of {} bytes", part_number, copied, length),
                )));
            }

            debug!("wrote {} ({} bytes at offset {})", local_path.display(), length, offset);
            chunks.push(ChunkDescriptor {
                part_number,
                byte_offset: offset,
                byte_length: length,
                local_path,
            });
        }

        Ok(chunks)
    }
}

/// `(offset, length)` ranges covering `total` bytes in `chunk_size` steps.
pub fn plan_chunks(total: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if total == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let mut ranges = Vec::with_capacity(total.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    while offset < total {
        let length = chunk_size.min(total - offset);
        ranges.push((offset, length));
        offset += length;
    }
    ranges
}

/// `name.partN`, zero-padded to the width of `total_parts`.
pub fn part_file_name(file_name: &str, part_number: u32, total_parts: u32) -> String {
    let width = total_parts.max(1).to_string().len();
    format!("{}.part{:0width$}", file_name, part_number, width = width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::TempDir;

    #[test]
    fn plan_partitions_exactly() {
        assert_eq!(plan_chunks(120, 50), vec![(0, 50), (50, 50), (100, 20)]);
        assert_eq!(plan_chunks(100, 50), vec![(0, 50), (50, 50)]);
        assert_eq!(plan_chunks(7, 50), vec![(0, 7)]);
        assert!(plan_chunks(0, 50).is_empty());

        for total in 1..200u64 {
            for size in [1u64, 3, 16, 64, 199] {
                let plan = plan_chunks(total, size);
                let mut expected_offset = 0;
                for (offset, length) in &plan {
                    assert_eq!(*offset, expected_offset);
                    assert!(*length > 0 && *length <= size);
                    expected_offset += length;
                }
                assert_eq!(expected_offset, total);
                let remainder = total % size;
                let last = plan.last().unwrap().1;
                assert_eq!(last, if remainder == 0 { size } else { remainder });
            }
        }
    }

    #[test]
    fn part_names_sort_in_part_order() {
        assert_eq!(part_file_name("dump.bin", 2, 3), "dump.bin.part2");
        assert_eq!(part_file_name("dump.bin", 2, 12), "dump.bin.part02");
        assert_eq!(part_file_name("dump.bin", 12, 12), "dump.bin.part12");
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(matches!(Chunker::new(0, 10), Err(RelayError::Validation(_))));
        assert!(matches!(Chunker::new(10, 0), Err(RelayError::Validation(_))));
    }

    #[tokio::test]
    async fn should_split_at_exact_threshold() {
        let dir = TempDir::new("chunker-threshold");
        let chunker = Chunker::new(64, 16).unwrap();

        let below = dir.write("below.bin", &[1u8; 63]).await;
        let exact = dir.write("exact.bin", &[1u8; 64]).await;
        let above = dir.write("above.bin", &[1u8; 65]).await;

        assert!(!chunker.should_split(&below).await.unwrap());
        assert!(chunker.should_split(&exact).await.unwrap());
        assert!(chunker.should_split(&above).await.unwrap());
    }

    #[tokio::test]
    async fn should_split_rejects_missing_and_directories() {
        let dir = TempDir::new("chunker-missing");
        let chunker = Chunker::default();

        assert!(chunker.should_split(&dir.path().join("nope")).await.is_err());
        assert!(matches!(
            chunker.should_split(dir.path()).await,
            Err(RelayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn split_round_trips_by_concatenation() {
        let dir = TempDir::new("chunker-split");
        let data: Vec<u8> = (0..120u32).map(|i| (i * 7 % 251) as u8).collect();
        let source = dir.write("dump.bin", &data).await;
        let out = dir.path().join("parts");

        let chunks = Chunker::new(50, 50).unwrap().split(&source, &out).await.unwrap();

        let lengths: Vec<_> = chunks.iter().map(|c| c.byte_length).collect();
        assert_eq!(lengths, vec![50, 50, 20]);
        assert_eq!(chunks[2].byte_offset, 100);
        assert_eq!(chunks[0].local_path, out.join("dump.bin.part1"));

        let mut rebuilt = Vec::new();
        for chunk in &chunks {
            let bytes = fs::read(&chunk.local_path).await.unwrap();
            assert_eq!(bytes.len() as u64, chunk.byte_length);
            rebuilt.extend(bytes);
        }
        assert_eq!(rebuilt, data);
    }

    #[tokio::test]
    async fn split_of_exact_multiple_has_full_last_part() {
        let dir = TempDir::new("chunker-multiple");
        let source = dir.write("even.bin", &[9u8; 100]).await;

        let chunks = Chunker::new(10, 25)
            .unwrap()
            .split(&source, dir.path())
            .await
            .unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.byte_length == 25));
    }

    #[tokio::test]
    async fn split_rejects_empty_file() {
        let dir = TempDir::new("chunker-empty");
        let source = dir.write("empty.bin", &[]).await;

        let result = Chunker::default().split(&source, dir.path()).await;
        assert!(matches!(result, Err(RelayError::Validation(_))));
    }
}
