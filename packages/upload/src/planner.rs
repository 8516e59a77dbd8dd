//! Splits a file size into contiguous, fixed-size part ranges.

use chunkpush_upload_models::ChunkPlanEntry;

use crate::PlanError;

/// Computes the ordered part ranges covering a file of `file_size` bytes.
///
/// Every entry except possibly the last is exactly `chunk_size` bytes; the
/// last holds whatever remains. An empty file yields a single zero-length
/// part so that it still produces an object on commit.
///
/// # Errors
///
/// Returns [`PlanError::InvalidInput`] if `chunk_size` is zero or the part
/// count does not fit in a `u32`.
pub fn plan(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkPlanEntry>, PlanError> {
    if chunk_size == 0 {
        return Err(PlanError::InvalidInput {
            message: "chunk size must be positive".to_string(),
        });
    }

    if file_size == 0 {
        return Ok(vec![ChunkPlanEntry {
            part_number: 1,
            offset: 0,
            length: 0,
        }]);
    }

    let count = file_size.div_ceil(chunk_size);
    let count = u32::try_from(count).map_err(|_| PlanError::InvalidInput {
        message: format!("{count} parts of {chunk_size} bytes exceeds the part number range"),
    })?;

    Ok((1..=count)
        .map(|part_number| {
            let offset = chunk_size * u64::from(part_number - 1);
            ChunkPlanEntry {
                part_number,
                offset,
                length: chunk_size.min(file_size - offset),
            }
        })
        .collect())
}
