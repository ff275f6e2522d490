//! Target image sizing and allocation.

use std::io;
use std::path::Path;

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{StageError, StageResult};

/// Blocks needed to hold every source image plus `margin_blocks` of headroom.
///
/// `ceil(sum(sizes) / block_size) + margin_blocks`
pub fn compute_block_count(sizes: &[u64], block_size: u64, margin_blocks: u64) -> StageResult<u64> {
    if block_size == 0 {
        return Err(invalid("block size must be non-zero"));
    }
    let total = sizes
        .iter()
        .try_fold(0u64, |acc, size| acc.checked_add(*size))
        .ok_or_else(|| invalid("combined source size overflows"))?;
    total
        .div_ceil(block_size)
        .checked_add(margin_blocks)
        .ok_or_else(|| invalid("block count overflows"))
}

/// Create a zero-filled image of exactly `block_size * block_count` bytes in
/// `dir`.
///
/// The file is a [`NamedTempFile`]: it is deleted if dropped, and becomes the
/// output by persisting it. Space is reserved up front so a full disk fails
/// here rather than halfway through the payload copy.
pub fn allocate_image(
    dir: &Path,
    name: &str,
    block_size: u64,
    block_count: u64,
) -> StageResult<NamedTempFile> {
    let expected = block_size
        .checked_mul(block_count)
        .ok_or_else(|| invalid("image size overflows"))?;

    let available = fs2::available_space(dir).map_err(|e| {
        StageError::io(format!("querying free space in '{}'", dir.display()), e)
    })?;
    if available < expected {
        return Err(StageError::InsufficientSpace {
            dir: dir.to_path_buf(),
            needed: expected,
            available,
        });
    }

    let image = tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| StageError::io(format!("creating image file in '{}'", dir.display()), e))?;

    image
        .as_file()
        .allocate(expected)
        .map_err(|e| StageError::io(format!("reserving {} bytes", expected), e))?;

    let actual = image
        .as_file()
        .metadata()
        .map_err(|e| StageError::io("reading image metadata", e))?
        .len();
    if actual != expected {
        return Err(StageError::Allocation {
            path: image.path().to_path_buf(),
            expected,
            actual,
        });
    }

    info!(
        path = %image.path().display(),
        bytes = expected,
        blocks = block_count,
        "allocated target image"
    );
    Ok(image)
}

fn invalid(msg: &str) -> StageError {
    StageError::io("computing image size", io::Error::new(io::ErrorKind::InvalidInput, msg))
}
