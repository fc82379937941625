//! Partition layout computation for host media.
//!
//! Pure arithmetic: given the root content size and sizing policy, derive
//! the aligned two-partition MBR layout (FAT32 boot + ext4 root) and the
//! total image size. Reproducible bit-for-bit from the same inputs; the
//! device layer turns the result into `parted` script entries.

/// Byte layout of the two-partition host image.
///
/// Invariants (upheld by [`plan`], checked in tests):
/// `boot_start % alignment == 0`, `root_start % alignment == 0`,
/// `boot_end < root_start`, `image_size == root_start + root_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub alignment: u64,
    pub boot_start: u64,
    pub boot_size: u64,
    pub boot_end: u64,
    pub root_start: u64,
    pub root_size: u64,
    pub root_end: u64,
    pub image_size: u64,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Compute the layout.
///
/// `margin_fraction` and `margin_floor` add headroom to the root
/// partition: actual space usage rounds up to filesystem block size, and
/// the margin leaves free space on the provisioned host. Invalid inputs
/// (zero alignment, negative margins) are a caller contract violation.
pub fn plan(
    root_content_size: u64,
    boot_size: u64,
    alignment: u64,
    margin_fraction: f64,
    margin_floor: u64,
) -> PartitionLayout {
    debug_assert!(alignment > 0);
    debug_assert!(margin_fraction >= 0.0);

    let root_margin = (root_content_size as f64 * margin_fraction) as u64 + margin_floor;

    let boot_start = alignment;
    let boot_part_size = align_up(boot_size, alignment);
    let boot_end = boot_start + boot_part_size - 1;

    let root_start = boot_start + boot_part_size;
    let root_part_size = align_up(root_content_size + root_margin, alignment);
    let root_end = root_start + root_part_size - 1;

    PartitionLayout {
        alignment,
        boot_start,
        boot_size: boot_part_size,
        boot_end,
        root_start,
        root_size: root_part_size,
        root_end,
        image_size: root_start + root_part_size,
    }
}
