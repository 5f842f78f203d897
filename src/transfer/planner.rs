//! Part Planner
//!
//! Splits an upload into multipart parts. Pure: no I/O, no store access.

/// Smallest part the remote store accepts (except the last part)
pub const MINIMUM_UPLOAD_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Most parts a single multipart upload may have
pub const MAXIMUM_UPLOAD_PARTS: u32 = 10_000;

/// Planner thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlanConfig {
    pub min_part_size: u64,
    pub max_parts: u32,
}

impl Default for PartPlanConfig {
    fn default() -> Self {
        Self {
            min_part_size: MINIMUM_UPLOAD_PART_SIZE,
            max_parts: MAXIMUM_UPLOAD_PARTS,
        }
    }
}

/// One contiguous byte range of the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedPart {
    pub offset: u64,
    pub size: u64,
    /// 0 for a single (non-multipart) plan, 1-based otherwise
    pub part_number: u32,
    pub is_last: bool,
}

/// Ordered parts covering a whole file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    parts: Vec<PlannedPart>,
}

impl PartPlan {
    /// True when the upload needs a summary record plus part records
    pub fn is_multipart(&self) -> bool {
        self.parts.first().is_some_and(|p| p.part_number > 0)
    }

    pub fn parts(&self) -> &[PlannedPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Sum of all part sizes
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }
}

/// Compute the part layout for a file of `file_size` bytes
///
/// Files no larger than `min_part_size` get a single plan. Otherwise the
/// part size is `max(min_part_size, ceil(file_size / max_parts))`, which
/// keeps the part count at or below `max_parts`.
pub fn plan(file_size: u64, min_part_size: u64, max_parts: u32) -> PartPlan {
    let min_part_size = min_part_size.max(1);
    let max_parts = u64::from(max_parts.max(1));

    if file_size <= min_part_size {
        return PartPlan {
            parts: vec![PlannedPart {
                offset: 0,
                size: file_size,
                part_number: 0,
                is_last: true,
            }],
        };
    }

    let part_size = min_part_size.max(file_size.div_ceil(max_parts));
    let part_count = file_size.div_ceil(part_size);

    let mut parts = Vec::with_capacity(part_count as usize);
    let mut offset = 0u64;
    let mut part_number = 1u32;
    while offset < file_size {
        let size = part_size.min(file_size - offset);
        parts.push(PlannedPart {
            offset,
            size,
            part_number,
            is_last: offset + size == file_size,
        });
        offset += size;
        part_number += 1;
    }

    PartPlan { parts }
}

/// [`plan`] with thresholds taken from a config
pub fn plan_with(file_size: u64, config: &PartPlanConfig) -> PartPlan {
    plan(file_size, config.min_part_size, config.max_parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn assert_plan_invariants(file_size: u64, min: u64, max_parts: u32) {
        let p = plan(file_size, min, max_parts);
        assert_eq!(p.total_size(), file_size, "size {}", file_size);
        assert!(p.len() <= max_parts.max(1) as usize);
        assert_eq!(p.parts().iter().filter(|x| x.is_last).count(), 1);
        if p.is_multipart() {
            for part in &p.parts()[..p.len() - 1] {
                assert!(part.size >= min, "part {:?} below min {}", part, min);
            }
        }
        let mut expected_offset = 0;
        for part in p.parts() {
            assert_eq!(part.offset, expected_offset);
            expected_offset += part.size;
        }
    }

    #[test]
    fn test_small_file_is_single() {
        let p = plan(MB, 5 * MB, 10_000);
        assert!(!p.is_multipart());
        assert_eq!(p.len(), 1);
        assert_eq!(p.parts()[0].size, MB);
        assert_eq!(p.parts()[0].part_number, 0);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(!plan(5 * MB, 5 * MB, 10_000).is_multipart());
        assert!(plan(5 * MB + 1, 5 * MB, 10_000).is_multipart());
    }

    #[test]
    fn test_hundred_megabytes_twenty_parts() {
        let p = plan(100 * MB, 5 * MB, 10_000);
        assert!(p.is_multipart());
        assert_eq!(p.len(), 20);
        assert!(p.parts().iter().all(|x| x.size == 5 * MB));
        let last = p.parts().last().unwrap();
        assert_eq!(last.part_number, 20);
        assert!(last.is_last);
        assert_eq!(p.parts().iter().filter(|x| x.is_last).count(), 1);
    }

    #[test]
    fn test_remainder_goes_to_last_part() {
        let p = plan(12 * MB, 5 * MB, 10_000);
        let sizes: Vec<u64> = p.parts().iter().map(|x| x.size).collect();
        assert_eq!(sizes, vec![5 * MB, 5 * MB, 2 * MB]);
        assert_eq!(p.parts()[2].offset, 10 * MB);
    }

    #[test]
    fn test_max_parts_pressure_grows_part_size() {
        let p = plan(1_000_000, 10, 7);
        assert!(p.len() <= 7);
        assert_eq!(p.parts()[0].size, 142_858);
        assert_plan_invariants(1_000_000, 10, 7);
    }

    #[test]
    fn test_degenerate_thresholds_are_clamped() {
        let p = plan(3, 0, 0);
        assert_eq!(p.total_size(), 3);
        assert_eq!(p.len(), 1);
        assert!(p.is_multipart());
    }

    #[test]
    fn test_empty_file() {
        let p = plan(0, 5 * MB, 10_000);
        assert!(!p.is_multipart());
        assert_eq!(p.parts()[0].size, 0);
        assert!(p.parts()[0].is_last);
    }

    #[test]
    fn test_invariants_over_size_grid() {
        for &min in &[1u64, 7, 64, 5 * MB] {
            for &max_parts in &[1u32, 2, 3, 17, 10_000] {
                for &size in &[0u64, 1, 6, 7, 8, 63, 64, 65, 1000, 5 * MB + 3, 123_456_789] {
                    assert_plan_invariants(size, min, max_parts);
                }
            }
        }
    }
}
