//! Virtual-to-physical sector translation.
//!
//! The single enforcement point keeping host I/O inside the visible
//! partition: nothing reaches the physical driver without passing here, so
//! the reserved tail and sibling partitions are unreachable from the host.

use crate::partition::Partition;

/// Requested range falls outside the visible partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Sectors {sector}+{count} outside partition of {partition_sectors} sectors")]
pub struct OutOfRange {
    pub sector: u32,
    pub count: u32,
    pub partition_sectors: u32,
}

/// Map partition-relative `sector` to a physical sector.
///
/// Accepts iff `start <= sector + start` and
/// `sector + start + count - 1 <= last`.
pub fn translate(partition: &Partition, sector: u32, count: u32) -> Result<u32, OutOfRange> {
    let error = OutOfRange {
        sector,
        count,
        partition_sectors: partition.sector_number,
    };

    let physical = sector as u64 + partition.start_sector as u64;
    // physical + count - 1 <= last, kept in u64 so count == 0 cannot underflow
    if physical + count as u64 > partition.last_sector as u64 + 1 {
        return Err(error);
    }
    u32::try_from(physical).map_err(|_| error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(start: u32, count: u32) -> Partition {
        Partition::public("p", start, count).unwrap()
    }

    #[test]
    fn test_first_and_last_sector() {
        let p = partition(100, 50);
        assert_eq!(translate(&p, 0, 1), Ok(100));
        assert_eq!(translate(&p, 49, 1), Ok(149));
        assert_eq!(translate(&p, 0, 50), Ok(100));
    }

    #[test]
    fn test_past_end_rejected() {
        let p = partition(100, 50);
        assert!(translate(&p, 50, 1).is_err());
        assert!(translate(&p, 49, 2).is_err());
        assert!(translate(&p, 0, 51).is_err());
    }

    #[test]
    fn test_error_reports_request() {
        let p = partition(0, 10);
        assert_eq!(
            translate(&p, 10, 4),
            Err(OutOfRange { sector: 10, count: 4, partition_sectors: 10 })
        );
    }

    #[test]
    fn test_no_overflow_near_u32_max() {
        let p = partition(u32::MAX - 9, 10);
        assert_eq!(translate(&p, 9, 1), Ok(u32::MAX));
        assert!(translate(&p, u32::MAX, 1).is_err());
        assert!(translate(&p, 0, u32::MAX).is_err());
    }

    /// Exhaustive check of the acceptance rule on a small partition
    #[test]
    fn test_acceptance_rule_matches_definition() {
        let p = partition(7, 5);
        for sector in 0..12u32 {
            for count in 0..8u32 {
                let physical = (sector + p.start_sector) as i64;
                let expected = p.start_sector as i64 <= physical
                    && physical + count as i64 - 1 <= p.last_sector as i64;
                assert_eq!(
                    translate(&p, sector, count).is_ok(),
                    expected,
                    "sector={} count={}",
                    sector,
                    count
                );
            }
        }
    }
}
