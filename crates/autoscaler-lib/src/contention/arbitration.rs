//! Proportional sharing of oversubscribed node capacity

use crate::models::{BoundFlags, ResourceKind, ResourceVector};

/// Share of `available` for a contender desiring `desired` out of `total`
///
/// `floor(desired * available / total)`, computed without overflow. Zero or
/// negative inputs yield zero.
pub fn proportional(desired: i64, total: i64, available: i64) -> i64 {
    if desired <= 0 || total <= 0 || available <= 0 {
        return 0;
    }
    let share = (desired as i128 * available as i128) / total as i128;
    share as i64
}

/// Arbitrated resources of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub resources: ResourceVector,
    pub bounded: BoundFlags,
}

/// Result of arbitrating one node batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arbitration {
    pub allocations: Vec<Allocation>,
    pub desired_total: ResourceVector,
    /// Kinds whose desired total exceeded capacity
    pub oversubscribed: BoundFlags,
}

/// Fit the desired vectors of a node into its capacity
///
/// Kinds within capacity pass through unchanged. Oversubscribed kinds are
/// shared proportionally; the floor slack is not redistributed.
pub fn arbitrate(desired: &[ResourceVector], capacity: ResourceVector) -> Arbitration {
    let mut desired_total = ResourceVector::default();
    for kind in ResourceKind::ALL {
        let total = desired
            .iter()
            .fold(0i64, |sum, d| sum.saturating_add(d.get(kind).max(0)));
        desired_total.set(kind, total);
    }

    let mut oversubscribed = BoundFlags::default();
    for kind in ResourceKind::ALL {
        oversubscribed.set(kind, desired_total.get(kind) > capacity.get(kind));
    }

    let allocations = desired
        .iter()
        .map(|d| {
            let mut resources = *d;
            for kind in ResourceKind::ALL {
                if oversubscribed.get(kind) {
                    resources.set(
                        kind,
                        proportional(d.get(kind), desired_total.get(kind), capacity.get(kind)),
                    );
                }
            }
            Allocation {
                resources,
                bounded: oversubscribed,
            }
        })
        .collect();

    Arbitration {
        allocations,
        desired_total,
        oversubscribed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_cases() {
        assert_eq!(proportional(2, 4, 2), 1);
        assert_eq!(proportional(2, 2, 1), 1);
        assert_eq!(proportional(0, 2, 1), 0);
        assert_eq!(proportional(5, 0, 10), 0);
        assert_eq!(proportional(5, 10, 0), 0);
    }

    #[test]
    fn test_proportional_large_values_do_not_overflow() {
        let gib = 1i64 << 30;
        assert_eq!(proportional(64 * gib, 128 * gib, 100 * gib), 50 * gib);
    }

    #[test]
    fn test_shares_never_exceed_available() {
        let cases: &[(&[i64], i64)] = &[
            (&[1, 1, 1], 2),
            (&[7, 3, 11, 5], 13),
            (&[1000, 1, 1], 999),
            (&[333, 333, 334], 100),
            (&[5], 3),
        ];
        for (desired, available) in cases {
            let total: i64 = desired.iter().sum();
            let sum: i64 = desired
                .iter()
                .map(|&d| proportional(d, total, *available))
                .sum();
            assert!(sum <= *available, "{:?} into {}", desired, available);
        }
    }

    #[test]
    fn test_sole_contender_gets_everything() {
        let result = arbitrate(&[ResourceVector::new(500, 10)], ResourceVector::new(200, 100));
        assert_eq!(result.allocations[0].resources, ResourceVector::new(200, 10));
    }

    #[test]
    fn test_two_to_one_split() {
        let result = arbitrate(
            &[ResourceVector::new(200, 64), ResourceVector::new(100, 64)],
            ResourceVector::new(200, 1024),
        );

        let cpu: Vec<i64> = result
            .allocations
            .iter()
            .map(|a| a.resources.cpu_millicores)
            .collect();
        assert_eq!(cpu, vec![133, 66]);
        assert_eq!(result.desired_total, ResourceVector::new(300, 128));
        assert!(result.oversubscribed.cpu);
        assert!(!result.oversubscribed.memory);
        assert!(result.allocations.iter().all(|a| a.bounded.cpu && !a.bounded.memory));
        // Memory fits and passes through
        assert!(result.allocations.iter().all(|a| a.resources.memory_bytes == 64));
    }

    #[test]
    fn test_exact_fit_is_not_oversubscribed() {
        let result = arbitrate(
            &[ResourceVector::new(100, 1), ResourceVector::new(100, 1)],
            ResourceVector::new(200, 2),
        );
        assert_eq!(result.oversubscribed, BoundFlags::default());
        assert_eq!(result.allocations[1].resources, ResourceVector::new(100, 1));
    }
}
