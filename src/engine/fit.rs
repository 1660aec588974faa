//! Free-block search policies.

use super::block::{BlockId, Blocks};
use super::classes::{class_of, FreeRegistry, NUM_SIZE_CLASSES};
use crate::error::ParseNameError;
use core::{fmt, str::FromStr};

/// How the engine picks a free block for an allocation.
///
/// All policies find a block whenever one large enough exists; they differ only
/// in which block they choose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FitPolicy {
    /// The lowest-addressed free block that is large enough.
    #[default]
    FirstFit,

    /// The smallest free block that is large enough, ties going to the lowest
    /// address.
    BestFit,

    /// The first large-enough block in the requested size's class, or else in
    /// the next non-empty larger class.
    SegregatedFit,
}

impl FitPolicy {
    /// Every policy, in declaration order.
    pub const ALL: [FitPolicy; 3] = [
        FitPolicy::FirstFit,
        FitPolicy::BestFit,
        FitPolicy::SegregatedFit,
    ];

    fn name(self) -> &'static str {
        match self {
            FitPolicy::FirstFit => "first-fit",
            FitPolicy::BestFit => "best-fit",
            FitPolicy::SegregatedFit => "segregated-fit",
        }
    }
}

impl fmt::Display for FitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FitPolicy {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.name() == s)
            .ok_or_else(|| ParseNameError::new("fit policy", s))
    }
}

/// Find a free block of at least `size` bytes.
pub(crate) fn find_fit(
    blocks: &Blocks,
    registry: &FreeRegistry,
    size: u32,
    policy: FitPolicy,
) -> Option<BlockId> {
    let fits = |id: &BlockId| !blocks[*id].allocated && blocks[*id].size >= size;
    match policy {
        FitPolicy::FirstFit => blocks.iter().map(|(id, _)| id).find(fits),
        FitPolicy::BestFit => blocks
            .iter()
            .map(|(id, _)| id)
            .filter(fits)
            .fold(None, |best: Option<BlockId>, id| match best {
                Some(best) if blocks[best].size <= blocks[id].size => Some(best),
                _ => Some(id),
            }),
        FitPolicy::SegregatedFit => (class_of(size)..NUM_SIZE_CLASSES)
            .find_map(|class| registry.iter_class(blocks, class).find(fits)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    /// Lay out `(size, free)` blocks contiguously from address 0 and register
    /// the free ones.
    fn layout(shape: &[(u32, bool)]) -> (Blocks, FreeRegistry) {
        let mut blocks = Blocks::new(0);
        let registry = FreeRegistry::new(&mut blocks);
        let mut address = 0;
        for &(size, free) in shape {
            let id = blocks.append(address, size);
            address += size;
            if free {
                registry.add(&mut blocks, id);
            } else {
                blocks[id].allocated = true;
            }
        }
        (blocks, registry)
    }

    fn fit_address(
        blocks: &Blocks,
        registry: &FreeRegistry,
        size: u32,
        policy: FitPolicy,
    ) -> Option<u32> {
        find_fit(blocks, registry, size, policy).map(|id| blocks[id].address)
    }

    #[test]
    fn first_fit_takes_the_lowest_address() {
        let (blocks, registry) = layout(&[(64, true), (8, false), (32, true), (8, false)]);
        assert_eq!(fit_address(&blocks, &registry, 24, FitPolicy::FirstFit), Some(0));
        assert_eq!(fit_address(&blocks, &registry, 72, FitPolicy::FirstFit), None);
    }

    #[test]
    fn best_fit_takes_the_smallest_and_breaks_ties_by_address() {
        let (blocks, registry) = layout(&[
            (64, true),
            (8, false),
            (32, true),
            (8, false),
            (32, true),
            (8, false),
        ]);
        assert_eq!(fit_address(&blocks, &registry, 24, FitPolicy::BestFit), Some(72));
        assert_eq!(fit_address(&blocks, &registry, 40, FitPolicy::BestFit), Some(0));
    }

    #[test]
    fn segregated_fit_moves_up_to_larger_classes() {
        // Request 130 bytes (aligned to 136). The only sufficient block is
        // 200 bytes. Both sizes are in class 9, so this case is found in the
        // request's own class without scanning upwards.
        let (blocks, registry) = layout(&[
            (64, true),
            (8, false),
            (128, true),
            (8, false),
            (200, true),
            (8, false),
        ]);
        assert_eq!(
            fit_address(&blocks, &registry, 136, FitPolicy::SegregatedFit),
            Some(208)
        );

        // Scanning upwards: a 100-byte request is class 8 (72..=128 bytes),
        // which is empty, so the 200-byte block is found in class 9.
        let (blocks, registry) = layout(&[(64, true), (8, false), (200, true), (8, false)]);
        assert_eq!(
            fit_address(&blocks, &registry, 100, FitPolicy::SegregatedFit),
            Some(72)
        );
        assert_eq!(fit_address(&blocks, &registry, 208, FitPolicy::SegregatedFit), None);
    }

    #[test]
    fn all_policies_agree_on_whether_a_fit_exists() {
        let (blocks, registry) = layout(&[(16, true), (8, false), (48, true), (8, false), (520, true)]);
        for size in (8..=600).step_by(8) {
            let found: alloc::vec::Vec<bool> = FitPolicy::ALL
                .iter()
                .map(|p| find_fit(&blocks, &registry, size, *p).is_some())
                .collect();
            assert!(found.iter().all(|f| *f == found[0]), "disagreement at {size}");
        }
    }

    #[test]
    fn policy_names_round_trip() {
        for policy in FitPolicy::ALL {
            assert_eq!(policy.to_string().parse::<FitPolicy>().unwrap(), policy);
        }
        assert!("worst-fit".parse::<FitPolicy>().is_err());
    }
}
