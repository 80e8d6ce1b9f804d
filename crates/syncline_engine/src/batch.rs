//! Adaptive batch sizing.

/// Decides how many queued notifications go into one outbound batch.
///
/// Multiplicative increase after a fully processed batch, bounded by the
/// work that was actually attempted; multiplicative decrease after a
/// partial one. The size never drops below 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchController {
    size: usize,
    ceiling: Option<usize>,
}

impl BatchController {
    /// Creates a controller at the floor size of 1.
    pub fn new() -> Self {
        Self {
            size: 1,
            ceiling: None,
        }
    }

    /// Creates a controller capped at `ceiling` (at least 1).
    pub fn with_ceiling(ceiling: Option<usize>) -> Self {
        Self {
            size: 1,
            ceiling: ceiling.map(|c| c.max(1)),
        }
    }

    /// Returns the size to drain this cycle.
    pub fn current_size(&self) -> usize {
        self.size
    }

    /// Returns the configured ceiling.
    pub fn ceiling(&self) -> Option<usize> {
        self.ceiling
    }

    /// Adjusts the size after a dispatched cycle.
    ///
    /// `attempted` is the number of change messages the cycle sent.
    pub fn on_cycle_complete(&mut self, attempted: usize, fully_processed: bool) {
        if !fully_processed {
            self.size = (self.size / 2).max(1);
            return;
        }

        let grown = self.size.min(attempted).saturating_mul(2);
        let mut next = self.size.max(grown);
        if let Some(ceiling) = self.ceiling {
            next = next.min(ceiling);
        }
        self.size = next.max(1);
    }

    /// Drops back to the floor size.
    pub fn reset(&mut self) {
        self.size = 1;
    }
}

impl Default for BatchController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn starts_at_one() {
        assert_eq!(BatchController::new().current_size(), 1);
    }

    #[test]
    fn doubles_while_work_keeps_up() {
        let mut batch = BatchController::new();
        batch.on_cycle_complete(1, true);
        assert_eq!(batch.current_size(), 2);
        batch.on_cycle_complete(2, true);
        assert_eq!(batch.current_size(), 4);
        batch.on_cycle_complete(4, true);
        assert_eq!(batch.current_size(), 8);
    }

    #[test]
    fn growth_is_bounded_by_attempted_work() {
        let mut batch = BatchController::new();
        for _ in 0..4 {
            batch.on_cycle_complete(16, true);
        }
        assert_eq!(batch.current_size(), 16);

        // A sparse cycle does not push the size further.
        batch.on_cycle_complete(3, true);
        assert_eq!(batch.current_size(), 16);
        batch.on_cycle_complete(0, true);
        assert_eq!(batch.current_size(), 16);
    }

    #[test]
    fn halves_on_partial_completion() {
        let mut batch = BatchController::new();
        for _ in 0..3 {
            batch.on_cycle_complete(usize::MAX, true);
        }
        assert_eq!(batch.current_size(), 8);

        batch.on_cycle_complete(8, false);
        assert_eq!(batch.current_size(), 4);
        batch.on_cycle_complete(4, false);
        batch.on_cycle_complete(2, false);
        batch.on_cycle_complete(1, false);
        assert_eq!(batch.current_size(), 1);
    }

    #[test]
    fn ceiling_caps_growth() {
        let mut batch = BatchController::with_ceiling(Some(5));
        for _ in 0..10 {
            batch.on_cycle_complete(100, true);
        }
        assert_eq!(batch.current_size(), 5);
        assert_eq!(batch.ceiling(), Some(5));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut batch = BatchController::new();
        batch.on_cycle_complete(1, true);
        batch.on_cycle_complete(2, true);
        batch.reset();
        assert_eq!(batch.current_size(), 1);
    }

    proptest! {
        #[test]
        fn failures_converge_to_one(
            growth in proptest::collection::vec(0usize..1_000, 0..20),
            failures in 12usize..40,
        ) {
            let mut batch = BatchController::new();
            for attempted in growth {
                batch.on_cycle_complete(attempted, true);
            }
            for _ in 0..failures {
                batch.on_cycle_complete(batch.current_size(), false);
                prop_assert!(batch.current_size() >= 1);
            }
            prop_assert_eq!(batch.current_size(), 1);
        }

        #[test]
        fn success_never_decreases(
            steps in proptest::collection::vec((0usize..10_000, any::<bool>()), 1..60),
            ceiling in proptest::option::of(1usize..512),
        ) {
            let mut batch = BatchController::with_ceiling(ceiling);
            for (attempted, ok) in steps {
                let before = batch.current_size();
                batch.on_cycle_complete(attempted, ok);
                let after = batch.current_size();
                prop_assert!(after >= 1);
                if ok {
                    prop_assert!(after >= before);
                    prop_assert!(after <= before.max(before.min(attempted) * 2));
                }
                if let Some(ceiling) = ceiling {
                    prop_assert!(after <= ceiling);
                }
            }
        }
    }
}
