//! Batch planner — picks the next instances to act on.

use jobupdate_state::{InstanceIndex, InstanceProgress};

/// Which way the update is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Select the next batch: ascending indices of eligible instances, capped
/// so that in-flight plus selected never exceeds `batch_size`.
///
/// Forward picks `Pending` instances; backward picks instances still on the
/// new configuration (`Updated` or `Failed`). In-flight instances are never
/// selected. An empty result means nothing is eligible.
pub fn next_batch(
    progress: &[InstanceProgress],
    batch_size: u32,
    direction: Direction,
) -> Vec<InstanceIndex> {
    let in_flight = progress.iter().filter(|p| p.is_in_flight()).count();
    let capacity = (batch_size as usize).saturating_sub(in_flight);

    progress
        .iter()
        .enumerate()
        .filter(|(_, p)| match direction {
            Direction::Forward => **p == InstanceProgress::Pending,
            Direction::Backward => p.is_on_new_config(),
        })
        .map(|(i, _)| i as InstanceIndex)
        .take(capacity)
        .collect()
}

/// True when no instance is left to move or in flight in `direction`.
pub fn is_complete(progress: &[InstanceProgress], direction: Direction) -> bool {
    progress.iter().all(|p| match direction {
        Direction::Forward => {
            !matches!(p, InstanceProgress::Pending | InstanceProgress::Updating)
        }
        Direction::Backward => !p.is_on_new_config() && !p.is_in_flight(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceProgress::*;

    #[test]
    fn forward_picks_lowest_pending_indices() {
        let progress = [Updated, Pending, Pending, Pending, Pending];
        assert_eq!(next_batch(&progress, 2, Direction::Forward), vec![1, 2]);
    }

    #[test]
    fn batch_is_capped_by_in_flight_instances() {
        let progress = [Updating, Pending, Pending, Pending];
        assert_eq!(next_batch(&progress, 2, Direction::Forward), vec![1]);
        let progress = [Updating, Updating, Pending];
        assert!(next_batch(&progress, 2, Direction::Forward).is_empty());
    }

    #[test]
    fn last_batch_may_be_short() {
        let progress = [Updated, Updated, Pending];
        assert_eq!(next_batch(&progress, 2, Direction::Forward), vec![2]);
    }

    #[test]
    fn backward_picks_touched_instances() {
        let progress = [Updated, Failed, Pending, Reverted, Updated];
        assert_eq!(next_batch(&progress, 10, Direction::Backward), vec![0, 1, 4]);
    }

    #[test]
    fn empty_when_nothing_eligible() {
        let progress = [Updated, Failed];
        assert!(next_batch(&progress, 3, Direction::Forward).is_empty());
        assert!(next_batch(&[], 3, Direction::Forward).is_empty());
    }

    #[test]
    fn completion_by_direction() {
        assert!(is_complete(&[Updated, Failed], Direction::Forward));
        assert!(!is_complete(&[Updated, Updating], Direction::Forward));
        assert!(!is_complete(&[Updated, Pending], Direction::Forward));

        assert!(is_complete(&[Reverted, Pending, RevertFailed], Direction::Backward));
        assert!(!is_complete(&[Reverted, Reverting], Direction::Backward));
        assert!(!is_complete(&[Reverted, Failed], Direction::Backward));
    }
}
