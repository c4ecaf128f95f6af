//! Checkpoint boundary decisions.

/// Decides when buffered state is safe to flush and checkpoint.
///
/// Multipart protocols reject non-final parts below a minimum size, so a
/// boundary is only taken once a full part is buffered or the source is
/// exhausted. This is the single place that knows about that constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    part_size_threshold: usize,
}

impl CheckpointPolicy {
    pub fn new(part_size_threshold: usize) -> Self {
        Self {
            part_size_threshold,
        }
    }

    pub fn part_size_threshold(&self) -> usize {
        self.part_size_threshold
    }

    /// `true` when a full part is buffered or the source is exhausted.
    pub fn should_checkpoint_now(&self, current_buffer_size: usize, is_end_of_data: bool) -> bool {
        is_end_of_data || current_buffer_size >= self.part_size_threshold
    }

    /// Whether a buffer of this size may be uploaded as a non-final part.
    pub fn is_full_part(&self, size: usize) -> bool {
        size >= self.part_size_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;

    #[test]
    fn test_threshold_boundary() {
        let policy = CheckpointPolicy::new(5 * MIB);
        assert!(!policy.should_checkpoint_now(5 * MIB - 1, false));
        assert!(policy.should_checkpoint_now(5 * MIB, false));
        assert!(policy.should_checkpoint_now(6 * MIB, false));
    }

    #[test]
    fn test_end_of_data_forces_checkpoint() {
        let policy = CheckpointPolicy::new(5 * MIB);
        let almost = (4.9 * MIB as f64) as usize;
        assert!(!policy.should_checkpoint_now(almost, false));
        assert!(policy.should_checkpoint_now(almost, true));
        assert!(policy.should_checkpoint_now(0, true));
    }
}
