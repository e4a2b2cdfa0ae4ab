use std::sync::OnceLock;

use crate::models::BucketsInfo;

/// Holds the startup provisioning summary. Single writer, many readers: the
/// value is set exactly once after provisioning and read-only afterwards.
#[derive(Debug, Default)]
pub struct HealthState {
    buckets_info: OnceLock<BucketsInfo>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the provisioning summary. Returns false when a value was
    /// already stored; the first value is kept.
    pub fn set_buckets_info(&self, buckets_info: BucketsInfo) -> bool {
        self.buckets_info.set(buckets_info).is_ok()
    }

    /// `None` before the single write; reading that early is an invariant
    /// violation the health route answers with 500.
    pub fn buckets_info(&self) -> Option<&BucketsInfo> {
        self.buckets_info.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BucketStatus;

    #[test]
    fn unset_state_reads_none() {
        let state = HealthState::new();
        assert!(state.buckets_info().is_none());
    }

    #[test]
    fn second_write_is_rejected() {
        let state = HealthState::new();
        let mut first = BucketsInfo::new();
        first
            .source_buckets
            .insert("images".into(), BucketStatus::Created);

        assert!(state.set_buckets_info(first));

        let mut second = BucketsInfo::new();
        second.error = true;
        assert!(!state.set_buckets_info(second));

        let stored = state.buckets_info().unwrap();
        assert!(!stored.error);
        assert_eq!(
            stored.source_buckets.get("images"),
            Some(&BucketStatus::Created)
        );
    }
}
