use super::DriverError;
use crate::jobs::ClaimFilter;
use std::time::Duration;

pub const DEFAULT_SLOTS: usize = 3;
pub const DEFAULT_MAX_JOB_DURATION: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_LEASE_RENEWAL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Tuning of the slot pool and its housekeeping loops.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Prefix of every lease holder this driver uses.
    pub identity: String,
    pub slots: usize,
    pub max_job_duration: Duration,
    pub lease_duration: Duration,
    /// Must be shorter than `lease_duration`.
    pub lease_renewal_interval: Duration,
    /// Fallback wake-up for idle slots when no notification arrives.
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    /// Age after which history records are deleted. Zero keeps them forever.
    pub history_expiration: Duration,
    /// Claims allowed per job before cleanup fails it. Zero disables the limit.
    pub max_attempts: u32,
    pub progress_interval: Duration,
    /// Time a cancelled worker gets to return before it is dropped.
    pub abort_grace: Duration,
    /// Time `run` waits for in-flight slots after shutdown.
    pub shutdown_grace: Duration,
    pub claim_filter: ClaimFilter,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let uid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            identity: format!("job-controller-{}", &uid[..8]),
            slots: DEFAULT_SLOTS,
            max_job_duration: DEFAULT_MAX_JOB_DURATION,
            lease_duration: DEFAULT_LEASE_DURATION,
            lease_renewal_interval: DEFAULT_LEASE_RENEWAL_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            history_expiration: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            progress_interval: crate::workers::DEFAULT_PROGRESS_INTERVAL,
            abort_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            claim_filter: ClaimFilter::default(),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), DriverError> {
        let invalid = |msg: &str| Err(DriverError::InvalidConfig(msg.to_string()));
        if self.identity.is_empty() {
            return invalid("identity must not be empty");
        }
        if self.slots == 0 {
            return invalid("slots must be at least 1");
        }
        if self.max_job_duration.is_zero() {
            return invalid("max job duration must be positive");
        }
        if self.lease_duration.is_zero() || self.lease_renewal_interval.is_zero() {
            return invalid("lease duration and renewal interval must be positive");
        }
        if self.lease_renewal_interval >= self.lease_duration {
            return invalid("lease renewal interval must be shorter than the lease duration");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll interval must be positive");
        }
        // Slots aborting on shutdown still need their abort grace.
        if self.shutdown_grace <= self.abort_grace {
            return invalid("shutdown grace must be longer than the abort grace");
        }
        Ok(())
    }

    /// Filter used by every claim: the configured one, limited to jobs that
    /// still have attempts left.
    pub fn effective_claim_filter(&self) -> ClaimFilter {
        let mut filter = self.claim_filter.clone();
        if filter.max_attempts.is_none() && self.max_attempts > 0 {
            filter.max_attempts = Some(self.max_attempts);
        }
        filter
    }

    pub fn holder_for_slot(&self, slot: usize) -> String {
        format!("{}/slot-{}", self.identity, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slots, 3);
        assert_eq!(config.max_job_duration, Duration::from_secs(1200));
        assert_eq!(config.history_expiration, Duration::ZERO);
        assert!(config.identity.starts_with("job-controller-"));
    }

    #[test]
    fn test_renewal_must_be_shorter_than_lease() {
        let config = DriverConfig {
            lease_duration: Duration::from_secs(30),
            lease_renewal_interval: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_shutdown_grace_must_exceed_abort_grace() {
        let config = DriverConfig {
            abort_grace: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_slots_is_invalid() {
        let config = DriverConfig {
            slots: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_claim_filter_inherits_max_attempts() {
        let config = DriverConfig::default();
        assert_eq!(config.effective_claim_filter().max_attempts, Some(3));

        let unlimited = DriverConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(unlimited.effective_claim_filter().max_attempts, None);
    }

    #[test]
    fn test_holder_names_are_per_slot() {
        let config = DriverConfig {
            identity: "node-a".to_string(),
            ..Default::default()
        };
        assert_eq!(config.holder_for_slot(2), "node-a/slot-2");
    }
}
