use super::{ConfigError, ProcessId};

pub const DEFAULT_HORIZON: u64 = 8;

/// Membership and message retention policy for one run.
///
/// `n` and `f` are fixed for the lifetime of the run and must satisfy
/// `n = 3f + 1`. `horizon` bounds how many ranks ahead of the current one
/// messages are buffered; `retention` optionally bounds how many ranks behind
/// the current one are still answered (`None` answers every old rank).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub n: usize,
    pub f: usize,
    pub horizon: u64,
    pub retention: Option<u64>,
}

impl Config {
    pub fn new(n: usize, f: usize) -> Result<Self, ConfigError> {
        if n != 3 * f + 1 {
            return Err(ConfigError::InvalidMembership { n, f });
        }

        Ok(Config {
            n,
            f,
            horizon: DEFAULT_HORIZON,
            retention: None,
        })
    }

    /// Smallest valid membership tolerating `f` faults.
    pub fn for_faults(f: usize) -> Self {
        Config {
            n: 3 * f + 1,
            f,
            horizon: DEFAULT_HORIZON,
            retention: None,
        }
    }

    pub fn with_horizon(mut self, horizon: u64) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_retention(mut self, retention: u64) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    pub fn check_member(&self, id: ProcessId) -> Result<(), ConfigError> {
        if (id as usize) < self.n {
            Ok(())
        } else {
            Err(ConfigError::UnknownProcess { id, n: self.n })
        }
    }

    pub fn members(&self) -> impl Iterator<Item = ProcessId> {
        0..self.n as ProcessId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_membership() {
        assert_eq!(Config::new(4, 1).map(|c| c.quorum()), Ok(3));
        assert_eq!(Config::new(7, 2).map(|c| c.quorum()), Ok(5));
        assert_eq!(Config::new(1, 0).map(|c| c.quorum()), Ok(1));
        assert_eq!(
            Config::new(5, 1),
            Err(ConfigError::InvalidMembership { n: 5, f: 1 })
        );
        assert_eq!(
            Config::new(3, 1),
            Err(ConfigError::InvalidMembership { n: 3, f: 1 })
        );
    }

    #[test]
    fn test_member_range() {
        let config = Config::for_faults(1).with_horizon(2).with_retention(5);

        assert!(config.check_member(3).is_ok());
        assert_eq!(
            config.check_member(4),
            Err(ConfigError::UnknownProcess { id: 4, n: 4 })
        );
        assert_eq!(config.horizon, 2);
        assert_eq!(config.retention, Some(5));
        assert_eq!(config.members().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }
}
