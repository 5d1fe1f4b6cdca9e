use crate::common::{Config, ConfigError, ProcessId, Pubkey};

/// Public keys of the membership, indexed by process id.
#[derive(Debug, Clone)]
pub struct Peers {
    pub members: Vec<Pubkey>,
}

impl Peers {
    pub fn new(members: Vec<Pubkey>) -> Self {
        Peers { members }
    }

    /// Builds the key table, refusing one that does not cover the membership.
    pub fn for_config(config: &Config, members: Vec<Pubkey>) -> Result<Self, ConfigError> {
        if members.len() != config.n {
            return Err(ConfigError::KeyCount {
                expected: config.n,
                actual: members.len(),
            });
        }
        Ok(Peers { members })
    }

    pub fn key(&self, id: ProcessId) -> Option<&Pubkey> {
        self.members.get(id as usize)
    }

    pub fn is_member(&self, id: ProcessId) -> bool {
        (id as usize) < self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Keypair;

    #[test]
    fn test_key_table_matches_membership() {
        let config = Config::for_faults(1);
        let keys: Vec<Pubkey> = (0..4u8).map(|i| Keypair::from_seed([i; 32]).pubkey()).collect();

        let peers = Peers::for_config(&config, keys.clone()).unwrap();
        assert!(peers.is_member(3));
        assert!(!peers.is_member(4));
        assert_eq!(peers.key(2), Some(&keys[2]));

        assert_eq!(
            Peers::for_config(&config, keys[..3].to_vec()).unwrap_err(),
            ConfigError::KeyCount {
                expected: 4,
                actual: 3
            }
        );
    }
}
