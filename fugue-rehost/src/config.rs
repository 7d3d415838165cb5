//! rehost configuration
//! 
//! tunables for training, optimization and replay, loadable from yaml

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::FitOptions;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read configuration `{}`: {}", _0.display(), _1)]
    Io(PathBuf, std::io::Error),
    #[error("cannot parse configuration: {0}")]
    Parse(serde_yaml::Error),
    #[error("cannot parse configuration `{}`: {}", _0.display(), _1)]
    ParseFile(PathBuf, serde_yaml::Error),
}

/// rehost configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RehostConfig {
    /// an edge is generalized to any value once it carries more than this
    /// many distinct values for one address
    pub wildcard_threshold: usize,
    /// interval between repeated interrupt injections
    pub interrupt_interval_ms: u64,
    /// seed for the markov read models
    pub markov_seed: u64,
    /// try the ordered read models before markov
    pub use_time_domain: bool,
}

impl Default for RehostConfig {
    fn default() -> Self {
        Self {
            wildcard_threshold: 5,
            interrupt_interval_ms: 10,
            markov_seed: 0x5eed_f00d,
            use_time_domain: true,
        }
    }
}

impl RehostConfig {
    pub fn from_yaml(input: impl AsRef<str>) -> Result<Self, Error> {
        serde_yaml::from_str(input.as_ref()).map_err(Error::Parse)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::Io(path.to_owned(), e))?;
        serde_yaml::from_reader(BufReader::new(file))
            .map_err(|e| Error::ParseFile(path.to_owned(), e))
    }

    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            use_time_domain: self.use_time_domain,
            seed: self.markov_seed,
        }
    }

    pub fn interrupt_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interrupt_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config = RehostConfig::from_yaml("wildcard_threshold: 3\n")
            .expect("failed to parse config");
        assert_eq!(config.wildcard_threshold, 3);
        assert_eq!(config.interrupt_interval_ms, 10);
        assert!(config.use_time_domain);
    }

    #[test]
    fn test_bad_config() {
        assert!(RehostConfig::from_yaml("wildcard_threshold: [1, 2]").is_err());
    }
}
