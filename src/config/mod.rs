use serde::{Deserialize, Serialize};

use crate::error::GixError;

/// How an index is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    /// Start from an empty index, discarding whatever was there.
    Create,
    /// Open an existing index for reading and writing.
    Update,
    ReadOnly,
    /// Open an index whose metadata may lag the blob file. Read-only.
    Restore,
}

impl Access {
    pub fn is_writable(self) -> bool {
        matches!(self, Access::Create | Access::Update)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GixConfig {
    /// Byte budget of the itemset cache.
    pub cache_size: u64,
    /// Work buffer length at which items are pushed into a new child.
    pub split_len: usize,
    pub split_len_min: usize,
    pub split_len_max: usize,
    /// Lets the first child stay below `split_len_min` instead of forcing a
    /// re-merge of the whole chain.
    pub allow_unfilled_first_child: bool,
    pub access: Access,
}

impl Default for GixConfig {
    fn default() -> Self {
        GixConfig {
            cache_size: 100_000_000,
            split_len: 1024,
            split_len_min: 512,
            split_len_max: 2048,
            allow_unfilled_first_child: true,
            access: Access::ReadOnly,
        }
    }
}

impl GixConfig {
    pub fn new(access: Access) -> Self {
        GixConfig {
            access,
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, cache_size: u64) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_split(mut self, split_len: usize, min: usize, max: usize) -> Self {
        self.split_len = split_len;
        self.split_len_min = min;
        self.split_len_max = max;
        self
    }

    pub fn with_unfilled_first_child(mut self, allow: bool) -> Self {
        self.allow_unfilled_first_child = allow;
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Accumulated size change after which the cache is re-measured.
    pub fn cache_reset_threshold(&self) -> u64 {
        self.cache_size / 10
    }

    pub fn validate(&self) -> Result<(), GixError> {
        if self.split_len == 0 {
            return Err(GixError::InvalidConfig("split_len must be positive".into()));
        }
        if self.split_len_min > self.split_len || self.split_len > self.split_len_max {
            return Err(GixError::InvalidConfig(format!(
                "split bounds must satisfy min <= len <= max, got {} <= {} <= {}",
                self.split_len_min, self.split_len, self.split_len_max
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GixConfig::default();
        assert_eq!(config.split_len, 1024);
        assert_eq!(config.cache_reset_threshold(), 10_000_000);
        assert!(!config.access.is_writable());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json() {
        let config: GixConfig =
            serde_json::from_str(r#"{"split_len": 100, "split_len_min": 50, "access": "Update"}"#)
                .unwrap();
        assert_eq!(config.split_len, 100);
        assert_eq!(config.split_len_max, 2048);
        assert_eq!(config.access, Access::Update);
        assert!(config.allow_unfilled_first_child);
    }

    #[test]
    fn test_validate() {
        assert!(GixConfig::default().with_split(0, 0, 0).validate().is_err());
        assert!(GixConfig::default().with_split(100, 150, 200).validate().is_err());
        assert!(GixConfig::default().with_split(100, 50, 99).validate().is_err());
        GixConfig::default().with_split(100, 50, 100).validate().unwrap();
    }
}
