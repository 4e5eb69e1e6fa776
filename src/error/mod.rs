use thiserror::Error;

use crate::blob::BlobPtr;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GixError {
    #[error("index opened read-only, writes are not permitted")]
    ReadOnly,

    #[error("corrupt blob at {ptr:?}: {reason}")]
    Corrupt { ptr: BlobPtr, reason: String },

    #[error("cannot grow buffer of {current} items by {requested}")]
    Capacity { current: usize, requested: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GixError {
    pub fn corrupt<S: Into<String>>(ptr: BlobPtr, reason: S) -> Self {
        GixError::Corrupt {
            ptr,
            reason: reason.into(),
        }
    }
}

/// Reserves room for `additional` more items, surfacing allocation failure as
/// [`GixError::Capacity`] instead of aborting.
pub fn reserve<T>(v: &mut Vec<T>, additional: usize) -> anyhow::Result<()> {
    v.try_reserve(additional).map_err(|_| GixError::Capacity {
        current: v.len(),
        requested: additional,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_overflow() {
        let mut v: Vec<u64> = vec![1, 2, 3];
        let err = reserve(&mut v, usize::MAX).unwrap_err();
        assert_eq!(
            err.downcast_ref::<GixError>(),
            Some(&GixError::Capacity {
                current: 3,
                requested: usize::MAX
            })
        );
        reserve(&mut v, 10).unwrap();
        assert!(v.capacity() >= 13);
    }
}
