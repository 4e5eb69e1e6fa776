use std::marker::PhantomData;

use anyhow::anyhow;
use serde::{de::DeserializeOwned, Serialize};

use crate::fs::{DbDir, DbFile};

pub const ROOT: &str = "ROOT";
const ROOT_TMP: &str = "ROOT_TMP";

/// The metadata file of an index directory. Writes go to a temp file which is
/// synced and then renamed over the live one, so a reader only ever sees a
/// complete version.
#[derive(Debug)]
pub struct Root<T, D>
where
    T: Serialize + DeserializeOwned,
    D: DbDir,
{
    dir: D,
    _data: PhantomData<T>,
}

impl<T, D> Root<T, D>
where
    T: Serialize + DeserializeOwned,
    D: DbDir,
{
    pub fn new(dir: D) -> Self {
        Root {
            dir,
            _data: PhantomData,
        }
    }

    pub fn exists(&mut self) -> anyhow::Result<bool> {
        Ok(self.dir.open(&ROOT)?.is_some())
    }

    pub fn load(&mut self) -> anyhow::Result<T> {
        let mut file = self
            .dir
            .open(&ROOT)?
            .ok_or_else(|| anyhow!("no {} file in index directory", ROOT))?;
        let contents = file.read_all()?;
        Ok(serde_json::from_slice(&contents)?)
    }

    pub fn write(&mut self, t: &T) -> anyhow::Result<()> {
        self.dir.unlink(&ROOT_TMP)?;
        let mut file = self
            .dir
            .create(&ROOT_TMP)?
            .ok_or_else(|| anyhow!("{} reappeared during write", ROOT_TMP))?;
        let encoded = serde_json::to_vec(t)?;
        file.write(&encoded)?;
        file.sync()?;

        self.dir.rename(&ROOT_TMP, &ROOT)?;

        Ok(())
    }
}
