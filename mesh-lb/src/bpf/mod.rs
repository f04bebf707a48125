pub mod lbmap;
#[cfg(test)]
pub(crate) mod testing;

use std::borrow::BorrowMut;
use std::hash::Hash;

use aya::Pod;
use aya::maps::{HashMap, MapData, MapError};

use crate::{Error, Result};

pub trait BpfMap {
    type Key;
    type Value;
    fn update(&mut self, key: Self::Key, value: Self::Value) -> Result<()>;
    /// Deleting a key that is not present succeeds.
    fn delete(&mut self, key: &Self::Key) -> Result<()>;
    fn get(&self, key: &Self::Key) -> Result<Self::Value>;
    fn get_state(&self) -> Result<ahash::HashMap<Self::Key, Self::Value>>;
}

impl<T: BorrowMut<MapData>, K: Pod + Eq + Hash, V: Pod> BpfMap for HashMap<T, K, V> {
    type Key = K;
    type Value = V;

    fn update(&mut self, key: K, value: V) -> Result<()> {
        match self.insert(key, value, 0) {
            Ok(()) => Ok(()),
            Err(MapError::SyscallError(e)) if e.io_error.raw_os_error() == Some(libc::E2BIG) => {
                Err(Error::MapFull)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        match self.remove(key) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            Err(MapError::SyscallError(e)) if e.io_error.raw_os_error() == Some(libc::ENOENT) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, key: &K) -> Result<V> {
        Ok(<HashMap<T, K, V>>::get(self, key, 0)?)
    }

    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for v in self.iter() {
            match v {
                Ok((k, v)) => {
                    map.insert(k, v);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(map)
    }
}

/// Write-through cache in front of a map. Updates that would write the value
/// already present are skipped, deletes are always passed down.
pub struct BpfState<M>
where
    M: BpfMap,
{
    cache: ahash::HashMap<M::Key, M::Value>,
    bpf_map: M,
}

impl<M> BpfState<M>
where
    M: BpfMap,
    M::Key: Hash + Eq + Clone,
    M::Value: Clone + PartialEq,
{
    /// Wraps the map, seeding the cache with its current contents.
    pub fn try_new(bpf_map: M) -> Result<Self> {
        let cache = bpf_map.get_state()?;
        Ok(Self { cache, bpf_map })
    }

    pub fn update(&mut self, key: M::Key, value: M::Value) -> Result<()> {
        if let Some(current) = self.cache.get(&key)
            && *current == value
        {
            return Ok(());
        };
        match self.bpf_map.update(key.clone(), value.clone()) {
            Ok(_) => {
                self.cache.insert(key, value);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn delete(&mut self, key: &M::Key) -> Result<()> {
        match self.bpf_map.delete(key) {
            Ok(_) => {
                self.cache.remove(key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_from_cache(&self, key: &M::Key) -> Option<&M::Value> {
        self.cache.get(key)
    }

    /// Full dump of the underlying map, bypassing the cache.
    pub fn get_state(&self) -> Result<ahash::HashMap<M::Key, M::Value>> {
        self.bpf_map.get_state()
    }
}
