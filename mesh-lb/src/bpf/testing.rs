//! In-memory maps for unit tests. A `TestMap` is a cheap handle: clones share
//! the same contents so a test can keep one handle while the reconciler owns
//! another.

use std::hash::Hash;
use std::sync::{Arc, Mutex};

use mesh_lb_ebpf_common::service::{
    AffinityMatchKey, AffinityMatchValue, BackendKey, BackendValueV4, BackendValueV6, RevNatKey,
    RevNatValueV4, RevNatValueV6, ServiceKeyV4, ServiceKeyV6, ServiceValue,
};

use crate::bpf::BpfMap;
use crate::bpf::lbmap::BpfLbMaps;
use crate::{Error, Result};

struct Inner<K, V> {
    entries: ahash::HashMap<K, V>,
    capacity: usize,
    mutations: usize,
    fail_after: Option<usize>,
}

pub(crate) struct TestMap<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for TestMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> TestMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: ahash::HashMap::default(),
                capacity,
                mutations: 0,
                fail_after: None,
            })),
        }
    }

    pub fn entries(&self) -> ahash::HashMap<K, V> {
        self.inner.lock().unwrap().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn get_entry(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().entries.get(key).cloned()
    }

    /// Inserts behind the reconciler's back, e.g. to simulate rows left over
    /// from a previous run.
    pub fn seed(&self, key: K, value: V) {
        self.inner.lock().unwrap().entries.insert(key, value);
    }

    /// Number of writes that changed the contents.
    pub fn mutations(&self) -> usize {
        self.inner.lock().unwrap().mutations
    }

    /// Let `n` more write calls through, then fail every write until cleared.
    pub fn fail_after(&self, n: Option<usize>) {
        self.inner.lock().unwrap().fail_after = n;
    }

    fn check_fail(inner: &mut Inner<K, V>) -> Result<()> {
        match inner.fail_after {
            Some(0) => Err(Error::Other("injected failure".into())),
            Some(n) => {
                inner.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl<K, V> BpfMap for TestMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    type Key = K;
    type Value = V;

    fn update(&mut self, key: K, value: V) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner)?;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= inner.capacity {
            return Err(Error::MapFull);
        }
        if inner.entries.get(&key) != Some(&value) {
            inner.mutations += 1;
        }
        inner.entries.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&mut inner)?;
        if inner.entries.remove(key).is_some() {
            inner.mutations += 1;
        }
        Ok(())
    }

    fn get(&self, key: &K) -> Result<V> {
        self.get_entry(key)
            .ok_or_else(|| Error::Other("not found".into()))
    }

    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.entries())
    }
}

pub(crate) type TestLbMaps = BpfLbMaps<
    TestMap<ServiceKeyV4, ServiceValue>,
    TestMap<ServiceKeyV6, ServiceValue>,
    TestMap<BackendKey, BackendValueV4>,
    TestMap<BackendKey, BackendValueV6>,
    TestMap<RevNatKey, RevNatValueV4>,
    TestMap<RevNatKey, RevNatValueV6>,
    TestMap<AffinityMatchKey, AffinityMatchValue>,
>;

/// Handles onto the tables owned by a `TestLbMaps`.
#[derive(Clone)]
pub(crate) struct TestTables {
    pub services_v4: TestMap<ServiceKeyV4, ServiceValue>,
    pub services_v6: TestMap<ServiceKeyV6, ServiceValue>,
    pub backends_v4: TestMap<BackendKey, BackendValueV4>,
    pub backends_v6: TestMap<BackendKey, BackendValueV6>,
    pub rev_nat_v4: TestMap<RevNatKey, RevNatValueV4>,
    pub rev_nat_v6: TestMap<RevNatKey, RevNatValueV6>,
    pub affinity: TestMap<AffinityMatchKey, AffinityMatchValue>,
}

impl TestTables {
    pub fn new(capacity: usize) -> Self {
        Self {
            services_v4: TestMap::new(capacity),
            services_v6: TestMap::new(capacity),
            backends_v4: TestMap::new(capacity),
            backends_v6: TestMap::new(capacity),
            rev_nat_v4: TestMap::new(capacity),
            rev_nat_v6: TestMap::new(capacity),
            affinity: TestMap::new(capacity),
        }
    }

    pub fn lb_maps(&self) -> TestLbMaps {
        BpfLbMaps::try_new(
            self.services_v4.clone(),
            self.services_v6.clone(),
            self.backends_v4.clone(),
            self.backends_v6.clone(),
            self.rev_nat_v4.clone(),
            self.rev_nat_v6.clone(),
            self.affinity.clone(),
        )
        .unwrap()
    }

    pub fn mutations(&self) -> usize {
        self.services_v4.mutations()
            + self.services_v6.mutations()
            + self.backends_v4.mutations()
            + self.backends_v6.mutations()
            + self.rev_nat_v4.mutations()
            + self.rev_nat_v6.mutations()
            + self.affinity.mutations()
    }

    pub fn fail_after(&self, n: Option<usize>) {
        self.services_v4.fail_after(n);
        self.services_v6.fail_after(n);
        self.backends_v4.fail_after(n);
        self.backends_v6.fail_after(n);
        self.rev_nat_v4.fail_after(n);
        self.rev_nat_v6.fail_after(n);
        self.affinity.fail_after(n);
    }
}
