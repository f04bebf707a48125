use mesh_lb_ebpf_common::BackendId;

use crate::loadbalancer::{L3n4Addr, Revision};

pub type BackendSet = ahash::HashSet<L3n4Addr>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackendRecord {
    pub addr: L3n4Addr,
    pub id: BackendId,
    /// Revision of the last backend row written.
    pub revision: Revision,
    /// Number of tracked frontends whose committed set contains the backend.
    pub ref_count: usize,
}

impl BackendRecord {
    fn new(addr: L3n4Addr) -> Self {
        Self {
            addr,
            id: 0,
            revision: 0,
            ref_count: 0,
        }
    }
}

/// Backend records and the committed backend set of every frontend.
///
/// Reference counts are derived from the committed sets, which only change
/// in [`BackendRegistry::update_references`] once all datapath writes for the
/// new set have gone through. The one exception is [`BackendRegistry::forget`]
/// for an orphan whose row is already gone.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    records: ahash::HashMap<L3n4Addr, BackendRecord>,
    references: ahash::HashMap<L3n4Addr, BackendSet>,
}

impl BackendRegistry {
    pub fn update_references(&mut self, frontend: L3n4Addr, backends: BackendSet) {
        let mut entering = backends.clone();
        if let Some(old) = self.references.get(&frontend) {
            for addr in old {
                if entering.remove(addr) {
                    continue;
                }
                if let Some(record) = self.records.get_mut(addr) {
                    record.ref_count = record.ref_count.saturating_sub(1);
                }
            }
        }
        for addr in entering {
            self.records
                .entry(addr)
                .or_insert_with(|| BackendRecord::new(addr))
                .ref_count += 1;
        }
        self.references.insert(frontend, backends);
    }

    /// Drops the committed set of `frontend`, releasing its references.
    pub fn remove_frontend(&mut self, frontend: &L3n4Addr) {
        self.update_references(*frontend, BackendSet::default());
        self.references.remove(frontend);
    }

    /// Backends of the committed set of `frontend` that are not part of
    /// `backends` and are referenced by no other frontend.
    pub fn orphans(&self, frontend: &L3n4Addr, backends: &BackendSet) -> Vec<BackendRecord> {
        let Some(old) = self.references.get(frontend) else {
            return vec![];
        };
        let mut orphans: Vec<BackendRecord> = old
            .iter()
            .filter(|addr| !backends.contains(*addr))
            .filter_map(|addr| self.records.get(addr))
            .filter(|record| record.ref_count <= 1)
            .copied()
            .collect();
        orphans.sort_by_key(|record| record.addr);
        orphans
    }

    /// Removes `addr` from the committed set of `frontend` without touching
    /// its record. Used once an orphan has been deleted ahead of the commit,
    /// so a later commit re-adding the address counts it as entering.
    pub fn forget(&mut self, frontend: &L3n4Addr, addr: &L3n4Addr) {
        if let Some(set) = self.references.get_mut(frontend) {
            set.remove(addr);
        }
    }

    pub fn needs_update(&self, addr: &L3n4Addr, revision: Revision) -> bool {
        match self.records.get(addr) {
            Some(record) => record.id == 0 || revision > record.revision,
            None => true,
        }
    }

    pub fn update_revision(&mut self, addr: L3n4Addr, id: BackendId, revision: Revision) {
        let record = self
            .records
            .entry(addr)
            .or_insert_with(|| BackendRecord::new(addr));
        record.id = id;
        record.revision = revision;
    }

    pub fn release(&mut self, addr: &L3n4Addr) -> Option<BackendRecord> {
        self.records.remove(addr)
    }

    pub fn record(&self, addr: &L3n4Addr) -> Option<&BackendRecord> {
        self.records.get(addr)
    }

    pub fn records(&self) -> impl Iterator<Item = &BackendRecord> {
        self.records.values()
    }

    /// Records no committed set refers to. These are left behind when an
    /// update wrote a backend row and then failed before committing.
    pub fn unreferenced(&self) -> Vec<BackendRecord> {
        self.records
            .values()
            .filter(|record| record.ref_count == 0)
            .copied()
            .collect()
    }

    pub fn references(&self, frontend: &L3n4Addr) -> Option<&BackendSet> {
        self.references.get(frontend)
    }

    pub fn has_frontend(&self, frontend: &L3n4Addr) -> bool {
        self.references.contains_key(frontend)
    }

    pub fn frontends(&self) -> impl Iterator<Item = &L3n4Addr> {
        self.references.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
