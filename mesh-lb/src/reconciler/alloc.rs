use crate::loadbalancer::L3n4Addr;
use crate::{Error, Result};

pub const FIRST_SERVICE_ID: u32 = 1;
pub const MAX_SERVICE_ID: u32 = 0xFFFF;
pub const FIRST_BACKEND_ID: u32 = 1;
pub const MAX_BACKEND_ID: u32 = 0xFFFF_FFFF;

/// Hands out ids from `init_next_id..=max_id` keyed by the canonical address
/// string. Ids are searched round robin from a cursor so that a released id is
/// not handed out again right away.
#[derive(Debug)]
pub struct IdAllocator {
    kind: &'static str,
    by_id: ahash::HashMap<u32, L3n4Addr>,
    by_addr: ahash::HashMap<String, u32>,
    next_id: u32,
    init_next_id: u32,
    max_id: u32,
}

impl IdAllocator {
    pub fn new(kind: &'static str, init_next_id: u32, max_id: u32) -> Self {
        Self {
            kind,
            by_id: ahash::HashMap::default(),
            by_addr: ahash::HashMap::default(),
            next_id: init_next_id,
            init_next_id,
            max_id,
        }
    }

    pub fn service() -> Self {
        Self::new("service", FIRST_SERVICE_ID, MAX_SERVICE_ID)
    }

    pub fn backend() -> Self {
        Self::new("backend", FIRST_BACKEND_ID, MAX_BACKEND_ID)
    }

    /// Returns the id held by `addr`, claiming `desired` (when non zero) or
    /// the next free id otherwise.
    pub fn acquire(&mut self, addr: &L3n4Addr, desired: u32) -> Result<u32> {
        let key = addr.string_id();
        if let Some(id) = self.by_addr.get(&key) {
            return Ok(*id);
        }

        if desired != 0 {
            if desired < self.init_next_id || desired > self.max_id {
                return Err(Error::IdOutOfRange {
                    kind: self.kind,
                    id: desired,
                    min: self.init_next_id,
                    max: self.max_id,
                });
            }
            if let Some(owner) = self.by_id.get(&desired) {
                return Err(Error::IdAlreadyRegistered {
                    kind: self.kind,
                    id: desired,
                    addr: owner.to_string(),
                });
            }
            // The scan below moves the cursor past it on the next allocation.
            if desired >= self.next_id {
                self.next_id = desired;
            }
            self.insert(*addr, key, desired);
            return Ok(desired);
        }

        let span = u64::from(self.max_id - self.init_next_id) + 1;
        for _ in 0..span {
            if self.next_id < self.init_next_id || self.next_id > self.max_id {
                self.next_id = self.init_next_id;
            }
            let candidate = self.next_id;
            self.next_id = candidate.checked_add(1).unwrap_or(self.init_next_id);
            if !self.by_id.contains_key(&candidate) {
                self.insert(*addr, key, candidate);
                return Ok(candidate);
            }
        }

        Err(Error::NoIdAvailable { kind: self.kind })
    }

    pub fn release(&mut self, id: u32) {
        if let Some(addr) = self.by_id.remove(&id) {
            self.by_addr.remove(&addr.string_id());
        }
    }

    pub fn lookup(&self, addr: &L3n4Addr) -> Result<u32> {
        self.by_addr
            .get(&addr.string_id())
            .copied()
            .ok_or_else(|| Error::IdNotFound {
                kind: self.kind,
                addr: addr.to_string(),
            })
    }

    /// Records an id found in the datapath tables at startup. Any previous
    /// holder of either the id or the address is dropped.
    pub fn adopt(&mut self, addr: L3n4Addr, id: u32) {
        let key = addr.string_id();
        if let Some(previous) = self.by_addr.get(&key).copied()
            && previous != id
        {
            self.by_id.remove(&previous);
        }
        if let Some(owner) = self.by_id.get(&id)
            && *owner != addr
        {
            self.by_addr.remove(&owner.string_id());
        }
        self.insert(addr, key, id);
    }

    pub fn address_of(&self, id: u32) -> Option<L3n4Addr> {
        self.by_id.get(&id).copied()
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, &L3n4Addr)> {
        self.by_id.iter().map(|(id, addr)| (*id, addr))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn insert(&mut self, addr: L3n4Addr, key: String, id: u32) {
        self.by_id.insert(id, addr);
        self.by_addr.insert(key, id);
    }
}
