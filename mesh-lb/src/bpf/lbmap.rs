//! The load-balancing tables: services (slots per frontend), backends,
//! reverse NAT and session affinity matches, each split per address family
//! where the layout differs.

use std::hash::Hash;
use std::path::Path;

use aya::Pod;
use aya::maps::{HashMap, Map, MapData};
use mesh_lb_ebpf_common::service::{
    AffinityMatchKey, AffinityMatchValue, BackendKey, BackendValue, BackendValueV4,
    BackendValueV6, RevNatKey, RevNatValue, RevNatValueV4, RevNatValueV6, ServiceKey,
    ServiceKeyV4, ServiceKeyV6, ServiceValue,
};
use mesh_lb_ebpf_common::{IpFamily, PROTO_ANY};
use tracing::info;

use crate::bpf::{BpfMap, BpfState};
use crate::loadbalancer::{AddrCluster, Backend, L3n4Addr, L4Protocol, Scope};
use crate::{Error, Result};

pub const BPF_MAP_SERVICES_V4: &str = "mesh_lb_services_v4";
pub const BPF_MAP_SERVICES_V6: &str = "mesh_lb_services_v6";
pub const BPF_MAP_BACKENDS_V4: &str = "mesh_lb_backends_v4";
pub const BPF_MAP_BACKENDS_V6: &str = "mesh_lb_backends_v6";
pub const BPF_MAP_REV_NAT_V4: &str = "mesh_lb_rev_nat_v4";
pub const BPF_MAP_REV_NAT_V6: &str = "mesh_lb_rev_nat_v6";
pub const BPF_MAP_AFFINITY_MATCH: &str = "mesh_lb_affinity_match";

/// Operations the reconciler needs from the datapath tables.
pub trait LbMaps {
    fn update_service(&mut self, key: ServiceKey, value: ServiceValue) -> Result<()>;
    fn delete_service(&mut self, key: &ServiceKey) -> Result<()>;
    fn update_backend(&mut self, key: BackendKey, value: BackendValue) -> Result<()>;
    fn delete_backend(&mut self, family: IpFamily, key: &BackendKey) -> Result<()>;
    fn update_rev_nat(&mut self, key: RevNatKey, value: RevNatValue) -> Result<()>;
    fn delete_rev_nat(&mut self, family: IpFamily, key: &RevNatKey) -> Result<()>;
    fn update_affinity_match(&mut self, key: AffinityMatchKey) -> Result<()>;
    fn delete_affinity_match(&mut self, key: &AffinityMatchKey) -> Result<()>;
    fn dump_service(&self, cb: &mut dyn FnMut(ServiceKey, ServiceValue)) -> Result<()>;
    fn dump_backend(&self, cb: &mut dyn FnMut(BackendKey, BackendValue)) -> Result<()>;
    fn dump_rev_nat(&self, cb: &mut dyn FnMut(RevNatKey, RevNatValue)) -> Result<()>;
}

pub struct BpfLbMaps<S4, S6, B4, B6, R4, R6, A>
where
    S4: BpfMap<Key = ServiceKeyV4, Value = ServiceValue>,
    S6: BpfMap<Key = ServiceKeyV6, Value = ServiceValue>,
    B4: BpfMap<Key = BackendKey, Value = BackendValueV4>,
    B6: BpfMap<Key = BackendKey, Value = BackendValueV6>,
    R4: BpfMap<Key = RevNatKey, Value = RevNatValueV4>,
    R6: BpfMap<Key = RevNatKey, Value = RevNatValueV6>,
    A: BpfMap<Key = AffinityMatchKey, Value = AffinityMatchValue>,
{
    services_v4: BpfState<S4>,
    services_v6: BpfState<S6>,
    backends_v4: BpfState<B4>,
    backends_v6: BpfState<B6>,
    rev_nat_v4: BpfState<R4>,
    rev_nat_v6: BpfState<R6>,
    affinity_match: BpfState<A>,
}

impl<S4, S6, B4, B6, R4, R6, A> BpfLbMaps<S4, S6, B4, B6, R4, R6, A>
where
    S4: BpfMap<Key = ServiceKeyV4, Value = ServiceValue>,
    S6: BpfMap<Key = ServiceKeyV6, Value = ServiceValue>,
    B4: BpfMap<Key = BackendKey, Value = BackendValueV4>,
    B6: BpfMap<Key = BackendKey, Value = BackendValueV6>,
    R4: BpfMap<Key = RevNatKey, Value = RevNatValueV4>,
    R6: BpfMap<Key = RevNatKey, Value = RevNatValueV6>,
    A: BpfMap<Key = AffinityMatchKey, Value = AffinityMatchValue>,
{
    pub fn try_new(
        services_v4: S4,
        services_v6: S6,
        backends_v4: B4,
        backends_v6: B6,
        rev_nat_v4: R4,
        rev_nat_v6: R6,
        affinity_match: A,
    ) -> Result<Self> {
        Ok(Self {
            services_v4: BpfState::try_new(services_v4)?,
            services_v6: BpfState::try_new(services_v6)?,
            backends_v4: BpfState::try_new(backends_v4)?,
            backends_v6: BpfState::try_new(backends_v6)?,
            rev_nat_v4: BpfState::try_new(rev_nat_v4)?,
            rev_nat_v6: BpfState::try_new(rev_nat_v6)?,
            affinity_match: BpfState::try_new(affinity_match)?,
        })
    }
}

impl<S4, S6, B4, B6, R4, R6, A> LbMaps for BpfLbMaps<S4, S6, B4, B6, R4, R6, A>
where
    S4: BpfMap<Key = ServiceKeyV4, Value = ServiceValue>,
    S6: BpfMap<Key = ServiceKeyV6, Value = ServiceValue>,
    B4: BpfMap<Key = BackendKey, Value = BackendValueV4>,
    B6: BpfMap<Key = BackendKey, Value = BackendValueV6>,
    R4: BpfMap<Key = RevNatKey, Value = RevNatValueV4>,
    R6: BpfMap<Key = RevNatKey, Value = RevNatValueV6>,
    A: BpfMap<Key = AffinityMatchKey, Value = AffinityMatchValue>,
{
    fn update_service(&mut self, key: ServiceKey, value: ServiceValue) -> Result<()> {
        match key {
            ServiceKey::V4(key) => self.services_v4.update(key, value),
            ServiceKey::V6(key) => self.services_v6.update(key, value),
        }
    }

    fn delete_service(&mut self, key: &ServiceKey) -> Result<()> {
        match key {
            ServiceKey::V4(key) => self.services_v4.delete(key),
            ServiceKey::V6(key) => self.services_v6.delete(key),
        }
    }

    fn update_backend(&mut self, key: BackendKey, value: BackendValue) -> Result<()> {
        match value {
            BackendValue::V4(value) => self.backends_v4.update(key, value),
            BackendValue::V6(value) => self.backends_v6.update(key, value),
        }
    }

    fn delete_backend(&mut self, family: IpFamily, key: &BackendKey) -> Result<()> {
        match family {
            IpFamily::V4 => self.backends_v4.delete(key),
            IpFamily::V6 => self.backends_v6.delete(key),
        }
    }

    fn update_rev_nat(&mut self, key: RevNatKey, value: RevNatValue) -> Result<()> {
        match value {
            RevNatValue::V4(value) => self.rev_nat_v4.update(key, value),
            RevNatValue::V6(value) => self.rev_nat_v6.update(key, value),
        }
    }

    fn delete_rev_nat(&mut self, family: IpFamily, key: &RevNatKey) -> Result<()> {
        match family {
            IpFamily::V4 => self.rev_nat_v4.delete(key),
            IpFamily::V6 => self.rev_nat_v6.delete(key),
        }
    }

    fn update_affinity_match(&mut self, key: AffinityMatchKey) -> Result<()> {
        self.affinity_match
            .update(key, AffinityMatchValue::default())
    }

    fn delete_affinity_match(&mut self, key: &AffinityMatchKey) -> Result<()> {
        self.affinity_match.delete(key)
    }

    fn dump_service(&self, cb: &mut dyn FnMut(ServiceKey, ServiceValue)) -> Result<()> {
        for (k, v) in self.services_v4.get_state()? {
            cb(ServiceKey::V4(k), v);
        }
        for (k, v) in self.services_v6.get_state()? {
            cb(ServiceKey::V6(k), v);
        }
        Ok(())
    }

    fn dump_backend(&self, cb: &mut dyn FnMut(BackendKey, BackendValue)) -> Result<()> {
        for (k, v) in self.backends_v4.get_state()? {
            cb(k, BackendValue::V4(v));
        }
        for (k, v) in self.backends_v6.get_state()? {
            cb(k, BackendValue::V6(v));
        }
        Ok(())
    }

    fn dump_rev_nat(&self, cb: &mut dyn FnMut(RevNatKey, RevNatValue)) -> Result<()> {
        for (k, v) in self.rev_nat_v4.get_state()? {
            cb(k, RevNatValue::V4(v));
        }
        for (k, v) in self.rev_nat_v6.get_state()? {
            cb(k, RevNatValue::V6(v));
        }
        Ok(())
    }
}

pub type PinnedLbMaps = BpfLbMaps<
    HashMap<MapData, ServiceKeyV4, ServiceValue>,
    HashMap<MapData, ServiceKeyV6, ServiceValue>,
    HashMap<MapData, BackendKey, BackendValueV4>,
    HashMap<MapData, BackendKey, BackendValueV6>,
    HashMap<MapData, RevNatKey, RevNatValueV4>,
    HashMap<MapData, RevNatKey, RevNatValueV6>,
    HashMap<MapData, AffinityMatchKey, AffinityMatchValue>,
>;

/// Opens the maps pinned by the datapath under `bpf_fs`.
pub fn load_pinned(bpf_fs: &Path) -> Result<PinnedLbMaps> {
    BpfLbMaps::try_new(
        load_hash_map(bpf_fs, BPF_MAP_SERVICES_V4)?,
        load_hash_map(bpf_fs, BPF_MAP_SERVICES_V6)?,
        load_hash_map(bpf_fs, BPF_MAP_BACKENDS_V4)?,
        load_hash_map(bpf_fs, BPF_MAP_BACKENDS_V6)?,
        load_hash_map(bpf_fs, BPF_MAP_REV_NAT_V4)?,
        load_hash_map(bpf_fs, BPF_MAP_REV_NAT_V6)?,
        load_hash_map(bpf_fs, BPF_MAP_AFFINITY_MATCH)?,
    )
}

fn load_hash_map<K, V>(bpf_fs: &Path, name: &str) -> Result<HashMap<MapData, K, V>>
where
    K: Pod + Eq + Hash,
    V: Pod,
{
    info!("loading {} map", name);
    let map = MapData::from_pin(bpf_fs.join(name))?;
    let map = Map::HashMap(map);
    Ok(map.try_into()?)
}

pub fn service_key(addr: &L3n4Addr, slot: u16) -> ServiceKey {
    ServiceKey::new(addr.ip(), addr.port, PROTO_ANY, addr.scope as u8, slot)
}

// The protocol is not part of the key so the address read back always claims
// TCP.
pub fn addr_from_service_key(key: &ServiceKey) -> L3n4Addr {
    L3n4Addr::new(
        AddrCluster::new(key.ip(), 0),
        L4Protocol::Tcp,
        key.port(),
        Scope::from(key.scope()),
    )
}

pub fn backend_value(be: &Backend) -> Result<BackendValue> {
    let cluster_id = u16::try_from(be.addr.addr_cluster.cluster_id).map_err(|e| {
        Error::ConversionError(format!(
            "cluster id of backend {} does not fit the backend map: {e}",
            be.addr
        ))
    })?;
    Ok(BackendValue::new(
        be.addr.ip(),
        be.addr.port,
        PROTO_ANY,
        be.state as u8,
        cluster_id,
        be.zone_id,
    ))
}

pub fn addr_from_backend_value(value: &BackendValue) -> L3n4Addr {
    L3n4Addr::new(
        AddrCluster::new(value.ip(), u32::from(value.cluster_id())),
        L4Protocol::Tcp,
        value.port(),
        Scope::External,
    )
}

pub fn rev_nat_value(addr: &L3n4Addr) -> RevNatValue {
    RevNatValue::new(addr.ip(), addr.port)
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::*;
    use crate::bpf::testing::TestTables;
    use crate::loadbalancer::BackendState;

    #[test]
    fn test_service_key_round_trips_address() {
        let addr = L3n4Addr::new(
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)).into(),
            L4Protocol::Tcp,
            443,
            Scope::Internal,
        );
        let key = service_key(&addr, 3);
        assert_eq!(key.family(), IpFamily::V6);
        assert_eq!(key.backend_slot(), 3);
        assert_eq!(addr_from_service_key(&key), addr);
        let ServiceKey::V6(raw) = key else {
            panic!("expected v6 key");
        };
        assert_eq!(raw.dport.to_ne_bytes(), 443u16.to_be_bytes());
    }

    #[test]
    fn test_backend_value_carries_state_and_cluster() {
        let be = Backend {
            addr: L3n4Addr::new(
                AddrCluster::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 4),
                L4Protocol::Tcp,
                8080,
                Scope::External,
            ),
            state: BackendState::Quarantined,
            zone_id: 2,
            revision: 1,
        };
        let value = backend_value(&be).unwrap();
        assert_eq!(value.flags(), BackendState::Quarantined as u8);
        assert_eq!(addr_from_backend_value(&value), be.addr);
    }

    #[test]
    fn test_cluster_id_too_large() {
        let be = Backend {
            addr: L3n4Addr::new(
                AddrCluster::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 70_000),
                L4Protocol::Tcp,
                8080,
                Scope::External,
            ),
            state: BackendState::Active,
            zone_id: 0,
            revision: 1,
        };
        assert!(matches!(backend_value(&be), Err(Error::ConversionError(_))));
    }

    #[test]
    fn test_unchanged_update_is_not_written() {
        let tables = TestTables::new(16);
        let mut maps = tables.lb_maps();
        let addr = L3n4Addr::new(
            IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)).into(),
            L4Protocol::Tcp,
            80,
            Scope::External,
        );
        let value = ServiceValue {
            count: 1,
            rev_nat_index: 1,
            ..Default::default()
        };
        maps.update_service(service_key(&addr, 0), value).unwrap();
        maps.update_service(service_key(&addr, 0), value).unwrap();
        assert_eq!(tables.services_v4.mutations(), 1);

        maps.delete_service(&service_key(&addr, 0)).unwrap();
        maps.delete_service(&service_key(&addr, 0)).unwrap();
        assert_eq!(tables.services_v4.len(), 0);
    }

    #[test]
    fn test_full_map_is_surfaced() {
        let tables = TestTables::new(1);
        let mut maps = tables.lb_maps();
        let addr = |port| {
            L3n4Addr::new(
                IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)).into(),
                L4Protocol::Tcp,
                port,
                Scope::External,
            )
        };
        maps.update_service(service_key(&addr(80), 0), ServiceValue::default())
            .unwrap();
        let err = maps
            .update_service(service_key(&addr(81), 0), ServiceValue::default())
            .unwrap_err();
        assert!(matches!(err, Error::MapFull));
        assert!(!err.is_retryable());
    }
}
