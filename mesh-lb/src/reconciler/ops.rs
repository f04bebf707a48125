use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use mesh_lb_ebpf_common::service::{
    AffinityMatchKey, BackendKey, RevNatKey, ServiceKey, ServiceValue,
};
use mesh_lb_ebpf_common::{BackendId, ServiceId};
use tracing::{debug, info, warn};

use crate::bpf::lbmap::{
    LbMaps, addr_from_backend_value, addr_from_service_key, backend_value, rev_nat_value,
    service_key,
};
use crate::loadbalancer::{
    Backend, Frontend, L3n4Addr, ServiceType, SvcFlagParam, SvcFlags, TrafficPolicy,
};
use crate::reconciler::Operations;
use crate::reconciler::alloc::IdAllocator;
use crate::reconciler::registry::{BackendRecord, BackendRegistry, BackendSet};
use crate::{Error, PruneErrors, Result, StepContext};


#[derive(Clone, Copy, Debug, Default)]
pub struct OpsConfig {
    /// Maintain the session affinity match table.
    pub enable_session_affinity: bool,
    /// Treat ClusterIP frontends as reachable from outside the cluster.
    pub external_cluster_ip: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub frontends: usize,
    pub backends: usize,
    pub service_ids: usize,
    pub backend_ids: usize,
}

struct Shared<M: LbMaps> {
    state: Mutex<State<M>>,
}

struct State<M: LbMaps> {
    maps: M,
    config: OpsConfig,
    service_ids: IdAllocator,
    backend_ids: IdAllocator,
    restored_service_ids: ahash::HashSet<u32>,
    restored_backend_ids: ahash::HashSet<u32>,
    /// Highest slot that may still hold a row, per frontend, keyed by the
    /// slot 0 key. Seeded from the tables at startup and raised as soon as a
    /// slot is written.
    slots: ahash::HashMap<ServiceKey, u16>,
    /// Frontend whose rows a slot 0 key belongs to. Keys carry neither
    /// protocol nor cluster, so frontends differing only in those would
    /// share rows.
    owners: ahash::HashMap<ServiceKey, L3n4Addr>,
    registry: BackendRegistry,
    /// Node addresses each expanded frontend was last written for.
    node_port_addrs: ahash::HashMap<L3n4Addr, Vec<IpAddr>>,
}

/// Reconciles frontends into the load-balancing tables.
///
/// All bookkeeping lives behind a single lock which is held for the whole of
/// an update, delete or prune including the table writes, so the pruner only
/// ever observes committed membership.
pub struct BpfOps<M: LbMaps> {
    shared: Arc<Shared<M>>,
}

impl<M: LbMaps> Clone for BpfOps<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: LbMaps> BpfOps<M> {
    /// Takes over the tables, adopting the service and backend ids already
    /// present so that a restart does not renumber anything.
    pub fn restore(maps: M, config: OpsConfig) -> Result<Self> {
        let mut state = State {
            maps,
            config,
            service_ids: IdAllocator::service(),
            backend_ids: IdAllocator::backend(),
            restored_service_ids: ahash::HashSet::default(),
            restored_backend_ids: ahash::HashSet::default(),
            slots: ahash::HashMap::default(),
            owners: ahash::HashMap::default(),
            registry: BackendRegistry::default(),
            node_port_addrs: ahash::HashMap::default(),
        };
        state.restore()?;

        let shared = Shared {
            state: Mutex::new(state),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn update(&self, fe: &Frontend) -> Result<()> {
        let mut state = self.lock()?;
        if let Err(e) = state.update_frontend(fe) {
            warn!(frontend = %fe.address, error = %e, "updating frontend failed, retrying");
            return Err(e);
        }
        if fe.expands_per_node() {
            state.update_node_frontends(fe)?;
        }
        Ok(())
    }

    pub fn delete(&self, fe: &Frontend) -> Result<()> {
        let mut state = self.lock()?;
        if let Err(e) = state.delete_frontend(fe) {
            warn!(frontend = %fe.address, error = %e, "deleting frontend failed, retrying");
            return Err(e);
        }
        if fe.expands_per_node() {
            state.delete_node_frontends(fe)?;
        }
        Ok(())
    }

    /// Removes table rows and ids that no tracked frontend accounts for. All
    /// sweeps run even when an earlier one fails.
    pub fn prune(&self) -> Result<()> {
        let mut state = self.lock()?;
        let errors: Vec<Error> = [
            state.prune_restored_ids(),
            state.prune_service_maps(),
            state.prune_backend_maps(),
            state.prune_rev_nat(),
        ]
        .into_iter()
        .filter_map(|r| r.err())
        .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Prune(PruneErrors(errors)))
        }
    }

    pub fn stats(&self) -> Result<Stats> {
        let state = self.lock()?;
        Ok(Stats {
            frontends: state.registry.frontends().count(),
            backends: state.registry.len(),
            service_ids: state.service_ids.len(),
            backend_ids: state.backend_ids.len(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, State<M>>> {
        self.shared.state.lock().map_err(|_| Error::LockPoisoned)
    }
}

impl<M: LbMaps> Operations<Frontend> for BpfOps<M> {
    fn update(&self, obj: &Frontend) -> Result<()> {
        BpfOps::update(self, obj)
    }

    fn delete(&self, obj: &Frontend) -> Result<()> {
        BpfOps::delete(self, obj)
    }

    fn prune(&self, live: &mut dyn Iterator<Item = &Frontend>) -> Result<()> {
        debug!(live = live.count(), "pruning load-balancing tables");
        BpfOps::prune(self)
    }
}

impl<M: LbMaps> State<M> {
    fn restore(&mut self) -> Result<()> {
        let mut services = vec![];
        self.maps
            .dump_service(&mut |key, value| services.push((key, value)))
            .step("restore service ids")?;
        for (key, value) in services {
            let master = key.with_backend_slot(0);
            let slots = self.slots.entry(master).or_default();
            *slots = (*slots).max(key.backend_slot());
            if value.rev_nat_index != 0 {
                let id = u32::from(value.rev_nat_index);
                self.service_ids.adopt(addr_from_service_key(&key), id);
                self.restored_service_ids.insert(id);
            }
        }

        let mut backends = vec![];
        self.maps
            .dump_backend(&mut |key, value| backends.push((key, value)))
            .step("restore backend ids")?;
        for (key, value) in backends {
            self.backend_ids.adopt(addr_from_backend_value(&value), key.id);
            self.restored_backend_ids.insert(key.id);
        }

        info!(
            services = self.restored_service_ids.len(),
            backends = self.restored_backend_ids.len(),
            "restored ids from load-balancing tables"
        );
        Ok(())
    }

    // Every step below has to be safe to redo. Bookkeeping that later steps
    // rely on is only changed after the writes depending on it succeeded.
    fn update_frontend(&mut self, fe: &Frontend) -> Result<()> {
        let master_key = service_key(&fe.address, 0);
        if let Some(owner) = self.owners.get(&master_key)
            && *owner != fe.address
        {
            return Err(Error::FrontendConflict {
                frontend: fe.address.to_string(),
                owner: owner.to_string(),
            });
        }

        let fe_id = self
            .service_ids
            .acquire(&fe.address, 0)
            .step("allocate service id")?;
        let rev_nat_index = to_service_id(fe_id, &fe.address)?;

        let svc = &fe.service;
        let is_routable = !fe.address.is_unspecified()
            && (fe.service_type != ServiceType::ClusterIp || self.config.external_cluster_ip);
        let flags = SvcFlags::new(&SvcFlagParam {
            svc_type: fe.service_type,
            ext_local: svc.ext_traffic_policy == TrafficPolicy::Local,
            int_local: svc.int_traffic_policy == TrafficPolicy::Local,
            nat_policy: svc.nat_policy,
            session_affinity: svc.session_affinity,
            is_routable,
            l7_load_balancer: svc.l7_proxy_port != 0,
            loopback_host_port: svc.loopback_host_port,
        });
        let mut value = ServiceValue {
            rev_nat_index,
            ..Default::default()
        };
        value.set_flags(flags.bits());

        let backends = sorted_backends(&fe.backends);
        let backend_addrs: BackendSet = backends.iter().map(|be| be.addr).collect();

        for orphan in self.registry.orphans(&fe.address, &backend_addrs) {
            info!(frontend = %fe.address, backend = %orphan.addr, id = orphan.id, "deleting orphan backend");
            self.maps
                .delete_backend(orphan.addr.family(), &BackendKey { id: orphan.id })
                .step("delete backend")?;
            self.delete_affinity_match(rev_nat_index, orphan.id)
                .step("delete affinity match")?;
            self.release_backend(&fe.address, &orphan);
        }

        for (i, be) in backends.iter().enumerate() {
            let be_id = match self.registry.record(&be.addr) {
                Some(record) if record.id != 0 => record.id,
                _ => self
                    .backend_ids
                    .acquire(&be.addr, 0)
                    .step("allocate backend id")?,
            };

            if self.registry.needs_update(&be.addr, be.revision) {
                debug!(backend = %be.addr, id = be_id, revision = be.revision, "updating backend");
                let be_value = backend_value(be).step("upsert backend")?;
                self.maps
                    .update_backend(BackendKey { id: be_id }, be_value)
                    .step("upsert backend")?;
                self.registry.update_revision(be.addr, be_id, be.revision);
            }

            // Active backends sort first so their slots are 1..=active.
            if be.is_active() {
                let slot = to_slot(i + 1)?;
                let slot_value = ServiceValue {
                    backend_id: be_id,
                    ..value
                };
                self.maps
                    .update_service(service_key(&fe.address, slot), slot_value)
                    .step("upsert service slot")?;
                let highest = self.slots.entry(master_key).or_default();
                *highest = (*highest).max(slot);
            }

            if svc.session_affinity && be.is_active() {
                self.upsert_affinity_match(rev_nat_index, be_id)
                    .step("upsert affinity match")?;
            } else {
                self.delete_affinity_match(rev_nat_index, be_id)
                    .step("delete affinity match")?;
            }
        }

        let num_previous = self.previous_slots(&fe.address);

        self.upsert_rev_nat(rev_nat_index, &fe.address)
            .step("upsert reverse nat")?;

        let num_active = backends.iter().take_while(|be| be.is_active()).count();
        self.upsert_master(fe, value, num_active)
            .step("upsert service master")?;

        self.cleanup_slots(&fe.address, num_previous, num_active)
            .step("cleanup service slots")?;

        debug!(frontend = %fe.address, id = fe_id, active = num_active, previous = num_previous, "frontend updated");
        self.registry.update_references(fe.address, backend_addrs);
        self.slots.insert(master_key, to_slot(num_active)?);
        self.owners.insert(master_key, fe.address);
        Ok(())
    }

    fn delete_frontend(&mut self, fe: &Frontend) -> Result<()> {
        // Never reconciled, or already deleted.
        let Ok(fe_id) = self.service_ids.lookup(&fe.address) else {
            return Ok(());
        };
        let rev_nat_index = to_service_id(fe_id, &fe.address)?;
        let master_key = service_key(&fe.address, 0);
        if let Some(owner) = self.owners.get(&master_key)
            && *owner != fe.address
        {
            // The rows belong to another frontend, only the id is ours.
            debug!(frontend = %fe.address, %owner, "frontend never owned its rows");
            self.service_ids.release(fe_id);
            return Ok(());
        }
        info!(frontend = %fe.address, id = fe_id, "deleting frontend");

        // Affinity may have been switched off since the rows were written so
        // they are removed for every referenced backend.
        let referenced: Vec<BackendId> = self
            .registry
            .references(&fe.address)
            .into_iter()
            .flatten()
            .filter_map(|addr| self.registry.record(addr))
            .map(|record| record.id)
            .collect();
        for be_id in referenced {
            self.delete_affinity_match(rev_nat_index, be_id)
                .step("delete affinity match")?;
        }

        for orphan in self.registry.orphans(&fe.address, &BackendSet::default()) {
            info!(frontend = %fe.address, backend = %orphan.addr, id = orphan.id, "deleting orphan backend");
            self.maps
                .delete_backend(orphan.addr.family(), &BackendKey { id: orphan.id })
                .step("delete backend")?;
            self.release_backend(&fe.address, &orphan);
        }

        let num_slots = self.previous_slots(&fe.address);
        for slot in 0..=num_slots {
            let slot = to_slot(slot)?;
            self.maps
                .delete_service(&service_key(&fe.address, slot))
                .step("delete service slot")?;
        }

        self.maps
            .delete_rev_nat(fe.address.family(), &RevNatKey { id: rev_nat_index })
            .step("delete reverse nat")?;

        self.registry.remove_frontend(&fe.address);
        self.slots.remove(&master_key);
        self.owners.remove(&master_key);
        self.service_ids.release(fe_id);
        Ok(())
    }

    /// Writes one copy of `fe` per node address of its family and deletes the
    /// copies of node addresses that went away.
    fn update_node_frontends(&mut self, fe: &Frontend) -> Result<()> {
        let mut stale = self
            .node_port_addrs
            .get(&fe.address)
            .cloned()
            .unwrap_or_default();
        let addrs = node_addrs_of_family(fe);

        for addr in &addrs {
            let mut node_fe = fe.clone();
            node_fe.address = fe.address.with_addr(*addr);
            if let Err(e) = self.update_frontend(&node_fe) {
                warn!(frontend = %node_fe.address, error = %e, "updating frontend failed, retrying");
                return Err(e);
            }
            stale.retain(|a| a != addr);
        }

        for addr in stale {
            let mut node_fe = fe.clone();
            node_fe.address = fe.address.with_addr(addr);
            if let Err(e) = self.delete_frontend(&node_fe) {
                warn!(frontend = %node_fe.address, error = %e, "deleting stale node frontend failed, retrying");
                return Err(e);
            }
        }

        self.node_port_addrs.insert(fe.address, addrs);
        Ok(())
    }

    fn delete_node_frontends(&mut self, fe: &Frontend) -> Result<()> {
        let Some(addrs) = self.node_port_addrs.get(&fe.address).cloned() else {
            debug!(frontend = %fe.address, "no node addresses recorded");
            return Ok(());
        };
        for addr in addrs {
            let mut node_fe = fe.clone();
            node_fe.address = fe.address.with_addr(addr);
            if let Err(e) = self.delete_frontend(&node_fe) {
                warn!(frontend = %node_fe.address, error = %e, "deleting frontend failed, retrying");
                return Err(e);
            }
        }
        self.node_port_addrs.remove(&fe.address);
        Ok(())
    }

    fn previous_slots(&self, frontend: &L3n4Addr) -> usize {
        self.slots
            .get(&service_key(frontend, 0))
            .copied()
            .map(usize::from)
            .unwrap_or_default()
    }

    fn upsert_master(&mut self, fe: &Frontend, value: ServiceValue, active: usize) -> Result<()> {
        let count = u16::try_from(active)
            .map_err(|e| Error::ConversionError(format!("too many backends: {e}")))?;
        let mut master = ServiceValue {
            backend_id: 0,
            count,
            ..value
        };
        // The master slot has no backend so the field carries these instead.
        let svc = &fe.service;
        if svc.session_affinity {
            master.backend_id = u32::try_from(svc.session_affinity_timeout.as_secs())
                .unwrap_or(u32::MAX);
        }
        if svc.l7_proxy_port != 0 {
            master.backend_id = u32::from(svc.l7_proxy_port);
        }
        self.maps
            .update_service(service_key(&fe.address, 0), master)
    }

    fn cleanup_slots(&mut self, frontend: &L3n4Addr, old: usize, new: usize) -> Result<()> {
        for slot in new + 1..=old {
            self.maps
                .delete_service(&service_key(frontend, to_slot(slot)?))?;
        }
        Ok(())
    }

    fn upsert_rev_nat(&mut self, id: ServiceId, frontend: &L3n4Addr) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidRevNatId(frontend.to_string()));
        }
        self.maps
            .update_rev_nat(RevNatKey { id }, rev_nat_value(frontend))
    }

    fn upsert_affinity_match(&mut self, id: ServiceId, be_id: BackendId) -> Result<()> {
        if !self.config.enable_session_affinity {
            return Ok(());
        }
        self.maps
            .update_affinity_match(AffinityMatchKey::new(id, be_id))
    }

    fn delete_affinity_match(&mut self, id: ServiceId, be_id: BackendId) -> Result<()> {
        if !self.config.enable_session_affinity {
            return Ok(());
        }
        self.maps
            .delete_affinity_match(&AffinityMatchKey::new(id, be_id))
    }

    /// Forgets an orphan of `frontend` whose row has been deleted. The address
    /// also leaves the committed set so that the set never holds a backend
    /// whose reference is already gone.
    fn release_backend(&mut self, frontend: &L3n4Addr, record: &BackendRecord) {
        self.registry.forget(frontend, &record.addr);
        self.forget_backend(record);
    }

    fn forget_backend(&mut self, record: &BackendRecord) {
        self.registry.release(&record.addr);
        self.backend_ids.release(record.id);
    }

    fn prune_restored_ids(&mut self) -> Result<()> {
        for id in self.restored_service_ids.drain() {
            if let Some(addr) = self.service_ids.address_of(id)
                && !self.registry.has_frontend(&addr)
            {
                debug!(id, frontend = %addr, "releasing unclaimed restored service id");
                self.service_ids.release(id);
            }
        }
        for id in self.restored_backend_ids.drain() {
            if let Some(addr) = self.backend_ids.address_of(id)
                && self.registry.record(&addr).is_none()
            {
                debug!(id, backend = %addr, "releasing unclaimed restored backend id");
                self.backend_ids.release(id);
            }
        }
        // Rows of untracked frontends are pruned from the service table.
        let owners = &self.owners;
        self.slots.retain(|key, _| owners.contains_key(key));
        Ok(())
    }

    // Keys are compared as written rather than through the addresses they
    // decode to, since the protocol of a frontend does not survive the
    // round trip.
    fn prune_service_maps(&mut self) -> Result<()> {
        let tracked: ahash::HashSet<ServiceKey> = self
            .registry
            .frontends()
            .map(|addr| service_key(addr, 0))
            .collect();

        let mut stale = vec![];
        self.maps
            .dump_service(&mut |key, _| {
                if !tracked.contains(&key.with_backend_slot(0)) {
                    stale.push(key);
                }
            })
            .step("dump services")?;

        let mut errors = vec![];
        for key in stale {
            info!(frontend = %addr_from_service_key(&key), slot = key.backend_slot(), "pruning service slot");
            if let Err(e) = self.maps.delete_service(&key) {
                warn!(error = %e, "failed to delete from service map");
                errors.push(e);
            }
        }
        collect_errors("prune service maps", errors)
    }

    fn prune_backend_maps(&mut self) -> Result<()> {
        let mut errors = vec![];

        for record in self.registry.unreferenced() {
            info!(backend = %record.addr, id = record.id, "releasing unreferenced backend");
            self.forget_backend(&record);
        }
        let orphaned_ids: Vec<u32> = self
            .backend_ids
            .entries()
            .filter(|(_, addr)| self.registry.record(addr).is_none())
            .map(|(id, _)| id)
            .collect();
        for id in orphaned_ids {
            debug!(id, "releasing backend id without record");
            self.backend_ids.release(id);
        }

        let live: ahash::HashMap<BackendId, _> = self
            .registry
            .records()
            .filter(|record| record.id != 0)
            .map(|record| (record.id, record.addr.family()))
            .collect();
        let mut stale = vec![];
        self.maps
            .dump_backend(&mut |key, value| {
                if live.get(&key.id) != Some(&value.family()) {
                    stale.push((key, value));
                }
            })
            .step("dump backends")?;

        for (key, value) in stale {
            info!(id = key.id, backend = %addr_from_backend_value(&value), "pruning backend");
            if let Err(e) = self.maps.delete_backend(value.family(), &key) {
                warn!(error = %e, "failed to delete from backend map");
                errors.push(e);
            }
        }
        collect_errors("prune backend maps", errors)
    }

    fn prune_rev_nat(&mut self) -> Result<()> {
        let mut stale = vec![];
        let service_ids = &self.service_ids;
        self.maps
            .dump_rev_nat(&mut |key, value| {
                if !service_ids.contains_id(u32::from(key.id)) {
                    stale.push((key, value.family()));
                }
            })
            .step("dump reverse nat")?;

        let mut errors = vec![];
        for (key, family) in stale {
            info!(id = key.id, %family, "pruning reverse nat");
            if let Err(e) = self.maps.delete_rev_nat(family, &key) {
                warn!(error = %e, "failed to delete from reverse nat map");
                errors.push(e);
            }
        }
        collect_errors("prune reverse nat", errors)
    }
}

/// Active backends first, then by address and port, then by the remaining
/// address fields. The order decides slot assignment and has to be the same
/// for the same set of backends whatever order they arrive in.
fn sorted_backends(backends: &[Backend]) -> Vec<&Backend> {
    let mut sorted: Vec<&Backend> = backends.iter().collect();
    sorted.sort_by(|a, b| {
        a.state
            .cmp(&b.state)
            .then_with(|| a.addr.ip().cmp(&b.addr.ip()))
            .then_with(|| a.addr.port.cmp(&b.addr.port))
            .then_with(|| a.addr.cmp(&b.addr))
    });
    sorted
}

fn node_addrs_of_family(fe: &Frontend) -> Vec<IpAddr> {
    fe.node_port_addrs
        .iter()
        .filter(|addr| addr.is_ipv6() == fe.address.is_ipv6())
        .copied()
        .collect()
}

fn to_service_id(id: u32, frontend: &L3n4Addr) -> Result<ServiceId> {
    ServiceId::try_from(id).map_err(|e| {
        Error::ConversionError(format!("service id {id} of {frontend} out of range: {e}"))
    })
}

fn to_slot(slot: usize) -> Result<u16> {
    u16::try_from(slot).map_err(|e| Error::ConversionError(format!("slot {slot}: {e}")))
}

fn collect_errors(step: &'static str, mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)).step(step),
        _ => Err(Error::Prune(PruneErrors(errors))).step(step),
    }
}
