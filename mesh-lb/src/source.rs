//! Desired state read from a YAML file.
//!
//! ```yaml
//! nodeAddresses: [192.168.1.10]
//! services:
//!   - name: default/web
//!     sessionAffinityTimeoutSeconds: 10800
//!     extTrafficPolicy: Cluster
//!     frontends:
//!       - { address: 10.96.0.10, port: 80, protocol: TCP, type: ClusterIP }
//!     backends:
//!       - { address: 10.0.0.1, port: 8080, state: Active }
//! ```
//!
//! Every reload is diffed against the previous one and turned into
//! [`Event`]s. Backends keep their revision for as long as their content
//! stays the same, which is what lets the reconciler skip rewriting them.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::loadbalancer::{
    AddrCluster, Backend, BackendState, Frontend, L3n4Addr, L4Protocol, NatPolicy, Revision,
    Scope, Service, ServiceType, TrafficPolicy,
};
use crate::reconciler::runner::Event;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DesiredState {
    #[serde(default)]
    node_addresses: Vec<IpAddr>,
    #[serde(default)]
    services: Vec<ServiceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSpec {
    name: String,
    #[serde(default)]
    session_affinity_timeout_seconds: Option<u64>,
    #[serde(default)]
    ext_traffic_policy: TrafficPolicy,
    #[serde(default)]
    int_traffic_policy: TrafficPolicy,
    #[serde(default)]
    nat_policy: NatPolicy,
    #[serde(default)]
    l7_proxy_port: u16,
    #[serde(default)]
    loopback_host_port: bool,
    #[serde(default)]
    frontends: Vec<FrontendSpec>,
    #[serde(default)]
    backends: Vec<BackendSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontendSpec {
    address: IpAddr,
    port: u16,
    #[serde(default)]
    protocol: L4Protocol,
    #[serde(rename = "type", default)]
    service_type: ServiceType,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendSpec {
    address: IpAddr,
    port: u16,
    #[serde(default)]
    protocol: L4Protocol,
    #[serde(default)]
    state: BackendState,
    #[serde(default)]
    zone: u8,
    #[serde(default)]
    cluster_id: u32,
}

pub struct FileSource {
    path: PathBuf,
    revision: Revision,
    backends: ahash::HashMap<L3n4Addr, Backend>,
    frontends: BTreeMap<L3n4Addr, Frontend>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            revision: 0,
            backends: ahash::HashMap::default(),
            frontends: BTreeMap::new(),
        }
    }

    /// Reads the file and returns the events that take the previously loaded
    /// state to the new one. On error the previous state is kept.
    pub fn reload(&mut self) -> Result<Vec<Event>> {
        let content = std::fs::read_to_string(&self.path)?;
        self.apply(&content)
    }

    pub fn apply(&mut self, content: &str) -> Result<Vec<Event>> {
        let state: DesiredState = if content.trim().is_empty() {
            DesiredState::default()
        } else {
            serde_yaml::from_str(content)?
        };

        let mut backends = ahash::HashMap::default();
        let mut frontends = BTreeMap::new();
        // Table keys carry neither protocol nor cluster, one frontend per ip,
        // port and scope.
        let mut claimed = ahash::HashMap::default();
        for spec in state.services {
            let service = Arc::new(Service {
                name: spec.name.clone(),
                ext_traffic_policy: spec.ext_traffic_policy,
                int_traffic_policy: spec.int_traffic_policy,
                nat_policy: spec.nat_policy,
                session_affinity: spec.session_affinity_timeout_seconds.is_some(),
                session_affinity_timeout: Duration::from_secs(
                    spec.session_affinity_timeout_seconds.unwrap_or_default(),
                ),
                l7_proxy_port: spec.l7_proxy_port,
                loopback_host_port: spec.loopback_host_port,
            });

            let mut service_backends: Vec<Backend> = vec![];
            for be in &spec.backends {
                let backend = self.backend(&mut backends, be);
                if service_backends.iter().any(|b| b.addr == backend.addr) {
                    warn!(service = %spec.name, backend = %backend.addr, "duplicate backend ignored");
                    continue;
                }
                service_backends.push(backend);
            }

            for fe in &spec.frontends {
                let address = L3n4Addr::new(fe.address.into(), fe.protocol, fe.port, fe.scope);
                if frontends.contains_key(&address) {
                    warn!(service = %spec.name, frontend = %address, "frontend already claimed by another service");
                    continue;
                }
                let claim = (address.ip(), address.port, address.scope);
                if let Some(other) = claimed.get(&claim) {
                    warn!(service = %spec.name, frontend = %address, %other, "frontend shares table rows with another");
                    continue;
                }
                claimed.insert(claim, address);
                let mut frontend = Frontend::new(
                    address,
                    fe.service_type,
                    Arc::clone(&service),
                    service_backends.clone(),
                );
                if frontend.expands_per_node() {
                    frontend = frontend.with_node_port_addrs(state.node_addresses.clone());
                }
                frontends.insert(address, frontend);
            }
        }

        let mut events = vec![];
        for (addr, old) in &self.frontends {
            if !frontends.contains_key(addr) {
                events.push(Event::Delete(old.clone()));
            }
        }
        for (addr, new) in &frontends {
            match self.frontends.get(addr) {
                Some(old) if old.same_spec(new) => {}
                _ => events.push(Event::Upsert(new.clone())),
            }
        }

        debug!(
            frontends = frontends.len(),
            backends = backends.len(),
            events = events.len(),
            "desired state loaded"
        );
        self.backends = backends;
        self.frontends = frontends;
        Ok(events)
    }

    /// Resolves a backend of this load, keeping the previous revision when
    /// nothing about it changed. The first service listing an address decides
    /// its state.
    fn backend(
        &mut self,
        current: &mut ahash::HashMap<L3n4Addr, Backend>,
        spec: &BackendSpec,
    ) -> Backend {
        let addr = L3n4Addr::new(
            AddrCluster::new(spec.address, spec.cluster_id),
            spec.protocol,
            spec.port,
            Scope::External,
        );
        if let Some(backend) = current.get(&addr) {
            return backend.clone();
        }
        let mut backend = Backend {
            addr,
            state: spec.state,
            zone_id: spec.zone,
            revision: 0,
        };
        backend.revision = match self.backends.get(&addr) {
            Some(old) if old.state == backend.state && old.zone_id == backend.zone_id => {
                old.revision
            }
            _ => {
                self.revision += 1;
                self.revision
            }
        };
        current.insert(addr, backend.clone());
        backend
    }

    /// Reloads every `interval` and forwards the resulting events until
    /// cancelled or the receiver goes away.
    pub async fn run(
        mut self,
        interval: Duration,
        tx: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("watching desired state in {}", self.path.display());

        loop {
            select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let events = match self.reload() {
                Ok(events) => events,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to load desired state, keeping previous");
                    continue;
                }
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::Error;

    const STATE: &str = r#"
nodeAddresses: [192.168.1.10, "fd00::10"]
services:
  - name: default/web
    sessionAffinityTimeoutSeconds: 600
    extTrafficPolicy: Local
    frontends:
      - { address: 10.96.0.10, port: 80, protocol: TCP, type: ClusterIP }
      - { address: 0.0.0.0, port: 30080, type: NodePort }
    backends:
      - { address: 10.0.0.1, port: 8080 }
      - { address: 10.0.0.2, port: 8080, state: Terminating, zone: 2 }
  - name: kube-system/dns
    frontends:
      - { address: 10.96.0.53, port: 53, protocol: UDP }
    backends:
      - { address: 10.0.0.1, port: 8080 }
"#;

    fn upserts(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Upsert(fe) => Some(fe.address.to_string()),
                Event::Delete(_) => None,
            })
            .collect()
    }

    fn deletes(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Delete(fe) => Some(fe.address.to_string()),
                Event::Upsert(_) => None,
            })
            .collect()
    }

    fn frontend<'a>(events: &'a [Event], addr: &str) -> &'a Frontend {
        events
            .iter()
            .map(Event::frontend)
            .find(|fe| fe.address.to_string() == addr)
            .unwrap()
    }

    #[test]
    fn test_initial_load() -> crate::Result<()> {
        let mut source = FileSource::new("unused");
        let events = source.apply(STATE)?;
        assert_eq!(
            upserts(&events),
            vec!["0.0.0.0:30080/TCP", "10.96.0.10:80/TCP", "10.96.0.53:53/UDP"]
        );

        let web = frontend(&events, "10.96.0.10:80/TCP");
        assert_eq!(web.service.name, "default/web");
        assert!(web.service.session_affinity);
        assert_eq!(web.service.session_affinity_timeout, Duration::from_secs(600));
        assert_eq!(web.service.ext_traffic_policy, TrafficPolicy::Local);
        assert!(web.node_port_addrs.is_empty());
        assert_eq!(web.backends.len(), 2);
        assert_eq!(web.backends[1].state, BackendState::Terminating);
        assert_eq!(web.backends[1].zone_id, 2);

        let node_port = frontend(&events, "0.0.0.0:30080/TCP");
        assert_eq!(node_port.service_type, ServiceType::NodePort);
        assert_eq!(node_port.node_port_addrs.len(), 2);

        // The same backend listed by two services shares its revision.
        let dns = frontend(&events, "10.96.0.53:53/UDP");
        assert!(!dns.service.session_affinity);
        assert_eq!(dns.backends[0].revision, web.backends[0].revision);
        Ok(())
    }

    #[test]
    fn test_protocol_only_difference_is_rejected() -> crate::Result<()> {
        let mut source = FileSource::new("unused");
        let events = source.apply(
            r#"
services:
  - name: kube-system/dns
    frontends:
      - { address: 10.96.0.53, port: 53, protocol: TCP }
  - name: kube-system/dns-udp
    frontends:
      - { address: 10.96.0.53, port: 53, protocol: UDP }
      - { address: 10.96.0.53, port: 53, protocol: UDP, scope: Internal }
    backends:
      - { address: 10.0.0.1, port: 53 }
"#,
        )?;
        assert_eq!(upserts(&events).len(), 2);
        let kept = frontend(&events, "10.96.0.53:53/TCP");
        assert_eq!(kept.service.name, "kube-system/dns");
        assert!(
            events
                .iter()
                .map(Event::frontend)
                .all(|fe| fe.address.protocol == L4Protocol::Tcp || fe.address.scope == Scope::Internal)
        );
        Ok(())
    }

    #[test]
    fn test_unchanged_reload_yields_nothing() -> crate::Result<()> {
        let mut source = FileSource::new("unused");
        source.apply(STATE)?;
        assert!(source.apply(STATE)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_changed_backend_gets_new_revision() -> crate::Result<()> {
        let mut source = FileSource::new("unused");
        let first = source.apply(STATE)?;
        let before = frontend(&first, "10.96.0.10:80/TCP").backends.clone();

        let changed = STATE.replace("state: Terminating", "state: Active");
        let events = source.apply(&changed)?;
        assert_eq!(
            upserts(&events),
            vec!["0.0.0.0:30080/TCP", "10.96.0.10:80/TCP"]
        );
        let after = &frontend(&events, "10.96.0.10:80/TCP").backends;
        assert_eq!(after[0].revision, before[0].revision);
        assert!(after[1].revision > before[1].revision);
        assert_eq!(after[1].state, BackendState::Active);
        Ok(())
    }

    #[test]
    fn test_removed_frontend_is_deleted() -> crate::Result<()> {
        let mut source = FileSource::new("unused");
        source.apply(STATE)?;

        let removed = STATE.replace(
            "      - { address: 10.96.0.53, port: 53, protocol: UDP }\n",
            "",
        );
        let events = source.apply(&removed)?;
        assert_eq!(deletes(&events), vec!["10.96.0.53:53/UDP"]);
        assert!(upserts(&events).is_empty());

        let events = source.apply("")?;
        assert_eq!(
            deletes(&events),
            vec!["0.0.0.0:30080/TCP", "10.96.0.10:80/TCP"]
        );
        Ok(())
    }

    #[test]
    fn test_node_addresses_change_updates_expanded_frontends() -> crate::Result<()> {
        let mut source = FileSource::new("unused");
        source.apply(STATE)?;

        let events = source.apply(&STATE.replace(", \"fd00::10\"", ""))?;
        assert_eq!(upserts(&events), vec!["0.0.0.0:30080/TCP"]);
        assert_eq!(
            frontend(&events, "0.0.0.0:30080/TCP").node_port_addrs,
            vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))]
        );
        Ok(())
    }

    #[test]
    fn test_invalid_state_keeps_previous() -> crate::Result<()> {
        let mut source = FileSource::new("unused");
        source.apply(STATE)?;
        let err = source.apply("services: [{ name: broken, frontends: 3 }]").unwrap_err();
        assert!(matches!(err, Error::YamlConversion(_)));
        assert!(source.apply(STATE)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_reload_from_file() -> crate::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(STATE.as_bytes())?;
        let mut source = FileSource::new(file.path());
        assert_eq!(source.reload()?.len(), 3);

        let missing = FileSource::new(file.path().with_extension("missing")).reload();
        assert!(matches!(missing, Err(Error::IoError(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_forwards_events() -> crate::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(STATE.as_bytes())?;
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let source = FileSource::new(file.path());
        let handle = tokio::spawn(source.run(Duration::from_secs(3600), tx, cancel.clone()));

        let mut received = vec![];
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(upserts(&received).len(), 3);

        cancel.cancel();
        handle.await.unwrap()?;
        Ok(())
    }
}
