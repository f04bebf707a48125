use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::loadbalancer::L3n4Addr;

pub type Revision = u64;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
pub enum ServiceType {
    #[default]
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    #[serde(rename = "ExternalIPs")]
    ExternalIps,
    HostPort,
    LoadBalancer,
    LocalRedirect,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    Local,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
pub enum NatPolicy {
    #[default]
    None,
    Nat46,
    Nat64,
}

/// Backend health as seen by the datapath. Active backends sort first and
/// are the only ones assigned to service slots.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Deserialize)]
pub enum BackendState {
    #[default]
    Active = 0,
    Terminating = 1,
    Quarantined = 2,
    Maintenance = 3,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Backend {
    pub addr: L3n4Addr,
    pub state: BackendState,
    pub zone_id: u8,
    pub revision: Revision,
}

impl Backend {
    pub fn is_active(&self) -> bool {
        self.state == BackendState::Active
    }
}

/// Service level settings shared by all frontends of a service.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Service {
    pub name: String,
    pub ext_traffic_policy: TrafficPolicy,
    pub int_traffic_policy: TrafficPolicy,
    pub nat_policy: NatPolicy,
    pub session_affinity: bool,
    pub session_affinity_timeout: Duration,
    pub l7_proxy_port: u16,
    pub loopback_host_port: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum StatusKind {
    #[default]
    Pending,
    Done,
    Error,
}

/// Reconciliation status of a frontend, maintained by the run loop.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Status {
    pub kind: StatusKind,
    pub error: Option<String>,
}

impl Status {
    pub fn done() -> Self {
        Self {
            kind: StatusKind::Done,
            error: None,
        }
    }

    pub fn error(e: &crate::Error) -> Self {
        Self {
            kind: StatusKind::Error,
            error: Some(e.to_string()),
        }
    }
}

/// A virtual service address together with the backends it balances to.
///
/// Frontends are handed to the reconciler by value. Clones share the service
/// settings so expanding a frontend per node address stays cheap.
#[derive(Clone, Debug)]
pub struct Frontend {
    pub address: L3n4Addr,
    pub service_type: ServiceType,
    pub service: Arc<Service>,
    pub backends: Vec<Backend>,
    /// Node addresses a NodePort or wildcard HostPort frontend is expanded to.
    pub node_port_addrs: Vec<IpAddr>,
    status: Status,
}

impl Frontend {
    pub fn new(
        address: L3n4Addr,
        service_type: ServiceType,
        service: Arc<Service>,
        backends: Vec<Backend>,
    ) -> Self {
        Self {
            address,
            service_type,
            service,
            backends,
            node_port_addrs: vec![],
            status: Status::default(),
        }
    }

    pub fn with_node_port_addrs(mut self, addrs: Vec<IpAddr>) -> Self {
        self.node_port_addrs = addrs;
        self
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// True when this frontend has to be written once per node address.
    pub fn expands_per_node(&self) -> bool {
        self.service_type == ServiceType::NodePort
            || (self.service_type == ServiceType::HostPort && self.address.is_unspecified())
    }

    /// Equality of everything the datapath depends on, ignoring status.
    pub fn same_spec(&self, other: &Frontend) -> bool {
        self.address == other.address
            && self.service_type == other.service_type
            && self.service == other.service
            && self.backends == other.backends
            && self.node_port_addrs == other.node_port_addrs
    }
}
