use std::fmt::Display;
use std::net::IpAddr;

use mesh_lb_ebpf_common::IpFamily;
use serde::Deserialize;

/// An L3 address optionally scoped to a cluster of the mesh.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AddrCluster {
    pub addr: IpAddr,
    pub cluster_id: u32,
}

impl AddrCluster {
    pub fn new(addr: IpAddr, cluster_id: u32) -> Self {
        Self { addr, cluster_id }
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified()
    }
}

impl From<IpAddr> for AddrCluster {
    fn from(addr: IpAddr) -> Self {
        Self::new(addr, 0)
    }
}

impl Display for AddrCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cluster_id == 0 {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}@{}", self.addr, self.cluster_id)
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum L4Protocol {
    Any = 0,
    #[default]
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
}

impl Display for L4Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            L4Protocol::Any => write!(f, "ANY"),
            L4Protocol::Tcp => write!(f, "TCP"),
            L4Protocol::Udp => write!(f, "UDP"),
            L4Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Deserialize)]
pub enum Scope {
    #[default]
    External = 0,
    Internal = 1,
}

impl From<u8> for Scope {
    fn from(value: u8) -> Self {
        if value == Scope::Internal as u8 {
            Scope::Internal
        } else {
            Scope::External
        }
    }
}

/// Address, protocol and port of a frontend or backend.
///
/// Ordering sorts by address first and then port which is the order backends
/// are assigned to service slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct L3n4Addr {
    pub addr_cluster: AddrCluster,
    pub port: u16,
    pub protocol: L4Protocol,
    pub scope: Scope,
}

impl L3n4Addr {
    pub fn new(addr_cluster: AddrCluster, protocol: L4Protocol, port: u16, scope: Scope) -> Self {
        Self {
            addr_cluster,
            port,
            protocol,
            scope,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr_cluster.addr
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr_cluster.addr.is_ipv6()
    }

    pub fn family(&self) -> IpFamily {
        if self.is_ipv6() {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr_cluster.is_unspecified()
    }

    /// Copy of this address with the L3 part replaced. Used when expanding a
    /// NodePort frontend across the node addresses.
    pub fn with_addr(&self, addr: IpAddr) -> Self {
        Self {
            addr_cluster: AddrCluster::new(addr, 0),
            ..*self
        }
    }

    /// Canonical string identity used to key id allocations.
    pub fn string_id(&self) -> String {
        self.to_string()
    }
}

impl Display for L3n4Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_ipv6() {
            write!(f, "[{}]:{}/{}", self.addr_cluster, self.port, self.protocol)?;
        } else {
            write!(f, "{}:{}/{}", self.addr_cluster, self.port, self.protocol)?;
        }
        if self.scope == Scope::Internal {
            write!(f, "/i")?;
        }
        Ok(())
    }
}
