//! Key and value layouts of the load-balancing maps.
//!
//! Addresses are raw octets and ports are kept in network byte order so the
//! datapath can compare them against packet headers without conversion.
//! Identifiers, counts and flags are host order.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{BackendId, IpFamily, ServiceId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ServiceKey {
    V4(ServiceKeyV4),
    V6(ServiceKeyV6),
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceKeyV4 {
    pub address: [u8; 4],
    pub dport: u16,
    pub backend_slot: u16,
    pub proto: u8,
    pub scope: u8,
    pub _pad: [u8; 2],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ServiceKeyV4 {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceKeyV6 {
    pub address: [u8; 16],
    pub dport: u16,
    pub backend_slot: u16,
    pub proto: u8,
    pub scope: u8,
    pub _pad: [u8; 2],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ServiceKeyV6 {}

impl ServiceKey {
    pub fn new(ip: IpAddr, port: u16, proto: u8, scope: u8, backend_slot: u16) -> Self {
        match ip {
            IpAddr::V4(ip) => ServiceKey::V4(ServiceKeyV4 {
                address: ip.octets(),
                dport: port.to_be(),
                backend_slot,
                proto,
                scope,
                _pad: [0; 2],
            }),
            IpAddr::V6(ip) => ServiceKey::V6(ServiceKeyV6 {
                address: ip.octets(),
                dport: port.to_be(),
                backend_slot,
                proto,
                scope,
                _pad: [0; 2],
            }),
        }
    }

    pub fn family(&self) -> IpFamily {
        match self {
            ServiceKey::V4(_) => IpFamily::V4,
            ServiceKey::V6(_) => IpFamily::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            ServiceKey::V4(k) => IpAddr::V4(Ipv4Addr::from(k.address)),
            ServiceKey::V6(k) => IpAddr::V6(Ipv6Addr::from(k.address)),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ServiceKey::V4(k) => u16::from_be(k.dport),
            ServiceKey::V6(k) => u16::from_be(k.dport),
        }
    }

    pub fn scope(&self) -> u8 {
        match self {
            ServiceKey::V4(k) => k.scope,
            ServiceKey::V6(k) => k.scope,
        }
    }

    pub fn backend_slot(&self) -> u16 {
        match self {
            ServiceKey::V4(k) => k.backend_slot,
            ServiceKey::V6(k) => k.backend_slot,
        }
    }

    pub fn set_backend_slot(&mut self, slot: u16) {
        match self {
            ServiceKey::V4(k) => k.backend_slot = slot,
            ServiceKey::V6(k) => k.backend_slot = slot,
        }
    }

    /// Returns a copy of the key pointing at the given slot.
    pub fn with_backend_slot(mut self, slot: u16) -> Self {
        self.set_backend_slot(slot);
        self
    }
}

/// Value of a service slot. Slot 0 is the master entry: `count` holds the
/// number of active backends and `backend_id` is reused for the session
/// affinity timeout or the L7 proxy port.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct ServiceValue {
    pub backend_id: BackendId,
    pub count: u16,
    pub rev_nat_index: ServiceId,
    pub flags: u8,
    pub flags2: u8,
    pub _pad: [u8; 2],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ServiceValue {}

impl ServiceValue {
    pub fn set_flags(&mut self, flags: u16) {
        let [low, high] = flags.to_le_bytes();
        self.flags = low;
        self.flags2 = high;
    }

    pub fn get_flags(&self) -> u16 {
        u16::from_le_bytes([self.flags, self.flags2])
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendKey {
    pub id: BackendId,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendKey {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BackendValue {
    V4(BackendValueV4),
    V6(BackendValueV6),
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendValueV4 {
    pub address: [u8; 4],
    pub port: u16,
    pub proto: u8,
    pub flags: u8,
    pub cluster_id: u16,
    pub zone: u8,
    pub _pad: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendValueV4 {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendValueV6 {
    pub address: [u8; 16],
    pub port: u16,
    pub proto: u8,
    pub flags: u8,
    pub cluster_id: u16,
    pub zone: u8,
    pub _pad: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendValueV6 {}

impl BackendValue {
    pub fn new(ip: IpAddr, port: u16, proto: u8, flags: u8, cluster_id: u16, zone: u8) -> Self {
        match ip {
            IpAddr::V4(ip) => BackendValue::V4(BackendValueV4 {
                address: ip.octets(),
                port: port.to_be(),
                proto,
                flags,
                cluster_id,
                zone,
                _pad: 0,
            }),
            IpAddr::V6(ip) => BackendValue::V6(BackendValueV6 {
                address: ip.octets(),
                port: port.to_be(),
                proto,
                flags,
                cluster_id,
                zone,
                _pad: 0,
            }),
        }
    }

    pub fn family(&self) -> IpFamily {
        match self {
            BackendValue::V4(_) => IpFamily::V4,
            BackendValue::V6(_) => IpFamily::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            BackendValue::V4(v) => IpAddr::V4(Ipv4Addr::from(v.address)),
            BackendValue::V6(v) => IpAddr::V6(Ipv6Addr::from(v.address)),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            BackendValue::V4(v) => u16::from_be(v.port),
            BackendValue::V6(v) => u16::from_be(v.port),
        }
    }

    pub fn cluster_id(&self) -> u16 {
        match self {
            BackendValue::V4(v) => v.cluster_id,
            BackendValue::V6(v) => v.cluster_id,
        }
    }

    pub fn flags(&self) -> u8 {
        match self {
            BackendValue::V4(v) => v.flags,
            BackendValue::V6(v) => v.flags,
        }
    }

    pub fn zone(&self) -> u8 {
        match self {
            BackendValue::V4(v) => v.zone,
            BackendValue::V6(v) => v.zone,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RevNatKey {
    pub id: ServiceId,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RevNatKey {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RevNatValue {
    V4(RevNatValueV4),
    V6(RevNatValueV6),
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RevNatValueV4 {
    pub address: [u8; 4],
    pub port: u16,
    pub _pad: [u8; 2],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RevNatValueV4 {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RevNatValueV6 {
    pub address: [u8; 16],
    pub port: u16,
    pub _pad: [u8; 2],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RevNatValueV6 {}

impl RevNatValue {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(ip) => RevNatValue::V4(RevNatValueV4 {
                address: ip.octets(),
                port: port.to_be(),
                _pad: [0; 2],
            }),
            IpAddr::V6(ip) => RevNatValue::V6(RevNatValueV6 {
                address: ip.octets(),
                port: port.to_be(),
                _pad: [0; 2],
            }),
        }
    }

    pub fn family(&self) -> IpFamily {
        match self {
            RevNatValue::V4(_) => IpFamily::V4,
            RevNatValue::V6(_) => IpFamily::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            RevNatValue::V4(v) => IpAddr::from(v.address),
            RevNatValue::V6(v) => IpAddr::from(v.address),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            RevNatValue::V4(v) => u16::from_be(v.port),
            RevNatValue::V6(v) => u16::from_be(v.port),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityMatchKey {
    pub backend_id: BackendId,
    pub rev_nat_id: ServiceId,
    pub _pad: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityMatchKey {}

impl AffinityMatchKey {
    pub fn new(rev_nat_id: ServiceId, backend_id: BackendId) -> Self {
        Self {
            backend_id,
            rev_nat_id,
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct AffinityMatchValue {
    pub _pad: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityMatchValue {}
