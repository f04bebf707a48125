use crate::loadbalancer::{NatPolicy, ServiceType};

/// Packed service flags stored in the `flags`/`flags2` bytes of every
/// service slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct SvcFlags(u16);

impl SvcFlags {
    pub const EXTERNAL_IPS: u16 = 1 << 0;
    pub const NODE_PORT: u16 = 1 << 1;
    pub const EXT_LOCAL_SCOPE: u16 = 1 << 2;
    pub const HOST_PORT: u16 = 1 << 3;
    pub const SESSION_AFFINITY: u16 = 1 << 4;
    pub const LOAD_BALANCER: u16 = 1 << 5;
    pub const ROUTABLE: u16 = 1 << 6;
    pub const LOCAL_REDIRECT: u16 = 1 << 8;
    pub const NAT_46X64: u16 = 1 << 9;
    pub const L7_LOAD_BALANCER: u16 = 1 << 10;
    pub const LOOPBACK: u16 = 1 << 11;
    pub const INT_LOCAL_SCOPE: u16 = 1 << 12;
    pub const TWO_SCOPES: u16 = 1 << 13;

    pub fn new(p: &SvcFlagParam) -> Self {
        let mut flags = 0;
        match p.svc_type {
            ServiceType::ExternalIps => flags |= Self::EXTERNAL_IPS,
            ServiceType::NodePort => flags |= Self::NODE_PORT,
            ServiceType::LoadBalancer => flags |= Self::LOAD_BALANCER,
            ServiceType::HostPort => {
                flags |= Self::HOST_PORT;
                if p.loopback_host_port {
                    flags |= Self::LOOPBACK;
                }
            }
            ServiceType::LocalRedirect => flags |= Self::LOCAL_REDIRECT,
            ServiceType::ClusterIp => {}
        }
        if matches!(p.nat_policy, NatPolicy::Nat46 | NatPolicy::Nat64) {
            flags |= Self::NAT_46X64;
        }
        if p.ext_local {
            flags |= Self::EXT_LOCAL_SCOPE;
        }
        if p.int_local {
            flags |= Self::INT_LOCAL_SCOPE;
        }
        if p.session_affinity {
            flags |= Self::SESSION_AFFINITY;
        }
        if p.is_routable {
            flags |= Self::ROUTABLE;
        }
        if p.l7_load_balancer {
            flags |= Self::L7_LOAD_BALANCER;
        }
        if p.ext_local != p.int_local && p.svc_type != ServiceType::ClusterIp {
            flags |= Self::TWO_SCOPES;
        }
        Self(flags)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, flag: u16) -> bool {
        self.0 & flag == flag
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SvcFlagParam {
    pub svc_type: ServiceType,
    pub ext_local: bool,
    pub int_local: bool,
    pub nat_policy: NatPolicy,
    pub session_affinity: bool,
    pub is_routable: bool,
    pub l7_load_balancer: bool,
    pub loopback_host_port: bool,
}
