mod addr;
mod flags;
mod frontend;

pub use addr::{AddrCluster, L3n4Addr, L4Protocol, Scope};
pub use flags::{SvcFlagParam, SvcFlags};
pub use frontend::{
    Backend, BackendState, Frontend, NatPolicy, Revision, Service, ServiceType, Status, StatusKind,
    TrafficPolicy,
};
