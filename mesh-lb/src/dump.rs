use std::io::Write;
use std::net::SocketAddr;

use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::Result;
use crate::bpf::lbmap::{LbMaps, addr_from_service_key};
use crate::loadbalancer::L3n4Addr;

#[derive(Debug, PartialEq, Eq, Tabled)]
pub struct ServiceRow {
    #[tabled(rename = "FRONTEND")]
    pub frontend: L3n4Addr,
    #[tabled(rename = "SLOT")]
    pub slot: u16,
    #[tabled(rename = "BACKEND_ID")]
    pub backend_id: u32,
    #[tabled(rename = "COUNT")]
    pub count: u16,
    #[tabled(rename = "REV_NAT")]
    pub rev_nat: u16,
    #[tabled(rename = "FLAGS")]
    pub flags: String,
}

#[derive(Debug, PartialEq, Eq, Tabled)]
pub struct BackendRow {
    #[tabled(rename = "ID")]
    pub id: u32,
    #[tabled(rename = "ADDRESS")]
    pub address: SocketAddr,
    #[tabled(rename = "CLUSTER")]
    pub cluster_id: u16,
    #[tabled(rename = "STATE")]
    pub state: u8,
    #[tabled(rename = "ZONE")]
    pub zone: u8,
}

#[derive(Debug, PartialEq, Eq, Tabled)]
pub struct RevNatRow {
    #[tabled(rename = "ID")]
    pub id: u16,
    #[tabled(rename = "ADDRESS")]
    pub address: SocketAddr,
}

/// Service rows ordered by frontend and slot.
pub fn service_rows(maps: &impl LbMaps) -> Result<Vec<ServiceRow>> {
    let mut rows = vec![];
    maps.dump_service(&mut |key, value| {
        rows.push(ServiceRow {
            frontend: addr_from_service_key(&key),
            slot: key.backend_slot(),
            backend_id: value.backend_id,
            count: value.count,
            rev_nat: value.rev_nat_index,
            flags: format!("{:#06x}", value.get_flags()),
        })
    })?;
    rows.sort_by_key(|r| (r.frontend, r.slot));
    Ok(rows)
}

pub fn backend_rows(maps: &impl LbMaps) -> Result<Vec<BackendRow>> {
    let mut rows = vec![];
    maps.dump_backend(&mut |key, value| {
        rows.push(BackendRow {
            id: key.id,
            address: SocketAddr::new(value.ip(), value.port()),
            cluster_id: value.cluster_id(),
            state: value.flags(),
            zone: value.zone(),
        })
    })?;
    rows.sort_by_key(|r| (r.id, r.address.is_ipv6()));
    Ok(rows)
}

pub fn rev_nat_rows(maps: &impl LbMaps) -> Result<Vec<RevNatRow>> {
    let mut rows = vec![];
    maps.dump_rev_nat(&mut |key, value| {
        rows.push(RevNatRow {
            id: key.id,
            address: SocketAddr::new(value.ip(), value.port()),
        })
    })?;
    rows.sort_by_key(|r| (r.id, r.address.is_ipv6()));
    Ok(rows)
}

/// Prints the load-balancing tables.
pub fn dump(maps: &impl LbMaps, out: &mut impl Write) -> Result<()> {
    let services = Table::new(service_rows(maps)?)
        .with(Style::modern())
        .to_string();
    let backends = Table::new(backend_rows(maps)?)
        .with(Style::modern())
        .to_string();
    let rev_nat = Table::new(rev_nat_rows(maps)?)
        .with(Style::modern())
        .to_string();
    writeln!(out, "services\n{services}\n\nbackends\n{backends}\n\nrev nat\n{rev_nat}")?;
    Ok(())
}
