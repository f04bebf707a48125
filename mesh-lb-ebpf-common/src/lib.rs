#![no_std]

pub mod service;

pub type ServiceId = u16;
pub type BackendId = u32;

/// Protocol byte written into keys and backend rows. The datapath only
/// matches on address and port today so this is always `ANY`.
pub const PROTO_ANY: u8 = 0;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IpFamily {
    V4 = 4,
    V6 = 6,
}

impl core::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}
