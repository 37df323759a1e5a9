//! IPv4 endpoint mapping
//!
//! Message transfers go to fixed multicast groups derived from the subject-ID, all on one UDP
//! port:
//!
//! ```text
//!   fixed   message  reserved
//!  (9 bits) select.  (3 bits)
//!  ________   res.|  _
//! /        \     vv / \
//! 11101111.0ddddd00.000sssss.ssssssss
//! \__/      \___/      \____________/
//!  IPv4    domain-ID      subject-ID
//! ```
//!
//! Service transfers go to multicast groups derived from the destination node-ID, one UDP port
//! per (service-ID, role):
//!
//! ```text
//!   fixed          service
//!  (9 bits)  res.  selector
//!  ________      ||
//! /        \     vv
//! 11101111.0ddddd01.nnnnnnnn.nnnnnnnn
//! \__/      \___/   \_______________/
//!  IPv4    domain-ID     node-ID
//! ```
//!
//! The domain-ID (0..31) isolates independent Cyphal networks sharing one IP network. Source
//! node-IDs are recovered from the sender's unicast address: the 16 least significant bits within
//! the local /16 subnet.

use std::net::Ipv4Addr;

use cygnet_core::specifier::SUBJECT_ID_MASK;
use cygnet_core::{DataSpecifier, ServiceRole};

/// All subjects share this destination UDP port; subjects are told apart by the group address
pub const SUBJECT_PORT: u16 = 16383;

/// Service ports start here: `16384 + 2 * service_id + (0 = request, 1 = response)`
pub const SERVICE_BASE_PORT: u16 = 16384;

/// Default multicast TTL; the RFC 1112 default of 1 is unacceptable for routed networks
pub const DEFAULT_TTL: u32 = 16;

/// Largest valid domain-ID (5 bits)
pub const MAX_DOMAIN_ID: u8 = 31;

const MULTICAST_PREFIX: u32 = 0b1110_1111 << 24;
const MULTICAST_PREFIX_MASK: u32 = 0b1111_1111_1 << 23;
const DOMAIN_ID_SHIFT: u32 = 18;
const SERVICE_SELECTOR_BIT: u32 = 1 << 16;

fn group_base(domain_id: u8) -> u32 {
    debug_assert!(domain_id <= MAX_DOMAIN_ID);
    MULTICAST_PREFIX | ((domain_id as u32 & 0b11111) << DOMAIN_ID_SHIFT)
}

/// The multicast group all transfers on this subject are sent to
#[must_use]
pub fn message_multicast_group(domain_id: u8, subject_id: u16) -> Ipv4Addr {
    Ipv4Addr::from(group_base(domain_id) | (subject_id & SUBJECT_ID_MASK) as u32)
}

/// The multicast group service transfers addressed to this node are sent to
#[must_use]
pub fn service_multicast_group(domain_id: u8, destination_node_id: u16) -> Ipv4Addr {
    Ipv4Addr::from(group_base(domain_id) | SERVICE_SELECTOR_BIT | destination_node_id as u32)
}

/// Inverse of [message_multicast_group]; `None` if the group is not a message group of this
/// domain
#[must_use]
pub fn multicast_group_to_subject_id(domain_id: u8, group: Ipv4Addr) -> Option<u16> {
    let candidate = (u32::from(group) & SUBJECT_ID_MASK as u32) as u16;
    (message_multicast_group(domain_id, candidate) == group).then_some(candidate)
}

/// Inverse of [service_multicast_group]; `None` if the group is not a service group of this
/// domain
#[must_use]
pub fn service_multicast_group_to_node_id(domain_id: u8, group: Ipv4Addr) -> Option<u16> {
    let candidate = (u32::from(group) & 0xFFFF) as u16;
    (service_multicast_group(domain_id, candidate) == group).then_some(candidate)
}

/// True for any address in the Cyphal multicast block, regardless of domain
#[must_use]
pub fn is_cyphal_multicast(group: Ipv4Addr) -> bool {
    u32::from(group) & MULTICAST_PREFIX_MASK == MULTICAST_PREFIX
}

/// The destination UDP port of a service transfer
#[must_use]
pub fn service_port(service_id: u16, role: ServiceRole) -> u16 {
    let request = SERVICE_BASE_PORT + service_id * 2;
    match role {
        ServiceRole::Request => request,
        ServiceRole::Response => request + 1,
    }
}

/// Inverse of [service_port]; `None` for ports outside the service range
#[must_use]
pub fn port_to_service_data_specifier(port: u16) -> Option<DataSpecifier> {
    if port < SERVICE_BASE_PORT {
        return None;
    }
    let service_id = (port - SERVICE_BASE_PORT) / 2;
    if service_id > cygnet_core::specifier::SERVICE_ID_MASK {
        return None;
    }
    let role = if port % 2 == 0 {
        ServiceRole::Request
    } else {
        ServiceRole::Response
    };
    Some(DataSpecifier::Service { service_id, role })
}

/// Map a sender's unicast address to its node-ID: the 16 least significant bits, valid only
/// within the local /16 subnet
#[must_use]
pub fn unicast_ip_to_node_id(local: Ipv4Addr, remote: Ipv4Addr) -> Option<u16> {
    let local = u32::from(local);
    let remote = u32::from(remote);
    (local >> 16 == remote >> 16).then_some((remote & 0xFFFF) as u16)
}

/// Replace the 16 least significant bits of the local address with the node-ID
#[must_use]
pub fn node_id_to_unicast_ip(local: Ipv4Addr, node_id: u16) -> Ipv4Addr {
    Ipv4Addr::from((u32::from(local) & 0xFFFF_0000) | node_id as u32)
}
