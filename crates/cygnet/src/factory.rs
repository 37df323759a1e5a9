//! Configuration-driven transport construction
//!
//! The application layer stores its configuration in a typed key/value register store; this
//! module consumes the transport-related keys and builds the matching transport instance. When
//! more than one sub-transport is configured the result is a redundant aggregate.
//!
//! Recognized keys:
//!
//! | Key | Type | Effect |
//! |---|---|---|
//! | `node.id` | u16 | Local node-ID; 0xFFFF = anonymous |
//! | `udp.iface` | string | Space-separated local IPs, one UDP sub-transport each |
//! | `udp.mtu` | u16 | Outgoing UDP frame payload limit, default 1200, range [1200, 9000] |
//! | `udp.duplicate_service_transfers` | bool | Service transfer multiplier = 2 |
//! | `serial.iface` | string | Space-separated ports (`socket://host:port`) |
//! | `serial.baudrate` | u32 | Bit rate override; 0 keeps the current rate |
//! | `can.iface` | string | Space-separated CAN interface specs (`candump:<path>`) |
//! | `can.mtu` | u16 | 8 or 64 |
//! | `can.bitrate` | (u32, u32) | Arbitration and data bit rates |
//! | `loopback` | bool | Add a loopback-only sub-transport (testing) |

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use cygnet_can::CanTransport;
use cygnet_can::media::CandumpMedia;
use cygnet_core::specifier::ANONYMOUS_NODE_ID;
use cygnet_core::transport::Transport;
use cygnet_core::{Result, TransportError};
use cygnet_serial::{SerialTransport, SerialTransportOptions, TcpPort};
use cygnet_udp::endpoint::node_id_to_unicast_ip;
use cygnet_udp::{UdpTransport, UdpTransportOptions};

use crate::loopback::LoopbackTransport;
use crate::redundant::RedundantTransport;

/// A typed configuration value, mirroring the register value categories of the application layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigValue {
    Bool(bool),
    Natural16(u16),
    Natural32(u32),
    Natural32Pair(u32, u32),
    Text(String),
}

/// The typed key/value store consumed by [make_transport]
#[derive(Clone, Debug, Default)]
pub struct ConfigMap {
    values: HashMap<String, ConfigValue>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K: Into<String>>(&mut self, key: K, value: ConfigValue) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    fn type_error(key: &str, expected: &str, got: &ConfigValue) -> TransportError {
        TransportError::InvalidTransportConfiguration(format!(
            "{key}: expected {expected}, got {got:?}"
        ))
    }

    pub fn bool_value(&self, key: &str) -> Result<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Bool(v)) => Ok(Some(*v)),
            Some(other) => Err(Self::type_error(key, "bool", other)),
        }
    }

    pub fn natural16(&self, key: &str) -> Result<Option<u16>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Natural16(v)) => Ok(Some(*v)),
            Some(other) => Err(Self::type_error(key, "natural16", other)),
        }
    }

    pub fn natural32(&self, key: &str) -> Result<Option<u32>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Natural32(v)) => Ok(Some(*v)),
            Some(other) => Err(Self::type_error(key, "natural32", other)),
        }
    }

    pub fn natural32_pair(&self, key: &str) -> Result<Option<(u32, u32)>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Natural32Pair(a, b)) => Ok(Some((*a, *b))),
            Some(other) => Err(Self::type_error(key, "natural32[2]", other)),
        }
    }

    pub fn text(&self, key: &str) -> Result<Option<&str>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(ConfigValue::Text(v)) => Ok(Some(v)),
            Some(other) => Err(Self::type_error(key, "string", other)),
        }
    }
}

/// Build a transport from the configuration
///
/// Returns `Ok(None)` when no transport is configured at all. A single configured sub-transport
/// is returned directly; several are wrapped in a redundant aggregate.
pub fn make_transport(config: &ConfigMap) -> Result<Option<Arc<dyn Transport>>> {
    let node_id = config
        .natural16("node.id")?
        .filter(|&id| id != ANONYMOUS_NODE_ID);

    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();

    if config.bool_value("loopback")?.unwrap_or(false) {
        transports.push(Arc::new(LoopbackTransport::new(node_id)));
    }

    if let Some(ifaces) = config.text("udp.iface")? {
        let mtu = config.natural16("udp.mtu")?.map(usize::from).unwrap_or(1200);
        let duplicate = config
            .bool_value("udp.duplicate_service_transfers")?
            .unwrap_or(false);
        let options = UdpTransportOptions {
            mtu,
            service_transfer_multiplier: if duplicate { 2 } else { 1 },
            ..Default::default()
        };
        for iface in ifaces.split_whitespace() {
            let ip: Ipv4Addr = iface.parse().map_err(|_| {
                TransportError::InvalidTransportConfiguration(format!(
                    "udp.iface: {iface:?} is not an IPv4 address"
                ))
            })?;
            // The node-ID replaces the 16 least significant bits of the configured address
            let local_ip = match node_id {
                Some(id) => node_id_to_unicast_ip(ip, id),
                None => ip,
            };
            transports.push(Arc::new(UdpTransport::new(local_ip, node_id, options)?));
        }
    }

    if let Some(ifaces) = config.text("serial.iface")? {
        let baud_rate = config.natural32("serial.baudrate")?.unwrap_or(0);
        for iface in ifaces.split_whitespace() {
            if !iface.starts_with("socket://") {
                return Err(TransportError::InvalidMediaConfiguration(format!(
                    "serial.iface: {iface:?} requires a platform serial driver, which is not \
                     part of this library; only socket:// links are served in-tree"
                )));
            }
            let port = TcpPort::connect(iface)
                .map_err(|e| TransportError::InvalidMediaConfiguration(e.to_string()))?;
            let transport = SerialTransport::new(
                Box::new(port),
                node_id,
                SerialTransportOptions::default(),
            )?;
            transport.set_baud_rate(baud_rate)?;
            transports.push(Arc::new(transport));
        }
    }

    if let Some(ifaces) = config.text("can.iface")? {
        let mtu = config.natural16("can.mtu")?.unwrap_or(64);
        if mtu != 8 && mtu != 64 {
            return Err(TransportError::InvalidTransportConfiguration(format!(
                "can.mtu: {mtu} is not 8 or 64"
            )));
        }
        // Bit rates apply to physical drivers only; the type is still validated
        let _bitrate = config.natural32_pair("can.bitrate")?;
        let can_node_id = match node_id {
            None => None,
            Some(id) => {
                if id > cygnet_can::MAX_NODE_ID as u16 {
                    return Err(TransportError::InvalidTransportConfiguration(format!(
                        "node.id: {id} does not fit the CAN limit of {}",
                        cygnet_can::MAX_NODE_ID
                    )));
                }
                Some(id as u8)
            }
        };
        for iface in ifaces.split_whitespace() {
            if let Some(path) = iface.strip_prefix("candump:") {
                let media = CandumpMedia::open(path)
                    .map_err(|e| TransportError::InvalidMediaConfiguration(e.to_string()))?;
                transports.push(Arc::new(CanTransport::new(Box::new(media), can_node_id)?));
            } else {
                return Err(TransportError::InvalidMediaConfiguration(format!(
                    "can.iface: {iface:?} requires a platform CAN driver, which is not part of \
                     this library; only candump: replay is served in-tree"
                )));
            }
        }
    }

    match transports.len() {
        0 => Ok(None),
        1 => Ok(transports.pop()),
        _ => Ok(Some(Arc::new(RedundantTransport::new(transports)?))),
    }
}
