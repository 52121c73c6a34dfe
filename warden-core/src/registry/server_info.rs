use crate::error::{Result, WardenError};
use std::net::IpAddr;
use std::str::FromStr;

/// Multiplier separating server type from node id in the encoded field
pub const SERVER_TYPE_BASE: u32 = 10000;

const FIELD_SEP: char = ':';

/// One listening endpoint of a service process.
///
/// Encoded as `<ip>:<port>:<server_type * 10000 + node_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub server_type: u32,
    pub node_id: u32,
}

impl ServerInfo {
    pub fn new(server_type: u32, ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            server_type,
            node_id: 0,
        }
    }

    /// Canonical registry field for this endpoint
    pub fn encode(&self) -> Result<String> {
        if self.port == 0 {
            return Err(WardenError::InvalidServerInfo(
                "port can't be zero".to_string(),
            ));
        }

        if self.server_type == 0 {
            return Err(WardenError::InvalidServerInfo(
                "server type must be greater than 0".to_string(),
            ));
        }

        if self.node_id == 0 || self.node_id >= SERVER_TYPE_BASE {
            return Err(WardenError::InvalidServerInfo(format!(
                "node id must be in 1..{}, got {}",
                SERVER_TYPE_BASE, self.node_id
            )));
        }

        let id = self
            .server_type
            .checked_mul(SERVER_TYPE_BASE)
            .and_then(|base| base.checked_add(self.node_id))
            .ok_or_else(|| {
                WardenError::InvalidServerInfo(format!(
                    "server type {} is too large",
                    self.server_type
                ))
            })?;

        Ok(format!(
            "{}{}{}{}{}",
            self.ip, FIELD_SEP, self.port, FIELD_SEP, id
        ))
    }
}

impl FromStr for ServerInfo {
    type Err = WardenError;

    /// Splits from the right so IPv6 addresses keep their colons
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(3, FIELD_SEP);
        let (Some(id), Some(port), Some(ip)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(WardenError::InvalidServerInfo(format!(
                "split failed: {}",
                s
            )));
        };

        let ip = ip.parse::<IpAddr>().map_err(|_| {
            WardenError::InvalidServerInfo(format!("parse ip failed: {}", ip))
        })?;

        let port = port.parse::<u16>().map_err(|_| {
            WardenError::InvalidServerInfo(format!("port parse failed: {}", port))
        })?;
        if port == 0 {
            return Err(WardenError::InvalidServerInfo(
                "port can't be zero".to_string(),
            ));
        }

        let id = id.parse::<u32>().map_err(|_| {
            WardenError::InvalidServerInfo(format!("convert to int failed: {}", id))
        })?;

        let info = ServerInfo {
            ip,
            port,
            server_type: id / SERVER_TYPE_BASE,
            node_id: id % SERVER_TYPE_BASE,
        };

        if info.server_type == 0 {
            return Err(WardenError::InvalidServerInfo(
                "server type must be greater than 0".to_string(),
            ));
        }

        if info.node_id == 0 {
            return Err(WardenError::InvalidServerInfo(
                "node id must be greater than 0".to_string(),
            ));
        }

        Ok(info)
    }
}
