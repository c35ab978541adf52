//! Storage node registration records and the master-side node registry.

use crate::node::NodeAddr;
use crate::utils::SplitfsError;

/// Prefix of every discovery datagram.
pub const REGISTER_PREFIX: &str = "REGISTER:";

/// What a storage node announces about itself on startup.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Registration {
    /// Address the node serves commands on.
    pub addr: NodeAddr,

    /// Directory holding the node's partition blobs.
    pub local_root: String,

    /// Port of the master the node announced itself to.
    pub master_port: u16,
}

impl Registration {
    /// Renders the discovery datagram text,
    /// `REGISTER:<host>:<port>:<localRoot>:<masterPort>`.
    pub fn to_datagram(&self) -> String {
        format!(
            "{}{}:{}:{}:{}",
            REGISTER_PREFIX,
            self.addr.host,
            self.addr.port,
            self.local_root,
            self.master_port
        )
    }

    /// Parses a discovery datagram. The local root sits between the port
    /// and the master port and may itself contain colons.
    pub fn parse_datagram(msg: &str) -> Result<Self, SplitfsError> {
        let malformed = || {
            SplitfsError::MalformedCommand(format!(
                "bad registration '{}'",
                msg
            ))
        };

        let body = msg
            .trim_end()
            .strip_prefix(REGISTER_PREFIX)
            .ok_or_else(malformed)?;
        let (host, rest) = body.split_once(':').ok_or_else(malformed)?;
        let (port, rest) = rest.split_once(':').ok_or_else(malformed)?;
        let (local_root, master_port) =
            rest.rsplit_once(':').ok_or_else(malformed)?;
        if host.is_empty() {
            return Err(malformed());
        }

        Ok(Registration {
            addr: NodeAddr::new(host, port.parse().map_err(|_| malformed())?),
            local_root: local_root.into(),
            master_port: master_port.parse().map_err(|_| malformed())?,
        })
    }
}

/// Append-only list of registered nodes in registration order. Repeated
/// registrations of the same node are kept as separate entries and nothing
/// is ever removed.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<Registration>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a registration and returns the new population.
    pub fn register(&mut self, reg: Registration) -> usize {
        self.nodes.push(reg);
        self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Copy of the current registrations, in registration order.
    pub fn snapshot(&self) -> Vec<Registration> {
        self.nodes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_both_ways() -> Result<(), SplitfsError> {
        let reg = Registration {
            addr: NodeAddr::new("10.0.0.7", 7001),
            local_root: "/data/slave1".into(),
            master_port: 9000,
        };
        assert_eq!(
            reg.to_datagram(),
            "REGISTER:10.0.0.7:7001:/data/slave1:9000"
        );
        assert_eq!(Registration::parse_datagram(&reg.to_datagram())?, reg);
        Ok(())
    }

    #[test]
    fn datagram_root_with_colons() -> Result<(), SplitfsError> {
        let reg = Registration::parse_datagram(
            "REGISTER:host:7001:C:\\store:9000\n",
        )?;
        assert_eq!(reg.addr, NodeAddr::new("host", 7001));
        assert_eq!(reg.local_root, "C:\\store");
        assert_eq!(reg.master_port, 9000);
        Ok(())
    }

    #[test]
    fn datagram_malformed() {
        assert!(Registration::parse_datagram("HELLO:h:1:/r:2").is_err());
        assert!(Registration::parse_datagram("REGISTER:h:1").is_err());
        assert!(Registration::parse_datagram("REGISTER:h:x:/r:2").is_err());
        assert!(Registration::parse_datagram("REGISTER::1:/r:2").is_err());
        assert!(Registration::parse_datagram("REGISTER:h:1:/r:z").is_err());
    }

    #[test]
    fn registry_keeps_duplicates() {
        let mut registry = NodeRegistry::new();
        assert!(registry.is_empty());
        let reg = Registration {
            addr: NodeAddr::new("h", 1),
            local_root: "/r".into(),
            master_port: 2,
        };
        assert_eq!(registry.register(reg.clone()), 1);
        assert_eq!(registry.register(reg.clone()), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot(), vec![reg.clone(), reg]);
    }
}
