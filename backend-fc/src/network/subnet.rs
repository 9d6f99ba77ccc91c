use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
#[error("invalid subnet {0:?}")]
pub struct SubnetError(pub String);

/// An IPv4 subnet in CIDR form. The first usable address (`.1`) is the
/// bridge gateway; guests get the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subnet {
    network: u32,
    pub prefix: u8,
}

impl Subnet {
    pub fn parse(cidr: &str) -> Result<Self, SubnetError> {
        let (addr, prefix) = cidr.split_once('/').ok_or_else(|| SubnetError(cidr.into()))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| SubnetError(cidr.into()))?;
        let prefix: u8 = prefix.parse().map_err(|_| SubnetError(cidr.into()))?;
        if prefix < 8 || prefix > 30 {
            return Err(SubnetError(cidr.into()));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network + 1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::MAX << (32 - self.prefix))
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", Ipv4Addr::from(self.network), self.prefix)
    }

    fn broadcast(&self) -> u32 {
        self.network | (u32::MAX >> self.prefix)
    }

    /// Guest-assignable addresses: the subnet minus network, gateway, and
    /// broadcast.
    pub fn hosts(&self) -> Vec<String> {
        (self.network + 2..self.broadcast())
            .map(|ip| Ipv4Addr::from(ip).to_string())
            .collect()
    }
}
