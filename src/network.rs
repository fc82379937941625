//! Tower network addressing and WLAN key derivation.
//!
//! The tower networks are small IPv4 subnets (one online, one offline).
//! Host addresses are assigned by scanning what is already taken and
//! returning the lowest unused address at or above a reserved base
//! offset; the base and the subnets themselves are settings, not
//! constants.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;

/// WPA2 passphrase-to-PSK derivation: PBKDF2-HMAC-SHA1 over the SSID,
/// 4096 iterations, 256-bit key, hex encoded. This is the one derivation
/// path; raw passphrases are never embedded.
pub fn derive_wlan_key(ssid: &str, passphrase: &str) -> String {
    let mut psk = [0u8; 32];
    pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), ssid.as_bytes(), 4096, &mut psk);
    hex::encode(psk)
}

/// An IPv4 subnet in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(network: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix == 0 || prefix > 30 {
            return None;
        }
        let mask = u32::MAX << (32 - prefix);
        let base = u32::from(network) & mask;
        Some(Self {
            network: Ipv4Addr::from(base),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of assignable host addresses (network and broadcast
    /// excluded).
    pub fn host_count(&self) -> u32 {
        (1u32 << (32 - self.prefix)) - 2
    }

    /// Host address at 1-based `offset` from the network address, or
    /// `None` past the last assignable host.
    pub fn host_at(&self, offset: u32) -> Option<Ipv4Addr> {
        if offset == 0 || offset > self.host_count() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + offset))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix);
        (u32::from(addr) & mask) == u32::from(self.network)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR `{s}`: missing prefix"))?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| format!("invalid CIDR `{s}`: bad address"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("invalid CIDR `{s}`: bad prefix"))?;
        Subnet::new(network, prefix).ok_or_else(|| format!("invalid CIDR `{s}`: prefix too long"))
    }
}

/// Lowest unassigned host address in `subnet` at or above
/// `first_host_offset`.
///
/// `taken` holds every address already assigned (persisted host records,
/// the thin client, the router). Returns `None` when the subnet is
/// exhausted.
pub fn next_free_ip(
    subnet: &Subnet,
    first_host_offset: u32,
    taken: &BTreeSet<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    let first = first_host_offset.max(1);
    (first..=subnet.host_count())
        .filter_map(|offset| subnet.host_at(offset))
        .find(|candidate| !taken.contains(candidate))
}
