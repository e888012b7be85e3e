//! Pool tree models

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Address family of a pool tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Bit width of addresses in this family
    pub fn width(&self) -> u8 {
        match self {
            AddressFamily::Ipv4 => 32,
            AddressFamily::Ipv6 => 128,
        }
    }

    /// Family of a concrete address
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Status of a pool node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Nothing in this block is allocated
    Free,
    /// The block is a leaf allocation, or both of its children are Full
    Full,
    /// Some, but not all, of the block's descendants are allocated
    Partial,
    /// Recently released leaf, parked until the hold-down period expires
    HeldDown,
}

impl PoolStatus {
    /// Whether a descent looking for space must skip a node in this state
    pub fn is_occupied(&self) -> bool {
        matches!(self, PoolStatus::Full | PoolStatus::HeldDown)
    }
}

/// A node in a pool tree
///
/// Rows form a binary buddy tree: a node either has no children (a leaf) or
/// exactly two children that bisect its block. Only the storage layer creates
/// and deletes rows; everything else goes through the tree operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    /// Unique row identifier
    pub id: Uuid,
    /// Address family, uniform across the whole tree
    pub family: AddressFamily,
    /// Network address of the represented block
    pub network: IpAddr,
    /// Prefix length of the represented block
    pub prefix_length: u8,
    /// Current status
    pub status: PoolStatus,
    /// Human-readable label, set on top-level pools
    pub description: Option<String>,
    /// Parent node; None exactly for top-level pools
    pub parent: Option<Uuid>,
    /// Root of this node's tree; self-referential on top-level pools
    pub top_level: Uuid,
    /// Prefix length used by requests that do not name one (root only)
    pub prefix_length_default: Option<u8>,
    /// Smallest prefix length requests may ask for (root only)
    pub prefix_length_minimum: Option<u8>,
    /// Largest prefix length requests may ask for (root only)
    pub prefix_length_maximum: Option<u8>,
    /// Opaque owner reference, set on Full leaves
    pub allocation_owner: Option<Uuid>,
    /// When the owner was stamped
    pub allocation_timestamp: Option<DateTime<Utc>>,
    /// Start of the hold-down clock, set while status is HeldDown
    pub held_from: Option<DateTime<Utc>>,
}

impl PoolRecord {
    /// The subnet this node represents
    pub fn ip_subnet(&self) -> IpNet {
        // (network, prefix_length) is validated when the row is created, so
        // materializing it cannot fail.
        match self.network {
            IpAddr::V4(addr) => IpNet::V4(Ipv4Net::new_assert(addr, self.prefix_length)),
            IpAddr::V6(addr) => IpNet::V6(Ipv6Net::new_assert(addr, self.prefix_length)),
        }
    }

    /// Whether this node is the root of its tree
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether the given network lies entirely inside this node's block
    pub fn contains(&self, network: IpNet) -> bool {
        self.ip_subnet().contains(&network)
    }
}

impl fmt::Display for PoolRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => {
                write!(f, "{} [{}/{}]", description, self.network, self.prefix_length)
            }
            None => write!(f, "{}/{}", self.network, self.prefix_length),
        }
    }
}

/// Parameters for creating a pool row
#[derive(Debug, Clone)]
pub struct NewPool {
    pub family: AddressFamily,
    pub network: IpAddr,
    pub prefix_length: u8,
    pub status: PoolStatus,
    pub description: Option<String>,
    pub parent: Option<Uuid>,
    /// Tree root for child rows; None makes the new row its own root
    pub top_level: Option<Uuid>,
    pub prefix_length_default: Option<u8>,
    pub prefix_length_minimum: Option<u8>,
    pub prefix_length_maximum: Option<u8>,
}

impl NewPool {
    /// A Free child row for one half of a bisected parent
    pub fn child_of(parent: &PoolRecord, half: IpNet) -> Self {
        Self {
            family: parent.family,
            network: half.network(),
            prefix_length: half.prefix_len(),
            status: PoolStatus::Free,
            description: None,
            parent: Some(parent.id),
            top_level: Some(parent.top_level),
            prefix_length_default: None,
            prefix_length_minimum: None,
            prefix_length_maximum: None,
        }
    }
}

/// Aggregate statistics for one pool tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolTreeStats {
    /// Top-level pool ID
    pub pool_id: Uuid,
    /// Address family of the tree
    pub family: AddressFamily,
    /// Total addresses covered by the root block
    pub total_addresses: u128,
    /// Addresses inside Full leaves
    pub allocated_addresses: u128,
    /// Addresses inside HeldDown leaves
    pub held_down_addresses: u128,
    /// Addresses not allocated and not held down
    pub free_addresses: u128,
    /// Number of Full leaves
    pub allocated_subnets: usize,
    /// Number of HeldDown leaves
    pub held_down_subnets: usize,
    /// Allocated share of the root block
    pub utilization_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn record(network: &str, prefix_length: u8) -> PoolRecord {
        let id = Uuid::new_v4();
        PoolRecord {
            id,
            family: AddressFamily::Ipv4,
            network: IpAddr::from_str(network).unwrap(),
            prefix_length,
            status: PoolStatus::Free,
            description: None,
            parent: None,
            top_level: id,
            prefix_length_default: None,
            prefix_length_minimum: None,
            prefix_length_maximum: None,
            allocation_owner: None,
            allocation_timestamp: None,
            held_from: None,
        }
    }

    #[test]
    fn test_family_width() {
        assert_eq!(AddressFamily::Ipv4.width(), 32);
        assert_eq!(AddressFamily::Ipv6.width(), 128);
        assert_eq!(
            AddressFamily::of(IpAddr::from_str("10.0.0.1").unwrap()),
            AddressFamily::Ipv4
        );
        assert_eq!(
            AddressFamily::of(IpAddr::from_str("fd00::1").unwrap()),
            AddressFamily::Ipv6
        );
    }

    #[test]
    fn test_ip_subnet_materialization() {
        let pool = record("10.16.0.0", 12);
        assert_eq!(pool.ip_subnet(), IpNet::from_str("10.16.0.0/12").unwrap());
    }

    #[test]
    fn test_contains() {
        let pool = record("10.0.0.0", 16);
        assert!(pool.contains(IpNet::from_str("10.0.4.0/24").unwrap()));
        assert!(pool.contains(IpNet::from_str("10.0.0.0/16").unwrap()));
        assert!(!pool.contains(IpNet::from_str("10.1.0.0/24").unwrap()));
        assert!(!pool.contains(IpNet::from_str("10.0.0.0/8").unwrap()));
    }

    #[test]
    fn test_display_with_description() {
        let mut pool = record("10.0.0.0", 16);
        assert_eq!(pool.to_string(), "10.0.0.0/16");

        pool.description = Some("Ljubljana mesh".to_string());
        assert_eq!(pool.to_string(), "Ljubljana mesh [10.0.0.0/16]");
    }

    #[test]
    fn test_occupied_statuses() {
        assert!(PoolStatus::Full.is_occupied());
        assert!(PoolStatus::HeldDown.is_occupied());
        assert!(!PoolStatus::Free.is_occupied());
        assert!(!PoolStatus::Partial.is_occupied());
    }

    #[test]
    fn test_child_of_inherits_tree_fields() {
        let parent = record("10.0.0.0", 16);
        let half = IpNet::from_str("10.0.128.0/17").unwrap();
        let child = NewPool::child_of(&parent, half);

        assert_eq!(child.family, parent.family);
        assert_eq!(child.network, IpAddr::from_str("10.0.128.0").unwrap());
        assert_eq!(child.prefix_length, 17);
        assert_eq!(child.status, PoolStatus::Free);
        assert_eq!(child.parent, Some(parent.id));
        assert_eq!(child.top_level, Some(parent.top_level));
        assert!(child.description.is_none());
    }
}
