//! Address allocation requests

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AddressFamily;

/// Prefix length requested when a request does not name one
pub const DEFAULT_REQUEST_PREFIX_LENGTH: u8 = 27;

/// A caller-held request for one subnet out of a pool tree
///
/// Requests are plain values owned by the caller, typically embedded in a
/// node's configuration. Only the `allocation` reference ties a request to a
/// pool row; the pool side never points back. The deep satisfaction check
/// lives on the manager, which can consult storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Request identifier
    pub id: Uuid,
    /// Address family the request must be satisfied from
    pub family: AddressFamily,
    /// Top-level pool to draw from
    pub pool: Uuid,
    /// Requested subnet size
    pub prefix_length: u8,
    /// Host address whose enclosing subnet should be reserved, if any
    pub subnet_hint: Option<IpNet>,
    /// Full leaf backing this request once satisfied
    pub allocation: Option<Uuid>,
}

impl AllocationRequest {
    /// New unsatisfied request with the default prefix length
    pub fn new(family: AddressFamily, pool: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            family,
            pool,
            prefix_length: DEFAULT_REQUEST_PREFIX_LENGTH,
            subnet_hint: None,
            allocation: None,
        }
    }

    /// Set the requested subnet size
    pub fn with_prefix_length(mut self, prefix_length: u8) -> Self {
        self.prefix_length = prefix_length;
        self
    }

    /// Ask for the specific subnet enclosing this host address
    pub fn with_hint(mut self, hint: IpNet) -> Self {
        self.subnet_hint = Some(hint);
        self
    }

    /// Whether a subnet reference has been recorded on this request
    pub fn has_allocation(&self) -> bool {
        self.allocation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_request_defaults() {
        let pool = Uuid::new_v4();
        let request = AllocationRequest::new(AddressFamily::Ipv4, pool);

        assert_eq!(request.prefix_length, DEFAULT_REQUEST_PREFIX_LENGTH);
        assert_eq!(request.pool, pool);
        assert!(request.subnet_hint.is_none());
        assert!(!request.has_allocation());
    }

    #[test]
    fn test_request_builders() {
        let request = AllocationRequest::new(AddressFamily::Ipv4, Uuid::new_v4())
            .with_prefix_length(26)
            .with_hint(IpNet::from_str("10.0.5.3/27").unwrap());

        assert_eq!(request.prefix_length, 26);
        assert_eq!(
            request.subnet_hint,
            Some(IpNet::from_str("10.0.5.3/27").unwrap())
        );
    }
}
