//! Address-family selection and the resolver capability.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{ErrorKind, Result, XrdError};
use crate::url::XrdUrl;

// ---------------------------------------------------------------------------
// AddressType
// ---------------------------------------------------------------------------

/// Which address families a stream may connect over.
///
/// `IPAuto` is resolved against the local stack's capabilities at stream
/// construction: on a host without dual-stack support it collapses to
/// whichever family exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    // ---
    IPv4,
    IPv6,
    /// Use every resolved address regardless of family.
    IPAll,
    #[default]
    IPAuto,
}

// ---

impl AddressType {
    // ---
    /// Whether an address of the given family may be used under this policy.
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressType::IPv4 => addr.is_ipv4(),
            AddressType::IPv6 => addr.is_ipv6(),
            AddressType::IPAll | AddressType::IPAuto => true,
        }
    }
}

// ---

impl FromStr for AddressType {
    type Err = XrdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IPv4" => Ok(AddressType::IPv4),
            "IPv6" => Ok(AddressType::IPv6),
            "IPAll" => Ok(AddressType::IPAll),
            "IPAuto" => Ok(AddressType::IPAuto),
            _ => Err(XrdError::new(ErrorKind::LocalError)),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Source of addresses for an endpoint.
///
/// The system implementation is DNS-backed; tests substitute a static map.
/// Resolution order matters: the stream consumes its work-list back to
/// front, so implementations return addresses in *reverse* preference
/// order.
pub trait Resolver: Send + Sync {
    // ---
    fn resolve(&self, url: &XrdUrl, family: AddressType) -> Result<Vec<SocketAddr>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
