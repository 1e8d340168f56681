//! Endpoint address resolution with preference ordering.
//!
//! The stream keeps its resolved addresses as a work-list consumed back to
//! front, so "try this first" means "put it last".  A configured preferred
//! endpoint re-orders the list: primary addresses not in the preferred set
//! come first (tried last), then every preferred address.

use std::net::{SocketAddr, ToSocketAddrs};

use socket2::{Domain, Socket, Type};
use xrd_domain::{AddressType, ErrorKind, Resolver, Result, XrdError, XrdUrl};

// ---------------------------------------------------------------------------
// SystemResolver
// ---------------------------------------------------------------------------

/// DNS-backed resolver using the platform's lookup machinery.
#[derive(Debug, Default)]
pub struct SystemResolver;

// ---

impl Resolver for SystemResolver {
    // ---
    fn resolve(&self, url: &XrdUrl, family: AddressType) -> Result<Vec<SocketAddr>> {
        // ---
        let addrs: Vec<SocketAddr> = (url.host(), url.port())
            .to_socket_addrs()
            .map_err(|_| XrdError::new(ErrorKind::ConnectionError))?
            .filter(|a| family.accepts(a))
            .collect();

        if addrs.is_empty() {
            return Err(XrdError::new(ErrorKind::ConnectionError));
        }
        Ok(addrs)
    }
}

// ---------------------------------------------------------------------------
// Preference ordering
// ---------------------------------------------------------------------------

/// Partition `primary` against `preferred` for back-to-front consumption:
/// primary-only addresses first, then all preferred addresses.  With an
/// empty preferred set this is the identity.
pub fn order_with_preference(
    primary: Vec<SocketAddr>,
    preferred: &[SocketAddr],
) -> Vec<SocketAddr> {
    // ---
    let mut ordered: Vec<SocketAddr> = primary
        .iter()
        .filter(|a| !preferred.contains(a))
        .copied()
        .collect();
    ordered.extend_from_slice(preferred);
    ordered
}

// ---------------------------------------------------------------------------
// IPAuto collapse
// ---------------------------------------------------------------------------

/// Resolve `IPAuto` against the local stack: without dual-stack support it
/// collapses to whichever family the host can actually open sockets in.
/// Every other policy passes through unchanged.
pub fn collapse_auto(requested: AddressType) -> AddressType {
    // ---
    if requested != AddressType::IPAuto {
        return requested;
    }

    let has_v4 = Socket::new(Domain::IPV4, Type::STREAM, None).is_ok();
    let has_v6 = Socket::new(Domain::IPV6, Type::STREAM, None)
        .and_then(|s| {
            s.set_only_v6(false)?;
            Ok(s)
        })
        .is_ok();

    match (has_v4, has_v6) {
        (true, false) => AddressType::IPv4,
        (false, true) => AddressType::IPv6,
        _ => AddressType::IPAuto,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn preferred_addresses_go_last_so_they_are_tried_first() {
        // ---
        let primary = vec![addr("10.0.0.1:1094"), addr("10.0.0.2:1094"), addr("10.0.0.3:1094")];
        let preferred = vec![addr("10.0.0.2:1094")];

        let ordered = order_with_preference(primary, &preferred);
        assert_eq!(
            ordered,
            vec![addr("10.0.0.1:1094"), addr("10.0.0.3:1094"), addr("10.0.0.2:1094")]
        );
        // Back-to-front consumption pops the preferred address first.
        assert_eq!(ordered.last(), Some(&addr("10.0.0.2:1094")));
    }

    #[test]
    fn empty_preference_is_identity() {
        // ---
        let primary = vec![addr("10.0.0.1:1094"), addr("10.0.0.2:1094")];
        assert_eq!(order_with_preference(primary.clone(), &[]), primary);
    }

    #[test]
    fn subset_preference_is_a_permutation() {
        // ---
        let primary = vec![addr("10.0.0.1:1094"), addr("10.0.0.2:1094"), addr("10.0.0.3:1094")];
        let preferred = vec![addr("10.0.0.3:1094"), addr("10.0.0.1:1094")];

        let mut ordered = order_with_preference(primary.clone(), &preferred);
        let mut expected = primary;
        ordered.sort();
        expected.sort();
        assert_eq!(ordered, expected);
    }

    #[test]
    fn loopback_resolves_with_family_filter() {
        // ---
        let url: XrdUrl = "root://127.0.0.1:1094".parse().unwrap();
        let addrs = SystemResolver.resolve(&url, AddressType::IPv4).unwrap();
        assert!(addrs.iter().all(SocketAddr::is_ipv4));

        assert!(SystemResolver.resolve(&url, AddressType::IPv6).is_err());
    }

    #[test]
    fn collapse_leaves_explicit_stacks_alone() {
        // ---
        assert_eq!(collapse_auto(AddressType::IPv4), AddressType::IPv4);
        assert_eq!(collapse_auto(AddressType::IPAll), AddressType::IPAll);

        // Whatever the host supports, the result is a concrete policy.
        let collapsed = collapse_auto(AddressType::IPAuto);
        assert!(matches!(
            collapsed,
            AddressType::IPAuto | AddressType::IPv4 | AddressType::IPv6
        ));
    }
}
