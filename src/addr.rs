//! Socket address value types.
//!
//! An [`Address`] is a closed, two-variant tagged union instead of the
//! inheritance-plus-downcast hierarchy the original tool used: the family tag
//! and the payload can never disagree, and equality never needs a runtime
//! type test.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{ProxyError, Result};

/// An IPv4 or IPv6 socket address.
///
/// `flowinfo` and `scope_id` are carried for IPv6 addresses but are not part
/// of logical identity: [`Address::eq`] ignores them, matching the original
/// design's definition of "same address".
#[derive(Debug, Clone, Copy)]
pub enum Address {
    V4 { addr: Ipv4Addr, port: u16 },
    V6 {
        addr: Ipv6Addr,
        port: u16,
        flowinfo: u32,
        scope_id: u32,
    },
}

impl Address {
    /// Build an [`Address`] from a raw, already-populated `sockaddr_storage`,
    /// as returned by `accept()`/`getsockname()`/`getpeername()`.
    pub fn from_raw(storage: &libc::sockaddr_storage) -> Result<Address> {
        match storage.ss_family as i32 {
            libc::AF_INET => {
                let sa: &libc::sockaddr_in =
                    unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let addr = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
                let port = u16::from_be(sa.sin_port);
                Ok(Address::V4 { addr, port })
            }
            libc::AF_INET6 => {
                let sa: &libc::sockaddr_in6 =
                    unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let addr = Ipv6Addr::from(sa.sin6_addr.s6_addr);
                let port = u16::from_be(sa.sin6_port);
                Ok(Address::V6 {
                    addr,
                    port,
                    flowinfo: u32::from_be(sa.sin6_flowinfo),
                    scope_id: sa.sin6_scope_id,
                })
            }
            _ => Err(ProxyError::InvalidAddress(format!(
                "unknown address family {}",
                storage.ss_family
            ))),
        }
    }

    /// Translate a literal `host:port` pair into an [`Address`] without
    /// performing any name lookup. `host` must look unambiguously like an
    /// IPv4 address (contains `.`) or an IPv6 address (contains `:`); any
    /// other shape is rejected.
    pub fn translate(host: &str, port: u16) -> Result<Address> {
        let looks_v4 = host.contains('.');
        let looks_v6 = host.contains(':');
        if looks_v4 == looks_v6 {
            return Err(ProxyError::InvalidAddress(format!(
                "\"{host}\" does not look like an IP address"
            )));
        }
        if looks_v4 {
            let addr: Ipv4Addr = host
                .parse()
                .map_err(|_| ProxyError::InvalidAddress(format!("\"{host}\" is not an IPv4 address")))?;
            Ok(Address::V4 { addr, port })
        } else {
            let addr: Ipv6Addr = host
                .parse()
                .map_err(|_| ProxyError::InvalidAddress(format!("\"{host}\" is not an IPv6 address")))?;
            Ok(Address::V6 {
                addr,
                port,
                flowinfo: 0,
                scope_id: 0,
            })
        }
    }

    /// Parse a `host:port` token, where `host` and/or `port` may be wrapped
    /// in brackets (`[host]:port`, `host:[port]`, `[host]:[port]`) to force
    /// `translate`-style literal parsing instead of going through
    /// [`Address::resolve`].
    pub fn parse_bind_spec(spec: &str) -> Result<Address> {
        let (host, port) = split_host_port(spec)?;
        let (host_literal, host_text) = unwrap_brackets(host);
        let (port_literal, port_text) = unwrap_brackets(port);

        if host_literal || port_literal {
            let port: u16 = port_text
                .parse()
                .map_err(|_| ProxyError::InvalidAddress(format!("\"{spec}\" has an invalid port")))?;
            return Address::translate(host_text, port);
        }

        let mut candidates = Address::resolve(host_text, port_text, None, None, None, false)?;
        if candidates.len() != 1 {
            return Err(ProxyError::ResolutionFailure {
                host: host_text.to_string(),
                service: port_text.to_string(),
                reason: format!("expected exactly one address, got {}", candidates.len()),
            });
        }
        Ok(candidates.remove(0))
    }

    /// Resolve a `(host, service)` pair through the OS resolver.
    ///
    /// `family` / `socktype` / `protocol` restrict the candidates the same
    /// way they would in a raw `getaddrinfo()` hints struct; `None` means
    /// "don't care". Bracketed host or service tokens bypass lookup for
    /// that component (`AI_NUMERICHOST` / `AI_NUMERICSERV`).
    pub fn resolve(
        host: &str,
        service: &str,
        family: Option<i32>,
        socktype: Option<i32>,
        protocol: Option<i32>,
        v4_mapped: bool,
    ) -> Result<Vec<Address>> {
        use std::ffi::CString;
        use std::ptr;

        let (host_literal, host_text) = unwrap_brackets(host);
        let (service_literal, service_text) = unwrap_brackets(service);

        let c_host = CString::new(host_text)
            .map_err(|_| ProxyError::InvalidAddress(format!("\"{host}\" contains a NUL byte")))?;
        let c_service = CString::new(service_text)
            .map_err(|_| ProxyError::InvalidAddress(format!("\"{service}\" contains a NUL byte")))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = family.unwrap_or(libc::AF_UNSPEC);
        hints.ai_socktype = socktype.unwrap_or(0);
        hints.ai_protocol = protocol.unwrap_or(0);
        hints.ai_flags = libc::AI_ADDRCONFIG;
        if v4_mapped {
            hints.ai_flags |= libc::AI_V4MAPPED;
        }
        if host_literal {
            hints.ai_flags |= libc::AI_NUMERICHOST;
        }
        if service_literal {
            hints.ai_flags |= libc::AI_NUMERICSERV;
        }

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let rv = unsafe {
            libc::getaddrinfo(c_host.as_ptr(), c_service.as_ptr(), &hints, &mut res)
        };
        if rv != 0 {
            let reason = unsafe {
                std::ffi::CStr::from_ptr(libc::gai_strerror(rv))
                    .to_string_lossy()
                    .into_owned()
            };
            return Err(ProxyError::ResolutionFailure {
                host: host.to_string(),
                service: service.to_string(),
                reason,
            });
        }

        let mut out = Vec::new();
        let mut p = res;
        while !p.is_null() {
            let ai = unsafe { &*p };
            let storage = unsafe {
                let mut storage: libc::sockaddr_storage = std::mem::zeroed();
                let len = (ai.ai_addrlen as usize).min(std::mem::size_of::<libc::sockaddr_storage>());
                std::ptr::copy_nonoverlapping(
                    ai.ai_addr as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    len,
                );
                storage
            };
            if let Ok(addr) = Address::from_raw(&storage) {
                out.push(addr);
            }
            p = ai.ai_next;
        }
        unsafe { libc::freeaddrinfo(res) };

        Ok(out)
    }

    /// The address family (`AF_INET` / `AF_INET6`).
    pub fn family(&self) -> i32 {
        match self {
            Address::V4 { .. } => libc::AF_INET,
            Address::V6 { .. } => libc::AF_INET6,
        }
    }

    /// The port number.
    pub fn port(&self) -> u16 {
        match self {
            Address::V4 { port, .. } => *port,
            Address::V6 { port, .. } => *port,
        }
    }

    /// `true` for the unspecified address (`0.0.0.0` / `::`).
    pub fn is_any(&self) -> bool {
        match self {
            Address::V4 { addr, .. } => *addr == Ipv4Addr::UNSPECIFIED,
            Address::V6 { addr, .. } => *addr == Ipv6Addr::UNSPECIFIED,
        }
    }

    /// `true` for a loopback address: any `127.0.0.0/8` address for IPv4,
    /// exactly `::1` for IPv6.
    pub fn is_loopback(&self) -> bool {
        match self {
            Address::V4 { addr, .. } => addr.is_loopback(),
            Address::V6 { addr, .. } => *addr == Ipv6Addr::LOCALHOST,
        }
    }

    /// Render as `"[<addr>]:<port>"`.
    pub fn string(&self) -> String {
        match self {
            Address::V4 { addr, port } => format!("[{addr}]:{port}"),
            Address::V6 { addr, port, .. } => format!("[{addr}]:{port}"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Address::V4 { addr: a, port: pa }, Address::V4 { addr: b, port: pb }) => {
                a == b && pa == pb
            }
            (
                Address::V6 { addr: a, port: pa, .. },
                Address::V6 { addr: b, port: pb, .. },
            ) => a == b && pa == pb,
            _ => false,
        }
    }
}

impl Eq for Address {}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Address::V4 {
                addr: *v4.ip(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Address::V6 {
                addr: *v6.ip(),
                port: v6.port(),
                flowinfo: v6.flowinfo(),
                scope_id: v6.scope_id(),
            },
        }
    }
}

impl From<Address> for SocketAddr {
    fn from(a: Address) -> Self {
        match a {
            Address::V4 { addr, port } => SocketAddr::V4(SocketAddrV4::new(addr, port)),
            Address::V6 {
                addr,
                port,
                flowinfo,
                scope_id,
            } => SocketAddr::V6(SocketAddrV6::new(addr, port, flowinfo, scope_id)),
        }
    }
}

/// Split `"host:port"` on the final `:` that isn't inside a `[...]` host
/// literal, so bracketed IPv6 hosts (`[::1]:5000`) parse correctly.
fn split_host_port(spec: &str) -> Result<(&str, &str)> {
    if let Some(rest) = spec.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let host = &spec[..close + 2]; // include the leading '[' and trailing ']'
            let after = &rest[close + 1..];
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| ProxyError::InvalidAddress(format!("\"{spec}\" is missing a port")))?;
            return Ok((host, port));
        }
    }
    spec.rsplit_once(':')
        .ok_or_else(|| ProxyError::InvalidAddress(format!("\"{spec}\" is missing a port")))
}

/// Strip a single layer of `[...]` bracketing from a token, reporting
/// whether it was present (which signals "treat literally, skip lookup").
fn unwrap_brackets(token: &str) -> (bool, &str) {
    if let Some(inner) = token.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        (true, inner)
    } else {
        (false, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_v4() {
        let a = Address::translate("127.0.0.1", 8080).unwrap();
        assert_eq!(a.string(), "[127.0.0.1]:8080");
        assert!(a.is_loopback());
    }

    #[test]
    fn translate_v6() {
        let a = Address::translate("::1", 8080).unwrap();
        assert_eq!(a.string(), "[::1]:8080");
        assert!(a.is_loopback());
    }

    #[test]
    fn translate_rejects_ambiguous_host() {
        assert!(Address::translate("not_an_address", 80).is_err());
        assert!(Address::translate("", 80).is_err());
    }

    #[test]
    fn equality_ignores_flow_and_scope() {
        let a = Address::V6 {
            addr: Ipv6Addr::LOCALHOST,
            port: 10,
            flowinfo: 1,
            scope_id: 2,
        };
        let b = Address::V6 {
            addr: Ipv6Addr::LOCALHOST,
            port: 10,
            flowinfo: 9,
            scope_id: 9,
        };
        assert_eq!(a, b);
    }

    #[test]
    fn v4_any_and_loopback() {
        let any = Address::translate("0.0.0.0", 0).unwrap();
        assert!(any.is_any());
        assert!(!any.is_loopback());

        let lo = Address::translate("127.5.5.5", 0).unwrap();
        assert!(lo.is_loopback());
    }

    #[test]
    fn parse_bind_spec_literal_bracket_skips_resolution() {
        let a = Address::parse_bind_spec("[127.0.0.1]:9000").unwrap();
        assert_eq!(a, Address::translate("127.0.0.1", 9000).unwrap());
    }

    #[test]
    fn parse_bind_spec_rejects_garbage() {
        assert!(Address::parse_bind_spec("not_an_address").is_err());
    }
}
