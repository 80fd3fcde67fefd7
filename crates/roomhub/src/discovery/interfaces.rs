// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IPv4 interface enumeration for broadcast discovery.

use std::io;
use std::net::Ipv4Addr;

/// One IPv4 address assigned to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Directed broadcast address derived from address and netmask.
    pub broadcast: Ipv4Addr,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let broadcast = Ipv4Addr::from(u32::from(address) | !u32::from(netmask));
        Self {
            name: name.into(),
            address,
            netmask,
            broadcast,
        }
    }

    /// Same address, netmask and broadcast. A binding is recreated otherwise.
    pub fn same_addressing(&self, other: &NetworkInterface) -> bool {
        self.address == other.address
            && self.netmask == other.netmask
            && self.broadcast == other.broadcast
    }
}

/// Interface allow-list. Empty accepts every interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceFilter {
    allow: Vec<String>,
}

impl InterfaceFilter {
    /// Accept all interfaces.
    pub fn all() -> Self {
        Self::default()
    }

    /// Accept only the named interfaces.
    pub fn only(names: Vec<String>) -> Self {
        Self { allow: names }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.allow.is_empty() || self.allow.iter().any(|allowed| allowed == name)
    }
}

/// Enumerate IPv4 interfaces accepted by `filter`.
///
/// An interface with several IPv4 addresses keeps the last one reported.
#[cfg(unix)]
pub fn enumerate_ipv4(filter: &InterfaceFilter) -> io::Result<Vec<NetworkInterface>> {
    use std::ffi::CStr;

    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY:
    // - `ifaddrs` is a valid pointer to a null pointer, which getifaddrs will populate
    // - The returned list is freed with freeifaddrs before returning
    let ret = unsafe { libc::getifaddrs(&mut ifaddrs) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut found: Vec<NetworkInterface> = Vec::new();
    let mut ifa = ifaddrs;
    while !ifa.is_null() {
        // SAFETY:
        // - `ifa` is checked to be non-null in the while condition
        // - The structure remains valid until freeifaddrs is called
        let entry = unsafe { &*ifa };
        ifa = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_netmask.is_null() {
            continue;
        }

        // SAFETY: `ifa_addr` is non-null and points to a sockaddr owned by the list
        let family = unsafe { (*entry.ifa_addr).sa_family } as i32;
        if family != libc::AF_INET {
            continue;
        }

        // SAFETY:
        // - `entry.ifa_name` is guaranteed non-null and NUL-terminated by getifaddrs
        // - The string is copied into an owned String immediately
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        if !filter.matches(&name) {
            continue;
        }

        // SAFETY:
        // - sa_family == AF_INET guarantees both sockaddrs are sockaddr_in
        // - Both pointers were checked non-null above
        let (address, netmask) = unsafe {
            let addr = &*(entry.ifa_addr as *const libc::sockaddr_in);
            let mask = &*(entry.ifa_netmask as *const libc::sockaddr_in);
            (
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                Ipv4Addr::from(u32::from_be(mask.sin_addr.s_addr)),
            )
        };

        let iface = NetworkInterface::new(name, address, netmask);
        match found.iter_mut().find(|existing| existing.name == iface.name) {
            Some(existing) => *existing = iface,
            None => found.push(iface),
        }
    }

    // SAFETY: `ifaddrs` came from a successful getifaddrs call and is freed once
    unsafe { libc::freeifaddrs(ifaddrs) };

    Ok(found)
}

#[cfg(not(unix))]
pub fn enumerate_ipv4(_filter: &InterfaceFilter) -> io::Result<Vec<NetworkInterface>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface enumeration requires getifaddrs",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_from_netmask() {
        let iface = NetworkInterface::new(
            "eth0",
            Ipv4Addr::new(192, 168, 1, 20),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        assert_eq!(iface.broadcast, Ipv4Addr::new(192, 168, 1, 255));

        let wide = NetworkInterface::new("lo", Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(wide.broadcast, Ipv4Addr::new(127, 255, 255, 255));
    }

    #[test]
    fn test_same_addressing() {
        let a = NetworkInterface::new("eth0", Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(255, 0, 0, 0));
        let b = NetworkInterface::new("eth0", Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(255, 0, 0, 0));
        assert!(a.same_addressing(&a.clone()));
        assert!(!a.same_addressing(&b));
    }

    #[test]
    fn test_filter() {
        assert!(InterfaceFilter::all().matches("anything"));

        let filter = InterfaceFilter::only(vec!["eth0".into(), "wlan0".into()]);
        assert!(filter.matches("eth0"));
        assert!(!filter.matches("eth1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_enumerate_respects_filter() {
        let none = InterfaceFilter::only(vec!["roomhub-test-missing0".into()]);
        assert!(enumerate_ipv4(&none).unwrap().is_empty());

        for iface in enumerate_ipv4(&InterfaceFilter::all()).unwrap() {
            assert!(!iface.name.is_empty());
        }
    }
}
