//! IP allow/deny list checked at accept time.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rule {
    allow: bool,
    network: IpAddr,
    prefix: u8,
}

impl Rule {
    fn matches(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            (IpAddr::V4(_), IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(v4) => self.matches(IpAddr::V4(v4)),
                None => false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) }
}

/// Ordered `+`/`-` CIDR rules.
///
/// An empty list admits everyone. Once any rule exists the default is deny
/// and the last matching rule decides.
#[derive(Debug, Clone, Default)]
pub struct AccessControlList {
    rules: Vec<Rule>,
}

impl AccessControlList {
    /// Parse `+10.0.0.0/8,-10.1.0.0/16,+::1` style lists.
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut rules = Vec::new();
        for entry in crate::config::split_list(value) {
            let allow = match entry.as_bytes()[0] {
                b'+' => true,
                b'-' => false,
                _ => return Err(format!("{entry}: must start with + or -")),
            };
            let spec = &entry[1..];
            let (addr, prefix) = match spec.split_once('/') {
                Some((addr, bits)) => (addr, Some(bits)),
                None => (spec, None),
            };
            let network: IpAddr = addr
                .parse()
                .map_err(|_| format!("{entry}: bad address"))?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            let prefix = match prefix {
                Some(bits) => bits
                    .parse::<u8>()
                    .ok()
                    .filter(|b| *b <= max)
                    .ok_or_else(|| format!("{entry}: bad prefix length"))?,
                None => max,
            };
            rules.push(Rule { allow, network, prefix });
        }
        Ok(Self { rules })
    }

    /// Whether a peer may connect.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(ip))
            .is_some_and(|rule| rule.allow)
    }

    /// True when no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_list_allows_everyone() {
        let acl = AccessControlList::parse("").unwrap();
        assert!(acl.allows(ip("8.8.8.8")));
    }

    #[test]
    fn default_deny_once_rules_exist() {
        let acl = AccessControlList::parse("+192.168.0.0/16").unwrap();
        assert!(acl.allows(ip("192.168.1.20")));
        assert!(!acl.allows(ip("10.0.0.1")));
    }

    #[test]
    fn last_match_wins() {
        let acl = AccessControlList::parse("+10.0.0.0/8,-10.1.0.0/16").unwrap();
        assert!(acl.allows(ip("10.2.3.4")));
        assert!(!acl.allows(ip("10.1.3.4")));
    }

    #[test]
    fn ipv6_and_mapped_addresses() {
        let acl = AccessControlList::parse("+::1,+127.0.0.1").unwrap();
        assert!(acl.allows(ip("::1")));
        assert!(acl.allows(ip("::ffff:127.0.0.1")));
        assert!(!acl.allows(ip("::2")));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(AccessControlList::parse("10.0.0.0/8").is_err());
        assert!(AccessControlList::parse("+10.0.0.0/33").is_err());
        assert!(AccessControlList::parse("+not-an-ip").is_err());
    }
}
