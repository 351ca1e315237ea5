use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::NetError;

/// An IPv4 address as a 32-bit value
///
/// Parsing only accepts the canonical dotted-quad form (no leading zeros, no
/// whitespace), so `parse(format(a)) == a` and `format(parse(s)) == s` for
/// every accepted `s`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u32);

impl Address {
    /// Build an address from its numeric value
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Numeric value of the address
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Last octet of the dotted-quad
    pub const fn host_octet(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip))
    }
}

impl From<Address> for Ipv4Addr {
    fn from(addr: Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            (self.0 >> 24) & 0xFF,
            (self.0 >> 16) & 0xFF,
            (self.0 >> 8) & 0xFF,
            self.0 & 0xFF
        )
    }
}

impl FromStr for Address {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_ip_address(s)
    }
}

/// Parse a canonical dotted-quad into an [`Address`]
pub fn parse_ip_address(text: &str) -> Result<Address, NetError> {
    let invalid = || NetError::InvalidFormat(text.to_string());

    let mut value = 0u32;
    let mut octets = 0;
    for part in text.split('.') {
        octets += 1;
        if octets > 4 {
            return Err(invalid());
        }
        value = (value << 8) | u32::from(parse_octet(part).ok_or_else(invalid)?);
    }

    if octets != 4 {
        return Err(invalid());
    }
    Ok(Address(value))
}

/// Render an address in canonical dotted-quad form
pub fn format_ip_address(addr: Address) -> String {
    addr.to_string()
}

fn parse_octet(part: &str) -> Option<u8> {
    if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // "0" is fine, "00" and "010" are not canonical
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse::<u8>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let addr = parse_ip_address("10.0.0.140").unwrap();
        assert_eq!(addr.value(), 0x0A00_008C);
        assert_eq!(format_ip_address(addr), "10.0.0.140");
        assert_eq!(addr.host_octet(), 140);
    }

    #[test]
    fn test_round_trip_extremes() {
        for text in ["0.0.0.0", "255.255.255.255", "192.168.1.1", "172.16.254.3"] {
            let addr: Address = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
        }
        for value in [0u32, 1, 0x7F00_0001, 0xFFFF_FFFE, u32::MAX] {
            let addr = Address::new(value);
            assert_eq!(parse_ip_address(&format_ip_address(addr)).unwrap(), addr);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for text in [
            "", "10.0.0", "10.0.0.0.1", "10.0.0.256", "10..0.1", "a.b.c.d", "10.0.0.-1",
            " 10.0.0.1", "10.0.0.1 ", "010.0.0.1", "10.0.0.1/24", "1000.0.0.1",
        ] {
            assert!(
                matches!(parse_ip_address(text), Err(NetError::InvalidFormat(_))),
                "expected {text:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_ipv4addr_conversion() {
        let ip = Ipv4Addr::new(10, 1, 2, 3);
        let addr = Address::from(ip);
        assert_eq!(addr.to_string(), "10.1.2.3");
        assert_eq!(Ipv4Addr::from(addr), ip);
    }
}
