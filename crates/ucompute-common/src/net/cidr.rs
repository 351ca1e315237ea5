use std::fmt;
use std::str::FromStr;

use super::address::parse_ip_address;
use super::{Address, NetError};

/// A validated IPv4 CIDR block
///
/// Only constructed through [`validate_cidr`], so `first <= last` and
/// `prefix_len <= 32` always hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subnet {
    first: Address,
    last: Address,
    prefix_len: u8,
}

impl Subnet {
    /// Network address of the block
    pub fn first(&self) -> Address {
        self.first
    }

    /// Broadcast address of the block
    pub fn last(&self) -> Address {
        self.last
    }

    /// Prefix length in bits
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of addresses in the block (2^32 for `/0`)
    pub fn size(&self) -> u64 {
        u64::from(self.last.value() - self.first.value()) + 1
    }

    /// Whether `addr` lies inside the block
    pub fn contains(&self, addr: Address) -> bool {
        self.first <= addr && addr <= self.last
    }

    /// Whether the two blocks share any address
    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    /// Address at `offset` from the start of the block, if inside it
    pub fn nth(&self, offset: u64) -> Option<Address> {
        if offset >= self.size() {
            return None;
        }
        // offset < size <= 2^32 - first, so this cannot overflow
        Some(Address::new(self.first.value() + offset as u32))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.first, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_cidr(s)
    }
}

/// Parse and validate `a.b.c.d/n`.
///
/// Host bits in the address are ignored: `10.0.0.140/26` yields the block
/// `10.0.0.128 - 10.0.0.191`.
pub fn validate_cidr(text: &str) -> Result<Subnet, NetError> {
    let (ip, prefix) = text
        .split_once('/')
        .ok_or_else(|| NetError::InvalidFormat(text.to_string()))?;

    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NetError::InvalidFormat(text.to_string()));
    }

    let ip = parse_ip_address(ip).map_err(|_| NetError::InvalidFormat(text.to_string()))?;

    let prefix_len = match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => p,
        _ => return Err(NetError::InvalidPrefixLength(text.to_string())),
    };

    let mask = prefix_mask(prefix_len);
    let first = ip.value() & mask;
    let last = first | !mask;

    Ok(Subnet {
        first: Address::new(first),
        last: Address::new(last),
        prefix_len,
    })
}

/// Translate `address` from `source` to the same offset within `dest`.
///
/// Both subnets must be the same size and `address` must lie in `source`.
pub fn remap_address(address: Address, source: &Subnet, dest: &Subnet) -> Result<Address, NetError> {
    if source.size() != dest.size() {
        return Err(NetError::SizeMismatch {
            source_subnet: source.to_string(),
            dest_subnet: dest.to_string(),
        });
    }

    if !source.contains(address) {
        return Err(NetError::OutOfRange {
            address: address.to_string(),
            subnet: source.to_string(),
        });
    }

    let offset = address.value() - source.first.value();
    Ok(Address::new(dest.first.value() + offset))
}

/// Whether an address may be handed to a job.
///
/// Jobs are addressed in per-job /24 blocks where `.0` is the network address,
/// `.1` the gateway and `.255` the broadcast address.
pub fn is_safe_to_use(address: Address) -> bool {
    !matches!(address.host_octet(), 0 | 1 | 255)
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_validate_cidr_network_and_broadcast() {
        let subnet = validate_cidr("10.0.0.128/26").unwrap();
        assert_eq!(subnet.first().to_string(), "10.0.0.128");
        assert_eq!(subnet.last().to_string(), "10.0.0.191");
        assert_eq!(subnet.prefix_len(), 26);
        assert_eq!(subnet.size(), 64);

        let subnet = validate_cidr("192.168.10.77/24").unwrap();
        assert_eq!(subnet.first().to_string(), "192.168.10.0");
        assert_eq!(subnet.last().to_string(), "192.168.10.255");

        let subnet = validate_cidr("172.16.0.0/12").unwrap();
        assert_eq!(subnet.first().to_string(), "172.16.0.0");
        assert_eq!(subnet.last().to_string(), "172.31.255.255");
    }

    #[test]
    fn test_single_address_block() {
        let subnet = validate_cidr("172.18.255.1/32").unwrap();
        assert_eq!(subnet.first(), subnet.last());
        assert_eq!(subnet.first().to_string(), "172.18.255.1");
        assert_eq!(subnet.size(), 1);
    }

    #[test]
    fn test_whole_address_space() {
        let subnet = validate_cidr("10.1.2.3/0").unwrap();
        assert_eq!(subnet.first().to_string(), "0.0.0.0");
        assert_eq!(subnet.last().to_string(), "255.255.255.255");
        assert_eq!(subnet.size(), 1u64 << 32);
    }

    #[test]
    fn test_invalid_format() {
        for text in [
            "10.0.0/8", "256.0.0.1/8", "10.0.0.1", "10.0.0.1/", "10.0.0.1/a", "/24",
            "10.0.0.1/-1", "10.0.0.1/24/1", "10.0.0.1 /24",
        ] {
            assert!(
                matches!(validate_cidr(text), Err(NetError::InvalidFormat(_))),
                "expected {text:?} to be InvalidFormat"
            );
        }
    }

    #[test]
    fn test_invalid_prefix_length() {
        for text in ["10.0.0.1/33", "10.0.0.1/99", "10.0.0.1/4294967296"] {
            assert!(
                matches!(validate_cidr(text), Err(NetError::InvalidPrefixLength(_))),
                "expected {text:?} to be InvalidPrefixLength"
            );
        }
    }

    #[test]
    fn test_display_is_normalized() {
        let subnet: Subnet = "10.0.0.140/26".parse().unwrap();
        assert_eq!(subnet.to_string(), "10.0.0.128/26");
    }

    #[test]
    fn test_remap_address() {
        let source = validate_cidr("10.0.0.128/26").unwrap();
        let dest = validate_cidr("20.0.0.128/26").unwrap();
        let remapped = remap_address(addr("10.0.0.140"), &source, &dest).unwrap();
        assert_eq!(remapped.to_string(), "20.0.0.140");
    }

    #[test]
    fn test_remap_preserves_offset_across_alignment() {
        let source = validate_cidr("10.0.0.0/24").unwrap();
        let dest = validate_cidr("192.168.5.0/24").unwrap();
        for host in [0u32, 2, 128, 255] {
            let a = Address::new(source.first().value() + host);
            let r = remap_address(a, &source, &dest).unwrap();
            assert_eq!(r.value(), dest.first().value() + host);
        }
    }

    #[test]
    fn test_remap_out_of_range() {
        let source = validate_cidr("10.0.0.128/26").unwrap();
        let dest = validate_cidr("20.0.0.128/26").unwrap();
        let err = remap_address(addr("10.0.0.200"), &source, &dest).unwrap_err();
        assert!(matches!(err, NetError::OutOfRange { .. }));
    }

    #[test]
    fn test_remap_size_mismatch() {
        let source = validate_cidr("10.0.0.0/24").unwrap();
        let dest = validate_cidr("20.0.0.0/25").unwrap();
        let err = remap_address(addr("10.0.0.1"), &source, &dest).unwrap_err();
        assert!(matches!(err, NetError::SizeMismatch { .. }));
    }

    #[test]
    fn test_is_safe_to_use() {
        assert!(!is_safe_to_use(addr("10.0.0.0")));
        assert!(!is_safe_to_use(addr("10.0.0.1")));
        assert!(!is_safe_to_use(addr("10.0.0.255")));
        for host in 2..=254u32 {
            let a = Address::new(addr("10.0.0.0").value() + host);
            assert!(is_safe_to_use(a), "{a} should be safe");
        }
    }

    #[test]
    fn test_unsafe_octets_in_every_block() {
        for third in [0u32, 7, 200, 255] {
            let base = addr("10.20.0.0").value() | (third << 8);
            for host in [0u32, 1, 255] {
                assert!(!is_safe_to_use(Address::new(base | host)));
            }
        }
    }

    #[test]
    fn test_overlaps_and_nth() {
        let a = validate_cidr("10.0.0.0/24").unwrap();
        let b = validate_cidr("10.0.0.128/25").unwrap();
        let c = validate_cidr("10.0.1.0/24").unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.nth(5).unwrap().to_string(), "10.0.0.5");
        assert_eq!(a.nth(256), None);
    }
}
