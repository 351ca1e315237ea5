//! IPv4 addressing for job networking
//!
//! Jobs live in an internal (pod) address space while consumers see them
//! through an external one. This module parses and formats addresses and CIDR
//! blocks, translates an address between two equally sized subnets, and keeps
//! the pool of external addresses that can be handed to jobs.

mod address;
mod cidr;
mod pool;

pub use address::{format_ip_address, parse_ip_address, Address};
pub use cidr::{is_safe_to_use, remap_address, validate_cidr, Subnet};
pub use pool::{Allocation, IpPool, PoolEntry, PoolStatus, MIN_POOL_PREFIX_LEN};

use thiserror::Error;

/// Errors from address parsing, remapping and pool management
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// The dotted-quad or the CIDR notation is malformed
    #[error("invalid address format: '{0}'")]
    InvalidFormat(String),

    /// The prefix length is numeric but outside [0, 32]
    #[error("invalid prefix length in '{0}': must be between 0 and 32")]
    InvalidPrefixLength(String),

    /// A remap source address is not inside the source subnet
    #[error("address {address} is not inside subnet {subnet}")]
    OutOfRange {
        /// The address being remapped
        address: String,
        /// The subnet it was expected to be in
        subnet: String,
    },

    /// Two subnets that must be the same size are not
    #[error("subnet {source_subnet} is not the same size as {dest_subnet}")]
    SizeMismatch {
        /// Source subnet of the remap
        source_subnet: String,
        /// Destination subnet of the remap
        dest_subnet: String,
    },

    /// A pool subnet is larger than the pool accepts
    #[error("refusing to use subnet {subnet}: prefix must be at least /{min_prefix}")]
    SubnetTooLarge {
        /// The rejected subnet
        subnet: String,
        /// Smallest prefix length the pool accepts
        min_prefix: u8,
    },

    /// A pool subnet overlaps one that is already registered
    #[error("subnet {subnet} overlaps existing pool subnet {existing}")]
    Overlap {
        /// The rejected subnet
        subnet: String,
        /// The subnet already in the pool
        existing: String,
    },

    /// No safe, unused address is left in the pool
    #[error("no addresses available in the pool")]
    Exhausted,
}
