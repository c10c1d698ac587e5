//! Utilities used across the collector.

pub mod address;
pub mod constants;
pub mod conversions;
pub mod logger;
pub mod memory;
pub mod options;
pub mod region;
#[cfg(test)]
pub mod test_util;

pub use self::address::Address;
