//! Proxy protocols

pub use self::socks5::Address;

pub mod socks5;
pub mod udprelay;
