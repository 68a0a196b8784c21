//! SOCKS5 errors

use std::io::{self, ErrorKind};

use super::Reply;

/// SOCKS5 protocol error
///
/// Codec failures, negotiation failures and one variant for every reply code a proxy may answer with.
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("socks5 negotiation timed out")]
    Timeout,

    #[error("unsupported socks version {0:#x}")]
    UnsupportedSocksVersion(u8),
    #[error("address type {0:#x} not supported")]
    UnsupportedAddressType(u8),
    #[error("address domain name must be UTF-8 encoding")]
    AddressDomainInvalidEncoding,
    #[error("address domain name is {0} bytes, at most 255 allowed")]
    DomainNameTooLong(usize),
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("unsupported username/password authentication version {0:#x}")]
    UnsupportedPasswdAuthVersion(u8),
    #[error("username/password authentication invalid request")]
    PasswdAuthInvalidRequest,

    #[error("no authentication method offered")]
    NoMethodsOffered,
    #[error("{0} authentication methods offered, at most 255 fit in a greeting")]
    TooManyMethods(usize),
    #[error("username/password authentication offered without credentials")]
    MissingCredentials,
    #[error("{0:?} requires a destination address")]
    MissingDestination(super::Command),
    #[error("proxy accepted none of the offered authentication methods")]
    AuthRejected,
    #[error("proxy chose authentication method {0:#x} which was not offered")]
    UnexpectedAuthMethod(u8),
    #[error("username/password rejected by proxy, status {0:#x}")]
    PasswdAuthRejected(u8),

    #[error("general SOCKS server failure")]
    GeneralFailure,
    #[error("connection not allowed by ruleset")]
    RuleDenied,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("TTL expired")]
    TtlExpired,
    #[error("command not supported")]
    CommandNotSupported,
    #[error("address type not supported")]
    AddressTypeNotSupported,
    #[error("unknown reply code {0:#x}")]
    Unknown(u8),
}

impl From<Socks5Error> for io::Error {
    fn from(err: Socks5Error) -> io::Error {
        match err {
            Socks5Error::IoError(err) => err,
            Socks5Error::Timeout => io::Error::new(ErrorKind::TimedOut, err),
            Socks5Error::ConnectionRefused => io::Error::new(ErrorKind::ConnectionRefused, err),
            e => io::Error::other(e),
        }
    }
}

impl Socks5Error {
    /// Maps a reply code received from a proxy, `None` for `Succeeded`
    #[rustfmt::skip]
    pub fn from_reply(reply: Reply) -> Option<Socks5Error> {
        let err = match reply {
            Reply::Succeeded               => return None,
            Reply::GeneralFailure          => Socks5Error::GeneralFailure,
            Reply::ConnectionNotAllowed    => Socks5Error::RuleDenied,
            Reply::NetworkUnreachable      => Socks5Error::NetworkUnreachable,
            Reply::HostUnreachable         => Socks5Error::HostUnreachable,
            Reply::ConnectionRefused       => Socks5Error::ConnectionRefused,
            Reply::TtlExpired              => Socks5Error::TtlExpired,
            Reply::CommandNotSupported     => Socks5Error::CommandNotSupported,
            Reply::AddressTypeNotSupported => Socks5Error::AddressTypeNotSupported,
            Reply::OtherReply(code)        => Socks5Error::Unknown(code),
        };
        Some(err)
    }

    /// Convert to `Reply` for responding
    pub fn as_reply(&self) -> Reply {
        match *self {
            Socks5Error::IoError(ref err) => match err.kind() {
                ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                ErrorKind::TimedOut => Reply::TtlExpired,
                _ => Reply::GeneralFailure,
            },
            Socks5Error::Timeout => Reply::TtlExpired,
            Socks5Error::UnsupportedAddressType(..) | Socks5Error::AddressTypeNotSupported => {
                Reply::AddressTypeNotSupported
            }
            Socks5Error::UnsupportedCommand(..) | Socks5Error::CommandNotSupported => Reply::CommandNotSupported,
            Socks5Error::RuleDenied => Reply::ConnectionNotAllowed,
            Socks5Error::NetworkUnreachable => Reply::NetworkUnreachable,
            Socks5Error::HostUnreachable => Reply::HostUnreachable,
            Socks5Error::ConnectionRefused => Reply::ConnectionRefused,
            Socks5Error::TtlExpired => Reply::TtlExpired,
            Socks5Error::Unknown(code) => Reply::OtherReply(code),
            _ => Reply::GeneralFailure,
        }
    }

    /// Summary kept by a failed handshake
    pub fn reason(&self) -> FailReason {
        match *self {
            Socks5Error::IoError(ref err) if err.kind() == ErrorKind::UnexpectedEof => FailReason::ShortRead,
            Socks5Error::IoError(..) => FailReason::Transport,
            Socks5Error::Timeout => FailReason::Timeout,
            Socks5Error::UnsupportedSocksVersion(..)
            | Socks5Error::UnsupportedPasswdAuthVersion(..)
            | Socks5Error::PasswdAuthInvalidRequest
            | Socks5Error::UnexpectedAuthMethod(..)
            | Socks5Error::UnsupportedCommand(..)
            | Socks5Error::AddressDomainInvalidEncoding => FailReason::UnexpectedByte,
            Socks5Error::UnsupportedAddressType(..) => FailReason::UnsupportedAddressType,
            Socks5Error::DomainNameTooLong(..)
            | Socks5Error::NoMethodsOffered
            | Socks5Error::TooManyMethods(..)
            | Socks5Error::MissingCredentials
            | Socks5Error::MissingDestination(..) => FailReason::InvalidOption,
            Socks5Error::AuthRejected | Socks5Error::PasswdAuthRejected(..) => FailReason::AuthRejected,
            _ => FailReason::Reply(self.as_reply()),
        }
    }
}

/// Why a handshake ended in `HandshakeState::Failed`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// The caller supplied an unusable `Socks5Option`
    InvalidOption,
    /// The stream ended before a complete message arrived
    ShortRead,
    /// The transport failed
    Transport,
    /// The proxy did not answer in time
    Timeout,
    /// A version, method or status byte had an unexpected value
    UnexpectedByte,
    /// The proxy answered with an address type outside IPv4, IPv6 and domain name
    UnsupportedAddressType,
    /// No acceptable method, or credentials refused
    AuthRejected,
    /// The proxy refused the command with this reply
    Reply(Reply),
}
