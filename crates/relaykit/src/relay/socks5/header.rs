//! SOCKS5 negotiation messages

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Address, Command, Reply, Socks5Error, consts};

macro_rules! impl_write_to {
    ($ty:ty) => {
        impl $ty {
            /// Write to a writer
            pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
            where
                W: AsyncWrite + Unpin,
            {
                let mut buf = BytesMut::with_capacity(self.serialized_len());
                self.write_to_buf(&mut buf);
                w.write_all(&buf).await
            }
        }
    };
}

async fn read_version<R>(r: &mut R) -> Result<(), Socks5Error>
where
    R: AsyncRead + Unpin,
{
    let ver = r.read_u8().await?;
    if ver != consts::SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedSocksVersion(ver));
    }
    Ok(())
}

/// SOCKS5 handshake request packet
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 5  |    1     | 1 to 255 |
/// +----+----------+----------|
/// ```
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub fn new(methods: Vec<u8>) -> HandshakeRequest {
        HandshakeRequest { methods }
    }

    /// Read from a reader
    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeRequest, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        read_version(r).await?;

        let nmet = r.read_u8().await?;
        let mut methods = vec![0u8; nmet as usize];
        r.read_exact(&mut methods).await?;

        Ok(HandshakeRequest { methods })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.methods.len() as u8]);
        buf.put_slice(&self.methods);
    }

    pub fn serialized_len(&self) -> usize {
        2 + self.methods.len()
    }
}

impl_write_to!(HandshakeRequest);

/// SOCKS5 handshake response packet
///
/// ```plain
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Clone, Debug, Copy)]
pub struct HandshakeResponse {
    pub chosen_method: u8,
}

impl HandshakeResponse {
    pub fn new(cm: u8) -> HandshakeResponse {
        HandshakeResponse { chosen_method: cm }
    }

    /// Read from a reader
    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeResponse, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        read_version(r).await?;
        let chosen_method = r.read_u8().await?;
        Ok(HandshakeResponse { chosen_method })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.chosen_method]);
    }

    pub fn serialized_len(&self) -> usize {
        2
    }
}

impl_write_to!(HandshakeResponse);

/// Username/Password Authentication Initial Negotiation
///
/// https://datatracker.ietf.org/doc/html/rfc1929
///
/// ```plain
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Clone)]
pub struct PasswdAuthRequest {
    pub uname: Vec<u8>,
    pub passwd: Vec<u8>,
}

impl PasswdAuthRequest {
    /// Create a Username/Password Authentication Request
    ///
    /// Both fields must be 1 to 255 bytes long
    pub fn new<U, P>(uname: U, passwd: P) -> Result<PasswdAuthRequest, Socks5Error>
    where
        U: Into<Vec<u8>>,
        P: Into<Vec<u8>>,
    {
        let uname = uname.into();
        let passwd = passwd.into();

        let valid = |v: &[u8]| !v.is_empty() && v.len() <= u8::MAX as usize;
        if !valid(uname.as_slice()) || !valid(passwd.as_slice()) {
            return Err(Socks5Error::PasswdAuthInvalidRequest);
        }

        Ok(PasswdAuthRequest { uname, passwd })
    }

    /// Read from a reader
    pub async fn read_from<R>(r: &mut R) -> Result<PasswdAuthRequest, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let ver = r.read_u8().await?;
        if ver != consts::SOCKS5_PASSWD_AUTH_VERSION {
            return Err(Socks5Error::UnsupportedPasswdAuthVersion(ver));
        }

        let ulen = r.read_u8().await? as usize;
        if ulen == 0 {
            return Err(Socks5Error::PasswdAuthInvalidRequest);
        }
        let mut uname = vec![0u8; ulen];
        r.read_exact(&mut uname).await?;

        let plen = r.read_u8().await? as usize;
        if plen == 0 {
            return Err(Socks5Error::PasswdAuthInvalidRequest);
        }
        let mut passwd = vec![0u8; plen];
        r.read_exact(&mut passwd).await?;

        Ok(PasswdAuthRequest { uname, passwd })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(consts::SOCKS5_PASSWD_AUTH_VERSION);
        buf.put_u8(self.uname.len() as u8);
        buf.put_slice(&self.uname);
        buf.put_u8(self.passwd.len() as u8);
        buf.put_slice(&self.passwd);
    }

    pub fn serialized_len(&self) -> usize {
        1 + 1 + self.uname.len() + 1 + self.passwd.len()
    }
}

impl_write_to!(PasswdAuthRequest);

/// Username/Password Authentication status
///
/// ```plain
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Clone, Copy, Debug)]
pub struct PasswdAuthResponse {
    pub status: u8,
}

impl PasswdAuthResponse {
    pub fn new(status: u8) -> PasswdAuthResponse {
        PasswdAuthResponse { status }
    }

    /// Read from a reader
    pub async fn read_from<R>(r: &mut R) -> Result<PasswdAuthResponse, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;

        if buf[0] != consts::SOCKS5_PASSWD_AUTH_VERSION {
            return Err(Socks5Error::UnsupportedPasswdAuthVersion(buf[0]));
        }

        Ok(PasswdAuthResponse { status: buf[1] })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_PASSWD_AUTH_VERSION, self.status]);
    }

    pub fn serialized_len(&self) -> usize {
        2
    }
}

impl_write_to!(PasswdAuthResponse);

/// TCP request header after handshake
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    pub fn new(command: Command, address: Address) -> TcpRequestHeader {
        TcpRequestHeader { command, address }
    }

    /// Read from a reader
    pub async fn read_from<R>(r: &mut R) -> Result<TcpRequestHeader, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        read_version(r).await?;

        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;

        let command = Command::from_u8(buf[0]).ok_or(Socks5Error::UnsupportedCommand(buf[0]))?;
        let address = Address::read_from(r).await?;
        Ok(TcpRequestHeader { command, address })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.command.as_u8(), 0x00]);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}

impl_write_to!(TcpRequestHeader);

/// TCP response header
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> TcpResponseHeader {
        TcpResponseHeader { reply, address }
    }

    /// Read from a reader
    pub async fn read_from<R>(r: &mut R) -> Result<TcpResponseHeader, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        read_version(r).await?;

        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;

        let address = Address::read_from(r).await?;
        Ok(TcpResponseHeader {
            reply: Reply::from_u8(buf[0]),
            address,
        })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[consts::SOCKS5_VERSION, self.reply.as_u8(), 0x00]);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}

impl_write_to!(TcpResponseHeader);
