//! SOCKS5 server side negotiation

use std::{collections::HashMap, str, time::Duration};

use log::{error, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};

use super::{
    Address, HandshakeRequest, HandshakeResponse, PasswdAuthRequest, PasswdAuthResponse, Reply, Socks5Error,
    TcpRequestHeader, TcpResponseHeader, consts,
};

/// Username/password table for RFC1929 authentication
#[derive(Clone, Debug, Default)]
pub struct PasswdAuth {
    users: HashMap<String, String>,
}

impl PasswdAuth {
    pub fn new() -> PasswdAuth {
        PasswdAuth::default()
    }

    pub fn add_user<U, P>(&mut self, uname: U, passwd: P)
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.users.insert(uname.into(), passwd.into());
    }

    pub fn check_user(&self, uname: &str, passwd: &str) -> bool {
        match self.users.get(uname) {
            Some(p) => p == passwd,
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Server side of the negotiation
///
/// When any user is configured, username/password is the only accepted method. Otherwise only "no authentication" is.
#[derive(Clone, Debug, Default)]
pub struct Socks5Acceptor {
    auth: PasswdAuth,
}

impl Socks5Acceptor {
    pub fn new(auth: PasswdAuth) -> Socks5Acceptor {
        Socks5Acceptor { auth }
    }

    fn auth_required(&self) -> bool {
        !self.auth.is_empty()
    }

    /// Runs method selection, authentication and reads the request header, all bounded by `timeout`
    ///
    /// The caller opens the backend and answers with [`send_reply`]. A request header that fails to decode is
    /// answered here with the matching reply.
    pub async fn accept<S>(&self, stream: &mut S, timeout: Duration) -> Result<TcpRequestHeader, Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match time::timeout(timeout, self.accept_inner(stream)).await {
            Ok(r) => r,
            Err(..) => Err(Socks5Error::Timeout),
        }
    }

    async fn accept_inner<S>(&self, stream: &mut S) -> Result<TcpRequestHeader, Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let greeting = HandshakeRequest::read_from(stream).await?;
        trace!("socks5 {:?}", greeting);
        self.check_auth(stream, &greeting).await?;

        match TcpRequestHeader::read_from(stream).await {
            Ok(header) => {
                trace!("socks5 {:?}", header);
                Ok(header)
            }
            Err(err) => {
                let reply = err.as_reply();
                let _ = send_reply(stream, reply, &Address::unspecified()).await;
                Err(err)
            }
        }
    }

    async fn check_auth<S>(&self, stream: &mut S, greeting: &HandshakeRequest) -> Result<(), Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let method = if self.auth_required() {
            consts::SOCKS5_AUTH_METHOD_PASSWORD
        } else {
            consts::SOCKS5_AUTH_METHOD_NONE
        };

        if !greeting.methods.contains(&method) {
            let resp = HandshakeResponse::new(consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE);
            trace!("reply handshake {:?}", resp);
            resp.write_to(stream).await?;
            return Err(Socks5Error::AuthRejected);
        }

        let resp = HandshakeResponse::new(method);
        trace!("reply handshake {:?}", resp);
        resp.write_to(stream).await?;

        if method == consts::SOCKS5_AUTH_METHOD_PASSWORD {
            self.check_auth_password(stream).await?;
        }
        Ok(())
    }

    async fn check_auth_password<S>(&self, stream: &mut S) -> Result<(), Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let req = match PasswdAuthRequest::read_from(stream).await {
            Ok(r) => r,
            Err(err) => {
                let rsp = PasswdAuthResponse::new(consts::SOCKS5_PASSWD_AUTH_FAILED);
                let _ = rsp.write_to(stream).await;
                return Err(err);
            }
        };

        let accepted = match (str::from_utf8(&req.uname), str::from_utf8(&req.passwd)) {
            (Ok(uname), Ok(passwd)) => {
                let ok = self.auth.check_user(uname, passwd);
                if ok {
                    trace!("socks5 authenticated with Username/Password method, user: {}", uname);
                } else {
                    error!("socks5 rejected Username/Password user: {}", uname);
                }
                ok
            }
            _ => {
                error!("socks5 Username/Password request contains invalid characters");
                false
            }
        };

        if accepted {
            PasswdAuthResponse::new(consts::SOCKS5_PASSWD_AUTH_SUCCEEDED)
                .write_to(stream)
                .await?;
            Ok(())
        } else {
            PasswdAuthResponse::new(consts::SOCKS5_PASSWD_AUTH_FAILED)
                .write_to(stream)
                .await?;
            Err(Socks5Error::PasswdAuthRejected(consts::SOCKS5_PASSWD_AUTH_FAILED))
        }
    }
}

/// Writes the command reply with `bound` as BND.ADDR / BND.PORT
pub async fn send_reply<S>(stream: &mut S, reply: Reply, bound: &Address) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    bound.check()?;
    let header = TcpResponseHeader::new(reply, bound.clone());
    trace!("socks5 reply {:?}", header);
    header.write_to(stream).await?;
    Ok(())
}
