use std::borrow::Cow;
use std::net::SocketAddr;

use http::HeaderName;
use http::Request;

use crate::error::ConfigError;

/// Peer address of the connection a request arrived on.
///
/// Hosts insert this as a request extension so that `$remote_addr` can be
/// resolved. With the `axum` feature, axum's `ConnectInfo<SocketAddr>` is
/// accepted as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// A request attribute reference, resolved per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Empty,
    /// `$remote_addr`: the client IP, without the port.
    RemoteAddr,
    /// `$http_<name>`: a request header, `_` read as `-`.
    Header(HeaderName),
    /// `$arg_<name>`: a raw query-string argument.
    Arg(String),
    /// `$host`
    Host,
    /// `$uri`: the request path.
    Uri,
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("remote address is not available")]
    NoRemoteAddr,

    #[error("header '{0}' is not valid UTF-8")]
    NotUtf8(HeaderName),
}

impl Expression {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let Some(variable) = raw.strip_prefix('$') else {
            return Ok(if raw.is_empty() {
                Self::Empty
            } else {
                Self::Literal(raw.to_string())
            });
        };

        let unknown = || ConfigError::UnknownVariable(raw.to_string());
        match variable {
            "remote_addr" => Ok(Self::RemoteAddr),
            "host" => Ok(Self::Host),
            "uri" => Ok(Self::Uri),
            _ => {
                if let Some(name) = variable.strip_prefix("http_")
                    && !name.is_empty()
                {
                    let name = name.replace('_', "-").to_ascii_lowercase();
                    HeaderName::from_bytes(name.as_bytes())
                        .map(Self::Header)
                        .map_err(|_| unknown())
                } else if let Some(name) = variable.strip_prefix("arg_")
                    && !name.is_empty()
                {
                    Ok(Self::Arg(name.to_string()))
                } else {
                    Err(unknown())
                }
            }
        }
    }

    /// Resolves the expression against `req`.
    ///
    /// A missing header or argument resolves to the empty string.
    pub fn evaluate<'a, B>(&'a self, req: &'a Request<B>) -> Result<Cow<'a, str>, ExpressionError> {
        match self {
            Self::Empty => Ok(Cow::Borrowed("")),
            Self::Literal(text) => Ok(Cow::Borrowed(text)),
            Self::RemoteAddr => remote_addr(req)
                .map(|addr| Cow::Owned(addr.ip().to_string()))
                .ok_or(ExpressionError::NoRemoteAddr),
            Self::Header(name) => header(req, name),
            Self::Arg(name) => Ok(Cow::Borrowed(query_arg(req, name).unwrap_or(""))),
            Self::Host => match req.uri().host() {
                Some(host) => Ok(Cow::Borrowed(host)),
                None => header(req, &http::header::HOST),
            },
            Self::Uri => Ok(Cow::Borrowed(req.uri().path())),
        }
    }
}

fn remote_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    if let Some(ClientAddr(addr)) = req.extensions().get::<ClientAddr>() {
        return Some(*addr);
    }
    #[cfg(feature = "axum")]
    if let Some(info) = req
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
    {
        return Some(info.0);
    }
    None
}

fn header<'a, B>(req: &'a Request<B>, name: &HeaderName) -> Result<Cow<'a, str>, ExpressionError> {
    match req.headers().get(name) {
        None => Ok(Cow::Borrowed("")),
        Some(value) => value
            .to_str()
            .map(Cow::Borrowed)
            .map_err(|_| ExpressionError::NotUtf8(name.clone())),
    }
}

fn query_arg<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}
