//! Chatter address parsing and formatting.

use crate::error::{
    Error,
    Result,
};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use url::Url;


/// Transport carrying the framed byte stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// TLS-wrapped TCP.
    Ssl,
}

impl Transport {
    /// Scheme prefix, without the `+sbs` framing tag.
    pub fn scheme(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ssl => "ssl",
        }
    }
}

/// Parsed chatter address. The encoded form is `"<transport>+sbs://host:port"`
/// where the `+sbs` tag marks the framing family and is mandatory.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Address {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parse an address string, accepting exactly the `tcp+sbs` and
    /// `ssl+sbs` schemes with an explicit port.
    pub fn parse(addr: &str) -> Result<Self> {
        let url = Url::parse(addr)
            .map_err(|e| Error::AddressInvalid(format!("{:?}: {}", addr, e)))?;
        let transport = match url.scheme() {
            "tcp+sbs" => Transport::Tcp,
            "ssl+sbs" => Transport::Ssl,
            scheme => {
                return Err(Error::AddressInvalid(format!(
                    "unsupported scheme {:?} in {:?}",
                    scheme, addr,
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::AddressInvalid(format!("no host in {:?}", addr)))?
            .to_owned();
        let port = url
            .port()
            .ok_or_else(|| Error::AddressInvalid(format!("no port in {:?}", addr)))?;
        Ok(Address {
            transport,
            host,
            port,
        })
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(addr: &str) -> Result<Self> {
        Address::parse(addr)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}+sbs://{}:{}",
            self.transport.scheme(),
            self.host,
            self.port,
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_schemes() {
        let addr = Address::parse("tcp+sbs://127.0.0.1:24000").unwrap();
        assert_eq!(addr.transport, Transport::Tcp);
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 24000);

        let addr = Address::parse("ssl+sbs://example.com:1").unwrap();
        assert_eq!(addr.transport, Transport::Ssl);
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 1);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            Address::parse("tcp+sbs://127.0.0.1"),
            Err(Error::AddressInvalid(_)),
        ));
    }

    #[test]
    fn rejects_other_schemes() {
        for addr in [
            "tcp://127.0.0.1:1234",
            "ssl://127.0.0.1:1234",
            "ws+sbs://127.0.0.1:1234",
            "not an address",
        ] {
            assert!(
                matches!(Address::parse(addr), Err(Error::AddressInvalid(_))),
                "{:?} should be rejected",
                addr,
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for addr in ["tcp+sbs://127.0.0.1:24000", "ssl+sbs://localhost:35565"] {
            assert_eq!(Address::parse(addr).unwrap().to_string(), addr);
        }
    }
}
