use data_encoding::BASE64URL_NOPAD;
use serde::{Deserialize, Serialize};

use crate::error::UptermdError;
use crate::types::SessionId;

/// Whether an inbound connection's SSH `ClientVersion` marks it as the host
/// publishing a session or an ordinary joining client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Host,
    Client,
}

/// The SSH `user` string, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub id: SessionId,
    pub kind: IdentifierKind,
    /// Only ever populated in embedded mode.
    pub node_addr: Option<String>,
}

impl Identifier {
    pub fn new(id: impl Into<SessionId>, kind: IdentifierKind, node_addr: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            node_addr,
        }
    }
}

pub const HOST_CLIENT_VERSION: &str = "SSH-2.0-upterm-host-client";

pub fn classify_client_version(client_version: &str) -> IdentifierKind {
    if client_version == HOST_CLIENT_VERSION {
        IdentifierKind::Host
    } else {
        IdentifierKind::Client
    }
}

/// Encodes/decodes the `nodeAddr` carried piggyback in the SSH user string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierCodec {
    /// `"<id>:" + base64url(nodeAddr)`, self-sufficient.
    Embedded,
    /// `"<id>"`, resolved through the session directory.
    External,
}

impl IdentifierCodec {
    pub fn encode(&self, id: &str, node_addr: &str) -> String {
        match self {
            IdentifierCodec::Embedded => {
                format!("{id}:{}", BASE64URL_NOPAD.encode(node_addr.as_bytes()))
            }
            IdentifierCodec::External => id.to_string(),
        }
    }

    pub fn decode(&self, user: &str, client_version: &str) -> Result<Identifier, UptermdError> {
        if user.is_empty() {
            return Err(UptermdError::InvalidSshUser);
        }
        let kind = classify_client_version(client_version);
        match self {
            IdentifierCodec::Embedded => {
                let (id, encoded_addr) = match user.split_once(':') {
                    Some((id, addr)) => (id, addr),
                    None => (user, ""),
                };
                if id.is_empty() {
                    return Err(UptermdError::InvalidSshUser);
                }
                let node_addr = if encoded_addr.is_empty() {
                    String::new()
                } else {
                    let bytes = BASE64URL_NOPAD
                        .decode(encoded_addr.as_bytes())
                        .map_err(|_| UptermdError::InvalidSshUser)?;
                    String::from_utf8(bytes).map_err(|_| UptermdError::InvalidSshUser)?
                };
                Ok(Identifier::new(id, kind, Some(node_addr)))
            }
            IdentifierCodec::External => {
                // Tolerate an embedded-mode user string from an old client:
                // everything up to the first ':' is the id, the rest is
                // ignored (nodeAddr is resolved through the directory).
                let id = user.split(':').next().unwrap_or(user);
                if id.is_empty() {
                    return Err(UptermdError::InvalidSshUser);
                }
                Ok(Identifier::new(id, kind, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_round_trip() {
        let codec = IdentifierCodec::Embedded;
        let user = codec.encode("abc123", "10.0.0.1:2222");
        let ident = codec.decode(&user, "SSH-2.0-Go").unwrap();
        assert_eq!(ident.id, "abc123");
        assert_eq!(ident.node_addr.as_deref(), Some("10.0.0.1:2222"));
        assert_eq!(ident.kind, IdentifierKind::Client);
    }

    #[test]
    fn embedded_classifies_host_client_version() {
        let codec = IdentifierCodec::Embedded;
        let user = codec.encode("abc123", "10.0.0.1:2222");
        let ident = codec.decode(&user, HOST_CLIENT_VERSION).unwrap();
        assert_eq!(ident.kind, IdentifierKind::Host);
    }

    #[test]
    fn external_ignores_node_addr() {
        let codec = IdentifierCodec::External;
        let user = codec.encode("abc123", "10.0.0.1:2222");
        assert_eq!(user, "abc123");
        let ident = codec.decode(&user, "SSH-2.0-Go").unwrap();
        assert_eq!(ident.id, "abc123");
        assert_eq!(ident.node_addr, None);
    }

    #[test]
    fn external_tolerates_embedded_input() {
        let embedded = IdentifierCodec::Embedded.encode("abc123", "a:1");
        let ident = IdentifierCodec::External
            .decode(&embedded, "SSH-2.0-Go")
            .unwrap();
        assert_eq!(ident.id, "abc123");
        assert_eq!(ident.node_addr, None);
    }

    #[test]
    fn empty_user_is_rejected() {
        assert!(matches!(
            IdentifierCodec::External.decode("", "SSH-2.0-Go"),
            Err(UptermdError::InvalidSshUser)
        ));
        assert!(matches!(
            IdentifierCodec::Embedded.decode("", "SSH-2.0-Go"),
            Err(UptermdError::InvalidSshUser)
        ));
    }
}
