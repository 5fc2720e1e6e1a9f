use serde::{Deserialize, Serialize};
use uptermd_common::SessionId;

/// A published terminal-sharing session: who owns it and who's allowed to
/// join it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    /// Wire address of the node currently holding the host's reverse tunnel.
    pub node_addr: String,
    pub host_user: String,
    /// OpenSSH wire-format public keys the host proves on its upstream
    /// handshake; the auth piper accepts either one of these or one of its
    /// own signers as the final-hop host key.
    pub host_public_keys: Vec<Vec<u8>>,
    /// If non-empty, a client's key must match one of these (by wire-format
    /// equality) to be admitted. Empty means "anyone".
    pub client_authorized_keys: Vec<Vec<u8>>,
}

impl Session {
    pub fn is_client_key_allowed(&self, key: &[u8]) -> bool {
        self.client_authorized_keys.is_empty()
            || self
                .client_authorized_keys
                .iter()
                .any(|allowed| allowed.as_slice() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_allow_list(keys: Vec<Vec<u8>>) -> Session {
        Session {
            id: "abc123".into(),
            node_addr: "10.0.0.1:2222".into(),
            host_user: "alice".into(),
            host_public_keys: vec![],
            client_authorized_keys: keys,
        }
    }

    #[test]
    fn empty_allow_list_admits_anyone() {
        let session = session_with_allow_list(vec![]);
        assert!(session.is_client_key_allowed(b"anything"));
    }

    #[test]
    fn non_empty_allow_list_is_enforced() {
        let session = session_with_allow_list(vec![b"k1".to_vec()]);
        assert!(session.is_client_key_allowed(b"k1"));
        assert!(!session.is_client_key_allowed(b"k2"));
    }
}
