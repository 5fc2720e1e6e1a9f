use russh::client::{Handler, Session};
use russh::keys::PublicKey;
use tracing::debug;

/// The upstream-facing half of the auth piper. It never authenticates with
/// the client's own key (we don't have it) — by the time this handler is
/// built, a fresh host cert has already been minted for the upstream leg.
/// All this handler verifies is that the upstream's host key is one we were
/// told to trust: either a key from the target session (final hop) or one
/// of our own signers (sideways hop to the node that actually owns the
/// session).
pub struct PiperClientHandler {
    pub expected_host_keys: Vec<String>,
}

impl Handler for PiperClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let Ok(presented) = server_public_key.to_openssh() else {
            return Ok(false);
        };
        let trusted = self.expected_host_keys.iter().any(|k| k == &presented);
        if !trusted {
            debug!("upstream host key not in the trusted set, rejecting");
        }
        Ok(trusted)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        _channel: russh::Channel<russh::client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // The upstream never opens forwarded-tcpip channels back at us in
        // this system; there's nothing to do with one if it tried.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use russh::keys::{Algorithm, PrivateKey};
    use ssh_key::rand_core::OsRng;

    use super::*;

    #[tokio::test]
    async fn trusted_key_is_accepted() {
        let signer = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let public = PublicKey::from(signer.public_key().clone());
        let openssh = public.to_openssh().unwrap();

        let mut handler = PiperClientHandler {
            expected_host_keys: vec![openssh],
        };
        assert!(handler.check_server_key(&public).await.unwrap());
    }

    #[tokio::test]
    async fn untrusted_key_is_rejected() {
        let signer = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let public = PublicKey::from(signer.public_key().clone());

        let mut handler = PiperClientHandler {
            expected_host_keys: vec!["ssh-ed25519 totally-different".to_string()],
        };
        assert!(!handler.check_server_key(&public).await.unwrap());
    }
}
