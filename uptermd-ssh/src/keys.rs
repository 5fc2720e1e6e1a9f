use std::fs::{create_dir_all, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use ssh_key::certificate::{Builder as CertBuilder, CertType};
use ssh_key::rand_core::OsRng;
use tracing::info;
use uptermd_common::types::AuthRequest;
use uptermd_common::UptermdError;

const ED25519_FILENAME: &str = "host-ed25519";
const RSA_FILENAME: &str = "host-rsa";

/// Short-lived: a host cert minted for one connection only needs to live
/// long enough for the upstream handshake to complete.
const CERT_VALIDITY_SECS: u64 = 60;

pub fn generate_host_keys(keys_dir: &Path) -> Result<(), UptermdError> {
    create_dir_all(keys_dir)?;

    let ed25519_path = keys_dir.join(ED25519_FILENAME);
    if !ed25519_path.exists() {
        info!("generating Ed25519 host key");
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(UptermdError::SshKeys)?;
        write_private_key(&ed25519_path, &key)?;
    }

    let rsa_path = keys_dir.join(RSA_FILENAME);
    if !rsa_path.exists() {
        info!("generating RSA host key");
        let key = PrivateKey::random(&mut OsRng, Algorithm::Rsa { hash: Some(HashAlg::Sha512) })
            .map_err(UptermdError::SshKeys)?;
        write_private_key(&rsa_path, &key)?;
    }

    Ok(())
}

fn write_private_key(path: &Path, key: &PrivateKey) -> Result<(), UptermdError> {
    let pem = key
        .to_openssh(ssh_key::LineEnding::LF)
        .map_err(UptermdError::SshKeys)?;
    let mut f = File::create(path)?;
    f.write_all(pem.as_bytes())?;
    Ok(())
}

pub fn load_host_keys(keys_dir: &Path) -> Result<Vec<PrivateKey>, UptermdError> {
    let mut keys = Vec::with_capacity(2);
    for filename in [ED25519_FILENAME, RSA_FILENAME] {
        let path = keys_dir.join(filename);
        keys.push(russh::keys::load_secret_key(&path, None)?);
    }
    Ok(keys)
}

/// Mints, for one signer, a short-lived SSH host certificate carrying the
/// `AuthRequest` assertion in the reserved extension. This is the core of
/// the auth piper: it lets the upstream host learn which client key was
/// actually presented without us ever holding the client's private key.
pub fn mint_auth_cert(
    signer: &PrivateKey,
    principal: &str,
    session_id: &str,
    auth_request: &AuthRequest,
) -> Result<ssh_key::Certificate, UptermdError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut builder = CertBuilder::new_with_random_nonce(
        &mut OsRng,
        PublicKey::from(signer.public_key().clone()),
        now,
        now + CERT_VALIDITY_SECS,
    )
    .map_err(UptermdError::SshKeys)?;

    builder
        .cert_type(CertType::Host)
        .map_err(UptermdError::SshKeys)?;
    builder
        .key_id(session_id)
        .map_err(UptermdError::SshKeys)?;
    builder
        .valid_principal(principal)
        .map_err(UptermdError::SshKeys)?;
    builder
        .extension(AuthRequest::EXTENSION_NAME, auth_request.encode())
        .map_err(UptermdError::SshKeys)?;

    builder.sign(signer).map_err(UptermdError::SshKeys)
}

pub fn decode_auth_cert(cert: &ssh_key::Certificate) -> Option<AuthRequest> {
    cert.extensions()
        .find(|(name, _)| name.as_str() == AuthRequest::EXTENSION_NAME)
        .and_then(|(_, value)| AuthRequest::decode(value.as_ref()).ok())
}

pub fn key_fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

pub fn host_keys_path(base: &Path) -> PathBuf {
    base.to_path_buf()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn generate_then_load_round_trips() {
        let dir = tempdir().unwrap();
        generate_host_keys(dir.path()).unwrap();
        let keys = load_host_keys(dir.path()).unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn cert_carries_auth_request_extension() {
        let signer = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let req = AuthRequest {
            client_version: "SSH-2.0-test".into(),
            remote_addr: "1.2.3.4:1".into(),
            authorized_key: vec![9, 9, 9],
        };
        let cert = mint_auth_cert(&signer, "joiner", "session-1", &req).unwrap();
        let decoded = decode_auth_cert(&cert).unwrap();
        assert_eq!(decoded, req);
    }
}
