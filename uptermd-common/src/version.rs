/// The SSH server version string this node presents on every inbound
/// handshake, both on the routing frontend and on the internal SSHD.
pub fn server_version() -> String {
    format!("SSH-2.0-uptermd-{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_version_has_expected_prefix() {
        assert!(server_version().starts_with("SSH-2.0-uptermd-"));
    }
}
