use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::UptermdError;

/// A session identifier as it appears on the wire: an opaque, URL-safe string.
pub type SessionId = String;

/// Wraps a value so it never leaks into `Debug` output, while still
/// (de)serializing transparently. Used for anything that should show up in a
/// config dump as `<secret>` rather than its actual contents.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    pub fn expose_secret(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Debug for Secret<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<secret>")
    }
}

impl<T: Serialize> Serialize for Secret<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Secret<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(T::deserialize(deserializer)?))
    }
}

impl<T> From<T> for Secret<T> {
    fn from(inner: T) -> Self {
        Self(inner)
    }
}

/// The assertion the auth piper makes to the upstream host about who the
/// downstream client actually presented. Carried inside the reserved SSH
/// certificate extension `upterm-auth-request`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRequest {
    pub client_version: String,
    pub remote_addr: String,
    /// The client's presented public key, in OpenSSH wire format.
    pub authorized_key: Vec<u8>,
}

impl AuthRequest {
    pub const EXTENSION_NAME: &'static str = "upterm-auth-request";

    /// A small length-prefixed binary encoding, in field order: each field is
    /// a 4-byte big-endian length followed by its raw bytes, the same "SSH
    /// string" shape `ssh_key`/`russh` already use on the wire everywhere
    /// else in this system. Stable across versions by construction — there
    /// is no map, no field name, nothing for a serializer to reorder.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            12 + self.client_version.len() + self.remote_addr.len() + self.authorized_key.len(),
        );
        write_field(&mut buf, self.client_version.as_bytes());
        write_field(&mut buf, self.remote_addr.as_bytes());
        write_field(&mut buf, &self.authorized_key);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UptermdError> {
        let mut cursor = bytes;
        let client_version = String::from_utf8(read_field(&mut cursor)?.to_vec())
            .map_err(|_| UptermdError::Protocol("auth request: client_version is not utf-8".into()))?;
        let remote_addr = String::from_utf8(read_field(&mut cursor)?.to_vec())
            .map_err(|_| UptermdError::Protocol("auth request: remote_addr is not utf-8".into()))?;
        let authorized_key = read_field(&mut cursor)?.to_vec();
        Ok(Self {
            client_version,
            remote_addr,
            authorized_key,
        })
    }
}

fn write_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
    buf.extend_from_slice(field);
}

fn read_field<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], UptermdError> {
    if cursor.len() < 4 {
        return Err(UptermdError::Protocol("auth request: truncated field length".into()));
    }
    let (len_bytes, rest) = cursor.split_at(4);
    let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    if rest.len() < len {
        return Err(UptermdError::Protocol("auth request: truncated field body".into()));
    }
    let (field, rest) = rest.split_at(len);
    *cursor = rest;
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let s = Secret::new("hunter2".to_string());
        assert_eq!(format!("{s:?}"), "<secret>");
        assert_eq!(s.expose_secret(), "hunter2");
    }

    #[test]
    fn secret_round_trips_through_serde() {
        let s = Secret::new(42u32);
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "42");
        let back: Secret<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(*back.expose_secret(), 42);
    }

    #[test]
    fn auth_request_round_trips() {
        let req = AuthRequest {
            client_version: "SSH-2.0-test".into(),
            remote_addr: "1.2.3.4:5".into(),
            authorized_key: vec![1, 2, 3],
        };
        let encoded = req.encode();
        let decoded = AuthRequest::decode(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn auth_request_decode_rejects_truncated_input() {
        let req = AuthRequest {
            client_version: "SSH-2.0-test".into(),
            remote_addr: "1.2.3.4:5".into(),
            authorized_key: vec![1, 2, 3],
        };
        let mut encoded = req.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(AuthRequest::decode(&encoded).is_err());
    }
}
