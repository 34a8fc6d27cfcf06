#![forbid(unsafe_code)]

//! Bootstrap credential blob handling.
//!
//! The blob is deployment-convenience obfuscation, not encryption: a one-byte
//! tag, a big-endian payload length and an XOR-masked JSON document. The only
//! integrity check is the tag byte.

use std::{fmt, fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of every valid blob.
pub const BLOB_TAG: u8 = 0xAA;
/// Single-byte XOR mask applied to the payload.
pub const BLOB_MASK: u8 = 0x5A;

const HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("bootstrap blob unreadable at {path}: {source}")]
    MissingFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed bootstrap blob: {0}")]
    Format(&'static str),
    #[error("bootstrap payload is not valid UTF-8")]
    Decode(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("credential JSON invalid: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("credential key material invalid: {0}")]
    Key(&'static str),
}

/// Recovers the embedded JSON document from a blob.
///
/// Pure function of its input; the returned string is handed back un-parsed
/// so JSON errors stay with the caller's parser. Bytes past the declared
/// payload length are ignored.
pub fn decode_blob(bytes: &[u8]) -> Result<String, BlobError> {
    if bytes.len() < HEADER_LEN {
        return Err(BlobError::Format("blob shorter than the fixed header"));
    }
    if bytes[0] != BLOB_TAG {
        return Err(BlobError::Format("unexpected tag byte"));
    }

    let mut length_raw = [0u8; 4];
    length_raw.copy_from_slice(&bytes[1..HEADER_LEN]);
    let length = u32::from_be_bytes(length_raw) as usize;

    let Some(payload) = bytes.get(HEADER_LEN..HEADER_LEN + length) else {
        return Err(BlobError::Format("payload truncated"));
    };

    let unmasked: Vec<u8> = payload.iter().map(|byte| byte ^ BLOB_MASK).collect();
    Ok(String::from_utf8(unmasked)?)
}

/// Inverse of [`decode_blob`]; used by the deployment tool and tests.
pub fn encode_blob(text: &str) -> Result<Vec<u8>, BlobError> {
    let payload = text.as_bytes();
    let length = u32::try_from(payload.len())
        .map_err(|_| BlobError::Format("payload exceeds the 32-bit length field"))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(BLOB_TAG);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend(payload.iter().map(|byte| byte ^ BLOB_MASK));
    Ok(out)
}

/// Reads and decodes a blob file. An absent file is its own error kind so
/// startup can report "never deployed" distinctly from "deployed but corrupt".
pub fn read_blob_file(path: &Path) -> Result<String, BlobError> {
    let bytes = fs::read(path).map_err(|source| BlobError::MissingFile {
        path: path.display().to_string(),
        source,
    })?;
    decode_blob(&bytes)
}

/// Service-account style credential used for both bootstrap and operating
/// identities. `private_key` holds a base64-encoded 32-byte ed25519 seed.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceCredential {
    pub account_id: String,
    pub private_key: String,
}

impl ServiceCredential {
    /// Reads the blob at `path`, strips the obfuscation and parses the JSON.
    pub fn from_blob_file(path: &Path) -> Result<Self, CredentialError> {
        let text = read_blob_file(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, CredentialError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short blake3 digest of the key material, safe to print in logs.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.private_key.as_bytes());
        hash.to_hex()[..16].to_string()
    }
}

impl fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredential")
            .field("account_id", &self.account_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for ServiceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.account_id, self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(text: &str) -> Vec<u8> {
        text.bytes().map(|byte| byte ^ BLOB_MASK).collect()
    }

    #[test]
    fn decode_encode_round_trip() {
        let json = r#"{"account_id":"svc-bootstrap","private_key":"QUJD"}"#;
        let blob = encode_blob(json).unwrap();
        assert_eq!(blob[0], BLOB_TAG);
        assert_eq!(decode_blob(&blob).unwrap(), json);

        let again = encode_blob(&decode_blob(&blob).unwrap()).unwrap();
        assert_eq!(again, blob);
    }

    #[test]
    fn decode_known_two_byte_payload() {
        let mut blob = vec![BLOB_TAG, 0, 0, 0, 2];
        blob.extend(mask("{}"));
        assert_eq!(decode_blob(&blob).unwrap(), "{}");
    }

    #[test]
    fn decode_rejects_wrong_tag() {
        let blob = [0xBB, 0, 0, 0, 0];
        let err = decode_blob(&blob).unwrap_err();
        assert!(matches!(err, BlobError::Format(_)), "got {err:?}");
    }

    #[test]
    fn decode_rejects_short_input() {
        for len in 0..5 {
            let blob = vec![BLOB_TAG; len];
            assert!(matches!(
                decode_blob(&blob),
                Err(BlobError::Format(_))
            ));
        }
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        // Declared length of 4 but only 2 payload bytes present.
        let mut blob = vec![BLOB_TAG, 0, 0, 0, 4];
        blob.extend(mask("{}"));
        let err = decode_blob(&blob).unwrap_err();
        assert!(matches!(err, BlobError::Format(_)), "got {err:?}");
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut blob = encode_blob("{}").unwrap();
        blob.extend_from_slice(&[0xFF, 0x00, 0xFF]);
        assert_eq!(decode_blob(&blob).unwrap(), "{}");
    }

    #[test]
    fn decode_rejects_invalid_utf8_payload() {
        // 0xFF ^ 0x5A = 0xA5, which cannot start a UTF-8 sequence.
        let blob = vec![BLOB_TAG, 0, 0, 0, 1, 0xFF];
        let err = decode_blob(&blob).unwrap_err();
        assert!(matches!(err, BlobError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn read_blob_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_blob_file(&dir.path().join("absent.blob")).unwrap_err();
        assert!(matches!(err, BlobError::MissingFile { .. }), "got {err:?}");
    }

    #[test]
    fn from_blob_file_round_trips_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstrap.blob");
        let credential = ServiceCredential {
            account_id: "svc-bootstrap".into(),
            private_key: "QUJDREVGRw==".into(),
        };
        let json = serde_json::to_string(&credential).unwrap();
        std::fs::write(&path, encode_blob(&json).unwrap()).unwrap();

        let loaded = ServiceCredential::from_blob_file(&path).unwrap();
        assert_eq!(loaded.account_id, "svc-bootstrap");
        assert_eq!(loaded.private_key, credential.private_key);
    }

    #[test]
    fn from_blob_file_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstrap.blob");
        std::fs::write(&path, encode_blob("not json").unwrap()).unwrap();

        let err = ServiceCredential::from_blob_file(&path).unwrap_err();
        assert!(matches!(err, CredentialError::Parse(_)), "got {err:?}");
    }

    #[test]
    fn debug_and_display_never_leak_key_material() {
        let credential = ServiceCredential {
            account_id: "svc".into(),
            private_key: "c3VwZXItc2VjcmV0".into(),
        };
        let debug = format!("{credential:?}");
        let display = format!("{credential}");
        assert!(!debug.contains("c3VwZXItc2VjcmV0"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!display.contains("c3VwZXItc2VjcmV0"));
        assert!(display.contains("svc"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let credential = ServiceCredential {
            account_id: "svc".into(),
            private_key: "QUJD".into(),
        };
        let first = credential.fingerprint();
        assert_eq!(first.len(), 16);
        assert_eq!(first, credential.fingerprint());
    }
}
