// Transport security - signing, compression and asymmetric encryption
//
// Outbound (agent): body -> HMAC-SHA256 signature -> gzip -> RSA-OAEP chunks
// Inbound (server): RSA-OAEP chunks -> gunzip -> signature check
//
// The functions here are pure byte transformations; the agent sender and
// the server middleware decide when to apply them.
//
// # Ciphertext framing
// The plaintext is split into blocks of at most `key_size - 2 * hash_size - 2`
// bytes (the OAEP payload limit) and each block is encrypted on its own.
// Every encrypted block is written as:
//
// ```text
// [u32 big-endian block length][block bytes]
// ```
//
// The decryptor checks each length against its own key size, so a key
// mismatch between agent and server is reported instead of silently
// producing garbage.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Request/response header carrying the hex HMAC of the uncompressed body.
pub const HASH_HEADER: &str = "HashSHA256";

pub const ENCODING_GZIP: &str = "gzip";
pub const ENCODING_ENCRYPTED: &str = "encrypted";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

const FRAME_HEADER_LEN: usize = 4;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("HashSHA256 header is missing")]
    HashHeaderMissing,

    #[error("invalid hash")]
    HashHeaderInvalid,

    #[error("invalid HMAC key")]
    InvalidHashKey,

    #[error("gzip failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("rsa failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("malformed ciphertext: {0}")]
    Framing(String),

    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse key: {0}")]
    KeyFormat(String),
}

fn mac(key: &[u8]) -> Result<HmacSha256, SecurityError> {
    HmacSha256::new_from_slice(key).map_err(|_| SecurityError::InvalidHashKey)
}

/// Computes the hex-encoded HMAC-SHA256 of `body`.
pub fn sign(key: &[u8], body: &[u8]) -> Result<String, SecurityError> {
    let mut mac = mac(key)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a `HashSHA256` header value against `body`.
///
/// Comparison is constant-time. A header that is not valid hex counts as
/// an invalid hash.
pub fn verify(key: &[u8], body: &[u8], header: Option<&str>) -> Result<(), SecurityError> {
    let header = match header {
        Some(h) if !h.is_empty() => h,
        _ => return Err(SecurityError::HashHeaderMissing),
    };
    let expected = hex::decode(header).map_err(|_| SecurityError::HashHeaderInvalid)?;

    let mut mac = mac(key)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SecurityError::HashHeaderInvalid)
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Largest plaintext block a key can encrypt under OAEP with SHA-256.
pub fn max_chunk_len(key: &RsaPublicKey) -> usize {
    key.size()
        .saturating_sub(2 * <Sha256 as Digest>::output_size() + 2)
}

/// Encrypts `data` block by block, framing each ciphertext block.
///
/// Empty input produces empty output.
pub fn encrypt_chunks(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let chunk_len = max_chunk_len(key);
    if chunk_len == 0 {
        return Err(SecurityError::KeyFormat(format!(
            "{}-byte key is too small for OAEP/SHA-256",
            key.size()
        )));
    }

    let mut rng = rand::thread_rng();
    let blocks = data.len().div_ceil(chunk_len);
    let mut out = Vec::with_capacity(blocks * (FRAME_HEADER_LEN + key.size()));

    for chunk in data.chunks(chunk_len) {
        let block = key.encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)?;
        out.extend_from_slice(&(block.len() as u32).to_be_bytes());
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Reverses [`encrypt_chunks`].
pub fn decrypt_chunks(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let block_len = key.size();
    let mut out = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        if rest.len() < FRAME_HEADER_LEN {
            return Err(SecurityError::Framing("truncated block header".into()));
        }
        let (header, tail) = rest.split_at(FRAME_HEADER_LEN);
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

        if len != block_len {
            return Err(SecurityError::Framing(format!(
                "block of {} bytes does not match {}-byte key",
                len, block_len
            )));
        }
        if tail.len() < len {
            return Err(SecurityError::Framing("truncated block".into()));
        }

        let (block, tail) = tail.split_at(len);
        out.extend(key.decrypt(Oaep::new::<Sha256>(), block)?);
        rest = tail;
    }
    Ok(out)
}

fn read_pem(path: &Path) -> Result<String, SecurityError> {
    std::fs::read_to_string(path).map_err(|source| SecurityError::KeyFile {
        path: path.display().to_string(),
        source,
    })
}

/// Loads a PEM-encoded PKIX (`BEGIN PUBLIC KEY`) RSA public key.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, SecurityError> {
    RsaPublicKey::from_public_key_pem(&read_pem(path)?)
        .map_err(|e| SecurityError::KeyFormat(e.to_string()))
}

/// Loads a PEM-encoded PKCS#8 (`BEGIN PRIVATE KEY`) RSA private key.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, SecurityError> {
    RsaPrivateKey::from_pkcs8_pem(&read_pem(path)?)
        .map_err(|e| SecurityError::KeyFormat(e.to_string()))
}

/// A request body ready to put on the wire, with the headers that describe it.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub body: Vec<u8>,
    pub signature: Option<String>,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

/// Runs the full outbound pipeline over a serialized JSON body.
///
/// The signature covers the plain body, before compression, which is also
/// what the server sees once it has undone encryption and gzip.
pub fn seal(
    plain: &[u8],
    hash_key: Option<&[u8]>,
    public_key: Option<&RsaPublicKey>,
) -> Result<SealedPayload, SecurityError> {
    let signature = match hash_key {
        Some(key) if !key.is_empty() => Some(sign(key, plain)?),
        _ => None,
    };

    let compressed = gzip(plain)?;

    Ok(match public_key {
        Some(key) => SealedPayload {
            body: encrypt_chunks(key, &compressed)?,
            signature,
            content_type: CONTENT_TYPE_OCTET_STREAM,
            content_encoding: ENCODING_ENCRYPTED,
        },
        None => SealedPayload {
            body: compressed,
            signature,
            content_type: CONTENT_TYPE_JSON,
            content_encoding: ENCODING_GZIP,
        },
    })
}

/// Shared 1024-bit key; generating one per test is slow in debug builds.
#[cfg(test)]
pub(crate) fn test_private_key() -> &'static RsaPrivateKey {
    use std::sync::OnceLock;
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
}
