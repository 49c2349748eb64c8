//! SHA-256 digest utilities and the layer chain identity.

use std::io::{Error, ErrorKind, Result};
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// A utility type representing a SHA-256 digest in binary.
pub type Sha256Digest = [u8; 32];

/// Parse a string containing a SHA256 digest in hexidecimal form into a Sha256Digest.
///
/// The string must contain exactly 64 characters and consist entirely of [0-9a-f], case
/// insensitive.
///
/// In case of a failure to parse the string, this function returns ErrorKind::InvalidInput.
pub fn parse_sha256(string: impl AsRef<str>) -> Result<Sha256Digest> {
    let mut value = [0u8; 32];
    hex::decode_to_slice(string.as_ref(), &mut value)
        .map_err(|source| Error::new(ErrorKind::InvalidInput, source))?;
    Ok(value)
}

/// Parse an OCI digest reference of the form "sha256:<64 hex chars>".
///
/// Only the sha256 algorithm is supported; anything else is ErrorKind::InvalidInput.
pub fn sha256_from_digest(digest: &str) -> Result<Sha256Digest> {
    match digest.strip_prefix("sha256:") {
        Some(rest) => parse_sha256(rest),
        None => Err(Error::new(
            ErrorKind::InvalidInput,
            format!("Digest {digest} is not sha256"),
        )),
    }
}

/// Format a digest as an OCI digest reference, "sha256:<hex>".
pub fn digest_ref(digest: &Sha256Digest) -> String {
    format!("sha256:{}", hex::encode(digest))
}

/// Compute the chain identity of a layer position from its own digest and the
/// parent position's chain identity.
///
/// With no parent the chain identity is the layer digest itself. Otherwise it
/// is the SHA-256 of `"sha256:<parent hex> sha256:<layer hex>"`, so two images
/// share a chain identity at depth N iff their first N layers are
/// byte-identical in order.
pub fn chain_digest(parent: Option<&Sha256Digest>, layer: &Sha256Digest) -> Sha256Digest {
    match parent {
        None => *layer,
        Some(parent) => {
            let mut context = Sha256::new();
            context.update(digest_ref(parent).as_bytes());
            context.update(b" ");
            context.update(digest_ref(layer).as_bytes());
            context.finalize().into()
        }
    }
}

/// Compute the SHA-256 digest and size of a file with a single streaming pass.
pub async fn sha256_file(path: &Path) -> Result<(Sha256Digest, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        match file.read(&mut buffer).await? {
            0 => break,
            n => {
                context.update(&buffer[..n]);
                size += n as u64;
            }
        }
    }

    Ok((context.finalize().into(), size))
}

/// serde support for storing a [`Sha256Digest`] as an OCI digest reference.
pub mod digest_ref_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{digest_ref, sha256_from_digest, Sha256Digest};

    pub fn serialize<S: Serializer>(digest: &Sha256Digest, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&digest_ref(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Sha256Digest, D::Error> {
        let string = String::deserialize(d)?;
        sha256_from_digest(&string).map_err(serde::de::Error::custom)
    }
}
