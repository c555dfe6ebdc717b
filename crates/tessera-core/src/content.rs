//! Content addressing for executable payloads
//!
//! A [`ContentId`] is derived from the exact bytes of the code that will be
//! dispatched. Authorization is bound to this identifier, so the bytes hashed
//! here must be the bytes that are later submitted for execution.
//!
//! The identifier is a SHA-256 multihash (`0x12 0x20 || digest`) rendered in
//! multibase base16, i.e. `f1220` followed by 64 lowercase hex characters.

use crate::errors::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const MULTIHASH_SHA2_256: u8 = 0x12;
const DIGEST_LEN: u8 = 32;
const MULTIBASE_BASE16: char = 'f';

/// Identifier deterministically derived from code bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// Wrap a raw SHA-256 digest
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// The underlying digest
    pub fn digest(&self) -> &[u8; 32] {
        &self.0
    }

    /// Multihash bytes (`code || length || digest`)
    pub fn to_multihash(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        out.push(MULTIHASH_SHA2_256);
        out.push(DIGEST_LEN);
        out.extend_from_slice(&self.0);
        out
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{MULTIBASE_BASE16}{}", hex::encode(self.to_multihash()))
    }
}

impl FromStr for ContentId {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(MULTIBASE_BASE16)
            .ok_or_else(|| TesseraError::invalid_delegation(format!("{s:?} is not base16 multibase")))?;
        let bytes = hex::decode(body)
            .map_err(|e| TesseraError::invalid_delegation(format!("content id {s:?}: {e}")))?;
        match bytes.as_slice() {
            [MULTIHASH_SHA2_256, DIGEST_LEN, digest @ ..] if digest.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(digest);
                Ok(Self(out))
            }
            _ => Err(TesseraError::invalid_delegation(format!(
                "content id {s:?} is not a sha2-256 multihash"
            ))),
        }
    }
}

impl TryFrom<String> for ContentId {
    type Error = TesseraError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.to_string()
    }
}

/// Collaborator that derives content identifiers from code bytes.
///
/// Implementations must be pure: the same bytes always yield the same
/// identifier.
pub trait ContentAddressing: Send + Sync {
    /// Derive the identifier for `code`
    fn content_id(&self, code: &[u8]) -> ContentId;
}

/// Local SHA-256 multihash addressing
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Addressing;

impl ContentAddressing for Sha256Addressing {
    fn content_id(&self, code: &[u8]) -> ContentId {
        let mut hasher = Sha256::new();
        hasher.update(code);
        let result = hasher.finalize();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        ContentId(output)
    }
}

impl<A: ContentAddressing + ?Sized> ContentAddressing for std::sync::Arc<A> {
    fn content_id(&self, code: &[u8]) -> ContentId {
        (**self).content_id(code)
    }
}

/// Hash arbitrary bytes with the workspace digest (SHA-256)
pub fn digest(data: &[u8]) -> [u8; 32] {
    *Sha256Addressing.content_id(data).digest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_known_vector() {
        let id = Sha256Addressing.content_id(b"");
        assert_eq!(
            id.to_string(),
            "f1220e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_display_agree() {
        let id = Sha256Addressing.content_id(b"export default () => 42;");
        assert_eq!(id.to_string().parse::<ContentId>().unwrap(), id);
        assert!("f1320aa".parse::<ContentId>().is_err());
        assert!("Qmabc".parse::<ContentId>().is_err());
    }

    #[test]
    fn test_distinct_payloads_distinct_ids() {
        let ids: HashSet<ContentId> = (0..2_000u32)
            .map(|i| Sha256Addressing.content_id(format!("return {i};").as_bytes()))
            .collect();
        assert_eq!(ids.len(), 2_000);
    }

    proptest! {
        #[test]
        fn prop_addressing_is_deterministic(code in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(Sha256Addressing.content_id(&code), Sha256Addressing.content_id(&code));
        }

        #[test]
        fn prop_single_byte_change_changes_id(
            code in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
        ) {
            let mut altered = code.clone();
            let i = index.index(altered.len());
            altered[i] ^= 0x01;
            prop_assert_ne!(Sha256Addressing.content_id(&code), Sha256Addressing.content_id(&altered));
        }
    }
}
