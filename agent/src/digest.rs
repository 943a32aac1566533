//! Content digests for add-on archives.
//!
//! Manifests declare digests as `<algorithm>-<hex>` (for example
//! `sha512-ab12...`). [`ContentDigest`] normalises them to
//! `<algorithm>:<hex>` and verifies readers against them.

use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing or checking digests.
#[derive(Debug, Error)]
pub enum DigestError {
    /// The digest string is malformed.
    #[error("invalid digest {value:?}: {reason}")]
    Invalid {
        /// The offending input.
        value: String,
        /// Description of the problem.
        reason: String,
    },

    /// The content hashed to a different value.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Mismatch {
        /// The declared digest.
        expected: ContentDigest,
        /// The digest of the content that was read.
        actual: ContentDigest,
    },

    /// Reading the content failed.
    #[error("failed to read content for hashing")]
    Io(#[from] std::io::Error),
}

/// Hash algorithms accepted in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl DigestAlgorithm {
    /// Returns the lowercase algorithm name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// A validated `<algorithm>:<hex>` digest.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::digest::ContentDigest;
///
/// let declared = format!("sha256-{}", "A".repeat(64));
/// let digest: ContentDigest = declared.parse()?;
/// assert_eq!(digest.to_string(), format!("sha256:{}", "a".repeat(64)));
/// # Ok::<(), nodeprep_agent::digest::DigestError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl ContentDigest {
    /// Returns the algorithm that produced this digest.
    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns the lowercase hex value.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Hashes everything `reader` yields with `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::Io`] if reading fails.
    pub fn compute(algorithm: DigestAlgorithm, reader: &mut dyn Read) -> Result<Self, DigestError> {
        let hex = match algorithm {
            DigestAlgorithm::Sha256 => hash_reader::<Sha256>(reader)?,
            DigestAlgorithm::Sha384 => hash_reader::<Sha384>(reader)?,
            DigestAlgorithm::Sha512 => hash_reader::<Sha512>(reader)?,
        };
        Ok(Self { algorithm, hex })
    }

    /// Hashes `reader` with this digest's algorithm and compares.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::Mismatch`] when the content differs, or
    /// [`DigestError::Io`] if reading fails.
    pub fn verify(&self, reader: &mut dyn Read) -> Result<(), DigestError> {
        let actual = Self::compute(self.algorithm, reader)?;
        if actual == *self {
            Ok(())
        } else {
            Err(DigestError::Mismatch {
                expected: self.clone(),
                actual,
            })
        }
    }

    /// Opens `path` and verifies its content.
    ///
    /// # Errors
    ///
    /// See [`ContentDigest::verify`].
    pub fn verify_file(&self, path: &camino::Utf8Path) -> Result<(), DigestError> {
        let mut file = std::fs::File::open(path)?;
        self.verify(&mut file)
    }
}

impl FromStr for ContentDigest {
    type Err = DigestError;

    fn from_str(value: &str) -> Result<Self, DigestError> {
        let invalid = |reason: String| DigestError::Invalid {
            value: value.to_owned(),
            reason,
        };

        let (name, hex) = value
            .split_once(['-', ':'])
            .ok_or_else(|| invalid("expected <algorithm>-<hex>".to_owned()))?;
        let algorithm = DigestAlgorithm::from_name(name)
            .ok_or_else(|| invalid(format!("unsupported algorithm {name:?}")))?;

        if hex.len() != algorithm.hex_len() {
            return Err(invalid(format!(
                "expected {} hex characters, got {}",
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if let Some(bad) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(invalid(format!("non-hex character '{bad}'")));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

fn hash_reader<D: Digest>(reader: &mut dyn Read) -> std::io::Result<String>
where
    sha2::digest::Output<D>: fmt::LowerHex,
{
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(buffer.get(..read).unwrap_or_default());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const ABC_SHA512: &str = concat!(
        "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a",
        "2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
    );

    #[rstest]
    #[case::dash(format!("sha512-{ABC_SHA512}"))]
    #[case::colon(format!("sha512:{ABC_SHA512}"))]
    #[case::uppercase(format!("SHA512-{}", ABC_SHA512.to_ascii_uppercase()))]
    fn normalises_declared_digests(#[case] declared: String) {
        let digest: ContentDigest = declared.parse().expect("valid digest");
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha512);
        assert_eq!(digest.to_string(), format!("sha512:{ABC_SHA512}"));
    }

    #[rstest]
    #[case::no_separator("sha512")]
    #[case::unknown_algorithm("md5-d41d8cd98f00b204e9800998ecf8427e")]
    #[case::short("sha256-abcdef")]
    #[case::non_hex("sha256-zz7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")]
    fn rejects_malformed_digests(#[case] declared: &str) {
        let err = declared.parse::<ContentDigest>().expect_err("invalid");
        assert!(matches!(err, DigestError::Invalid { .. }));
    }

    #[rstest]
    #[case(DigestAlgorithm::Sha256, ABC_SHA256)]
    #[case(DigestAlgorithm::Sha512, ABC_SHA512)]
    fn computes_known_vectors(#[case] algorithm: DigestAlgorithm, #[case] expected: &str) {
        let digest = ContentDigest::compute(algorithm, &mut &b"abc"[..]).expect("hash");
        assert_eq!(digest.hex(), expected);
    }

    #[test]
    fn verify_reports_mismatch() {
        let digest: ContentDigest = format!("sha256-{ABC_SHA256}").parse().expect("digest");
        assert!(digest.verify(&mut &b"abc"[..]).is_ok());

        let err = digest.verify(&mut &b"abd"[..]).expect_err("mismatch");
        assert!(matches!(err, DigestError::Mismatch { .. }));
    }
}
