//! [OCI content-addressable digests](https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests).
use digest::{Digest as _, DynDigest};
use serde::{Deserialize, Serialize};

use sha2::Sha256;
use sha2::Sha512;

use crate::{Error, Result};

/// A parsed, validated `<algorithm>:<encoded>` digest string.
///
/// Comparable and hashable by value so it can key a `HashSet`/`HashMap` directly -- the
/// garbage collector's mark set is exactly such a set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OciDigest {
    algorithm: RegisteredImageSpecAlgorithm,
    encoded: String,
}

impl OciDigest {
    /// The registered algorithm name, eg `"sha256"`.
    pub fn algorithm_str(&self) -> &'static str {
        (&self.algorithm).into()
    }

    /// The lowercase hex-encoded digest value, without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// First two characters of [`Self::encoded`], used for the fan-out prefix directory in
    /// the backend layout.
    pub fn prefix(&self) -> &str {
        &self.encoded[..2.min(self.encoded.len())]
    }
}

impl TryFrom<&str> for OciDigest {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        let i = match s.find(':') {
            Some(i) => i,
            None => return Err(Error::InvalidDigest(s.to_string())),
        };
        let algo: &str = match s.get(..i) {
            Some(a) => a,
            None => return Err(Error::InvalidDigest(s.to_string())),
        };
        let encoded: &str = match s.get(i + 1..) {
            Some(e) if !e.is_empty() => e,
            Some(_) => return Err(Error::InvalidDigest(s.to_string())),
            None => return Err(Error::InvalidDigest(s.to_string())),
        };
        let algorithm = RegisteredImageSpecAlgorithm::try_from(algo)
            .map_err(|_| Error::InvalidDigest(s.to_string()))?;

        if !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(s.to_string()));
        }
        let expected_len = match algorithm {
            RegisteredImageSpecAlgorithm::Sha256 => 64,
            RegisteredImageSpecAlgorithm::Sha512 => 128,
        };
        if encoded.len() != expected_len {
            return Err(Error::InvalidDigest(s.to_string()));
        }

        Ok(Self {
            algorithm,
            encoded: encoded.to_lowercase(),
        })
    }
}

impl TryFrom<String> for OciDigest {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        Self::try_from(s.as_str())
    }
}

impl TryFrom<&[u8]> for OciDigest {
    type Error = Error;
    fn try_from(bs: &[u8]) -> Result<Self> {
        let mut hasher = Sha256::new();
        digest::Digest::update(&mut hasher, bs);
        let s = hasher.finalize();

        Ok(Self {
            algorithm: RegisteredImageSpecAlgorithm::Sha256,
            encoded: format!("{:x}", s),
        })
    }
}

impl std::fmt::Display for OciDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm_str(), self.encoded)
    }
}

impl From<OciDigest> for String {
    fn from(d: OciDigest) -> String {
        d.to_string()
    }
}

impl From<&OciDigest> for String {
    fn from(d: &OciDigest) -> String {
        d.to_string()
    }
}

impl OciDigest {
    /// Construct an incremental digester matching this digest's algorithm, for resumable
    /// upload verification.
    pub fn digester(&self) -> Digester {
        match self.algorithm {
            RegisteredImageSpecAlgorithm::Sha256 => Digester::new(Box::new(Sha256::new())),
            RegisteredImageSpecAlgorithm::Sha512 => Digester::new(Box::new(Sha512::new())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RegisteredImageSpecAlgorithm {
    Sha256,
    Sha512,
}

impl TryFrom<&str> for RegisteredImageSpecAlgorithm {
    type Error = Error;

    fn try_from(a: &str) -> Result<Self> {
        match a {
            "sha512" => Ok(RegisteredImageSpecAlgorithm::Sha512),
            "sha256" => Ok(RegisteredImageSpecAlgorithm::Sha256),
            s => Err(Error::UnsupportedDigestAlgorithm(String::from(s))),
        }
    }
}

impl From<&RegisteredImageSpecAlgorithm> for &'static str {
    fn from(a: &RegisteredImageSpecAlgorithm) -> &'static str {
        match a {
            RegisteredImageSpecAlgorithm::Sha512 => "sha512",
            RegisteredImageSpecAlgorithm::Sha256 => "sha256",
        }
    }
}

/// Incremental hasher used by the upload controller to verify content as it streams in,
/// and to checkpoint hash state across resumed uploads.
pub struct Digester {
    digester: Box<dyn DynDigest + 'static + Send>,
    bytes: u64,
}

impl Digester {
    pub fn new(digester: Box<dyn DynDigest + 'static + Send>) -> Self {
        Self { digester, bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digester.update(data);
        self.bytes += data.len() as u64;
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Consume the digester, returning the final hex-encoded digest and the algorithm it
    /// was created with so callers can build an [`OciDigest`] out of it.
    pub fn finalize_hex(mut self, algorithm: &str) -> Result<String> {
        let out = self.digester.finalize_reset();
        let _ = algorithm;
        Ok(hex::encode(out))
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new(Box::new(Sha256::new()))
    }
}

impl From<Digester> for DigestState {
    fn from(d: Digester) -> DigestState {
        DigestState { bytes: d.bytes }
    }
}

/// Serializable snapshot of a [`Digester`]'s byte count, persisted as the upload's hash
/// checkpoint so a resumed session can validate it is being fed from the right offset.
///
/// The running hash state itself cannot be serialized generically (`DynDigest` has no
/// portable snapshot representation); on resume without a matching in-memory digester the
/// upload controller falls back to re-reading the on-disk bytes to rebuild it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DigestState {
    bytes: u64,
}

impl DigestState {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::sha256(
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        Ok(OciDigest {
            algorithm: RegisteredImageSpecAlgorithm::Sha256,
            encoded: String::from("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
        })
    )]
    #[case::unregistered_algorithm("sha666:meow", Err(Error::InvalidDigest(String::from("sha666:meow"))))]
    #[case::missing_colon("sha256meow", Err(Error::InvalidDigest(String::from("sha256meow"))))]
    #[case::empty_encoded("sha256:", Err(Error::InvalidDigest(String::from("sha256:"))))]
    #[case::empty_algorithm(":meow", Err(Error::InvalidDigest(String::from(":meow"))))]
    #[case::wrong_length("sha256:aaaa", Err(Error::InvalidDigest(String::from("sha256:aaaa"))))]
    fn validate_try_from(#[case] input: &str, #[case] expected: Result<OciDigest>) {
        let actual: Result<OciDigest> = input.try_into();
        match (expected, actual) {
            (Ok(exp), Ok(act)) => {
                assert_eq!(exp, act);
            }
            (Ok(s), Err(e)) => {
                panic!("expected Ok( {s:?} ) got Err( {e:?} )");
            }
            (Err(exp), Err(act)) => {
                assert_eq!(format!("{exp}"), format!("{act}"));
            }
            (Err(e), Ok(s)) => {
                panic!("expected Err( {e:?} ) got Ok( {s:?} )");
            }
        }
    }

    #[test]
    fn prefix_is_first_two_hex_chars() {
        let d: OciDigest = "sha256:abcdef00000000000000000000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        assert_eq!(d.prefix(), "ab");
    }
}
