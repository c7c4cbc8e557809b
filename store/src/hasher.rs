//! Content hashing for store paths.
//!
//! A hash is the sha256 of the input, truncated to its first 160 bits and
//! encoded as lowercase base32, which always yields 32 characters.
use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

/// Length of an encoded hash, in bytes.
pub const HASH_LENGTH: usize = 32;

/// Number of digest bytes kept before encoding.
const TRUNCATED_DIGEST_LENGTH: usize = 20;

#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data);
    }

    /// Consumes the hasher and returns the encoded hash.
    pub fn finish(self) -> String {
        let digest = self.inner.finalize();
        BASE32_NOPAD
            .encode(&digest[..TRUNCATED_DIGEST_LENGTH])
            .to_ascii_lowercase()
    }
}

impl std::io::Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn hash_string(input: impl AsRef<[u8]>) -> String {
    let mut hasher = Hasher::new();
    hasher.update(input);
    hasher.finish()
}

/// Returns true if `s` looks like the output of [Hasher::finish].
pub fn is_hash(s: &str) -> bool {
    s.len() == HASH_LENGTH
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b))
}
