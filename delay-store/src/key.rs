use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

/// Maximum encoded length of a [`DelayKey`], separator included.
pub const MAX_KEY_LEN: usize = 256;

/// Byte placed between the domain and the identifier.
pub const KEY_SEPARATOR: u8 = 0;

/// Reasons a composite key cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// `domain + separator + identifier` does not fit in [`MAX_KEY_LEN`] bytes.
    #[error("key of {len} bytes exceeds the 256 byte limit")]
    TooLong { len: usize },

    /// One of the components contains the separator byte.
    #[error("key component contains a NUL byte")]
    ContainsSeparator,
}

/// Composite `(domain, identifier)` key, stored inline.
///
/// The key never allocates, so building one on the request path is as cheap
/// as a couple of `memcpy`s. Equality and hashing only consider the bytes in
/// use.
#[derive(Clone, Copy)]
pub struct DelayKey {
    buf: [u8; MAX_KEY_LEN],
    len: u16,
    split: u16,
}

impl DelayKey {
    /// Builds the key for `domain` and `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::TooLong`] if `len(domain) + len(identifier) + 1`
    /// exceeds [`MAX_KEY_LEN`], and [`KeyError::ContainsSeparator`] if either
    /// component contains a NUL byte.
    pub fn new(domain: &str, identifier: &str) -> Result<Self, KeyError> {
        let len = domain.len() + identifier.len() + 1;
        if len > MAX_KEY_LEN {
            return Err(KeyError::TooLong { len });
        }
        if domain.as_bytes().contains(&KEY_SEPARATOR)
            || identifier.as_bytes().contains(&KEY_SEPARATOR)
        {
            return Err(KeyError::ContainsSeparator);
        }

        let mut buf = [0u8; MAX_KEY_LEN];
        let split = domain.len();
        buf[..split].copy_from_slice(domain.as_bytes());
        buf[split] = KEY_SEPARATOR;
        buf[split + 1..len].copy_from_slice(identifier.as_bytes());

        Ok(Self {
            buf,
            len: len as u16,
            split: split as u16,
        })
    }

    /// The encoded key, separator included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn domain(&self) -> &str {
        // Both halves were copied from `&str`s and split on an ASCII byte.
        std::str::from_utf8(&self.buf[..self.split as usize]).unwrap_or_default()
    }

    pub fn identifier(&self) -> &str {
        std::str::from_utf8(&self.buf[self.split as usize + 1..self.len as usize])
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for DelayKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for DelayKey {}

impl Hash for DelayKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for DelayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayKey")
            .field("domain", &self.domain())
            .field("identifier", &self.identifier())
            .finish()
    }
}
