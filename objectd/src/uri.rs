//! The opaque key objects are addressed by.

use std::{borrow::Borrow, fmt};

/// Maximum length, in bytes, of a [`Uri`].
pub const MAX_URI_LEN: usize = 4096;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum UriError {
    #[error("uri exceeds maximum length of {max} bytes (got {got})")]
    TooLong { max: usize, got: usize },
    #[error("uri must not be empty")]
    Empty,
}

/// A bounded, byte-exact opaque key.
///
/// Equality and hashing are defined purely over the underlying bytes;
/// a `Uri` carries no interpretation of its own contents beyond the
/// `/delete/` dispatch convention applied by the engine.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri(Box<str>);

impl Uri {
    pub fn parse(raw: impl Into<String>) -> Result<Self, UriError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(UriError::Empty);
        }
        if raw.len() > MAX_URI_LEN {
            return Err(UriError::TooLong {
                max: MAX_URI_LEN,
                got: raw.len(),
            });
        }
        Ok(Uri(raw.into_boxed_str()))
    }

    #[inline(always)]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// `/delete/<uri>` is the engine's deletion convention. Per the wire
    /// convention, the effective URI is the remainder starting at the next
    /// `/` after the `/delete` marker — i.e. the leading slash is kept, so
    /// the result matches the original URI a prior PUT/GET stored under
    /// (which always carries its own leading slash).
    pub fn strip_delete_prefix(&self) -> Option<&str> {
        self.0
            .strip_prefix("/delete")
            .filter(|rest| rest.starts_with('/'))
    }
}

impl Borrow<str> for Uri {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uri({:?})", self.0)
    }
}

impl TryFrom<&str> for Uri {
    type Error = UriError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Uri::parse(value)
    }
}

impl TryFrom<String> for Uri {
    type Error = UriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Uri::parse(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert_eq!(Uri::parse("").unwrap_err(), UriError::Empty);
    }

    #[test]
    fn accepts_max_length() {
        let raw = "a".repeat(MAX_URI_LEN);
        assert!(Uri::parse(raw).is_ok());
    }

    #[test]
    fn rejects_over_max_length() {
        let raw = "a".repeat(MAX_URI_LEN + 1);
        match Uri::parse(raw).unwrap_err() {
            UriError::TooLong { max, got } => {
                assert_eq!(max, MAX_URI_LEN);
                assert_eq!(got, MAX_URI_LEN + 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn delete_prefix_keeps_leading_slash_so_it_matches_the_stored_uri() {
        let uri = Uri::parse("/delete/tmp/x.dat").unwrap();
        assert_eq!(uri.strip_delete_prefix(), Some("/tmp/x.dat"));

        let uri = Uri::parse("/tmp/x.dat").unwrap();
        assert_eq!(uri.strip_delete_prefix(), None);
    }

    #[test]
    fn delete_prefix_without_trailing_slash_does_not_match() {
        let uri = Uri::parse("/deleteme").unwrap();
        assert_eq!(uri.strip_delete_prefix(), None);
    }
}
