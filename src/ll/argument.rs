//! Payload decomposition for inbound frames.
//!
//! Helper to split the byte slice following a header into typed argument
//! structures, NUL-terminated names and trailing data.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::KnownLayout;
use zerocopy::error::ConvertError;

/// An iterator that fetches typed arguments from a byte slice.
pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    pub(crate) fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Size of the remaining data.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// All remaining bytes, emptying the iterator.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }

    /// A typed argument. `None` when not enough data is left. Alignment
    /// failures panic: receive buffers are allocated header-aligned, so a
    /// misaligned fetch is a bug in the caller, not in the peer.
    pub(crate) fn fetch<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Option<&'a T> {
        match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            Err(ConvertError::Alignment(_)) => panic!("fetch from unaligned buffer"),
            Err(ConvertError::Size(_)) => None,
            Err(ConvertError::Validity(infallible)) => match infallible {},
            Ok((x, rest)) => {
                self.data = rest;
                Some(zerocopy::Ref::<&[u8], T>::into_ref(x))
            }
        }
    }

    /// A NUL-terminated name (may be non-utf8). `None` when no terminator
    /// is left in the data.
    pub(crate) fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(out))
    }
}
