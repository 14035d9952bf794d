//! Argument decomposition for FUSE operation requests.
//!
//! Splits the byte payload of a request segment into typed argument
//! structures. Virtio descriptor payloads carry no alignment guarantee, so
//! arguments are fetched by copy (they are all small `#[repr(C)]` PODs)
//! instead of by reference.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use zerocopy::{FromBytes, Immutable, KnownLayout};

/// An iterator that fetches typed arguments from the front of a byte slice.
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

    /// Fetch a typed argument by value. Returns `None` if there is not
    /// enough data left.
    pub(crate) fn fetch<T: FromBytes + KnownLayout + Immutable + Copy>(&mut self) -> Option<T> {
        let (value, rest) = T::read_from_prefix(self.data).ok()?;
        self.data = rest;
        Some(value)
    }

    /// Fetch `count` consecutive typed arguments.
    pub(crate) fn fetch_vec<T: FromBytes + KnownLayout + Immutable + Copy>(
        &mut self,
        count: usize,
    ) -> Option<Vec<T>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.fetch::<T>()?);
        }
        Some(out)
    }

    /// Fetch a NUL-terminated string (possibly non-utf8). Returns `None` if
    /// there is no terminator in the remaining data.
    pub(crate) fn fetch_str(&mut self) -> Option<&'a OsStr> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(OsStr::from_bytes(out))
    }

    /// Like [`fetch_str`](Self::fetch_str), but owned, for handlers that
    /// outlive the request buffers.
    pub(crate) fn fetch_string(&mut self) -> Option<OsString> {
        self.fetch_str().map(|s| s.to_owned())
    }
}
