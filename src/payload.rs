use bytes::Bytes;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A payload buffer could not be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("payload allocation of {len} bytes failed")]
pub struct Exhausted {
    pub len: usize,
}

struct Inner {
    limit: usize,
    used: AtomicUsize,
}

/// The memory available to frame payloads that are still owned by someone:
/// the decoder, the mailbox or a consumer.
#[derive(Clone)]
pub struct Budget {
    inner: Arc<Inner>,
}

impl Budget {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit,
                used: AtomicUsize::new(0),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Bytes currently held by live payloads.
    pub fn in_use(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    fn acquire(&self, len: usize) -> Option<Lease> {
        let limit = self.inner.limit;
        self.inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|total| *total <= limit)
            })
            .ok()?;

        Some(Lease {
            inner: self.inner.clone(),
            len,
        })
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Debug for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Budget")
            .field("limit", &self.limit())
            .field("in_use", &self.in_use())
            .finish()
    }
}

struct Lease {
    inner: Arc<Inner>,
    len: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.used.fetch_sub(self.len, Ordering::AcqRel);
    }
}

/// An owned, unmasked frame payload.
///
/// Exactly one party owns a `Payload` at a time. Its bytes count against the
/// `Budget` it was allocated from until it is dropped.
pub struct Payload {
    bytes: Bytes,
    _lease: Option<Lease>,
}

impl Payload {
    pub const fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
            _lease: None,
        }
    }

    /// Copies `src` into a fresh buffer charged to `budget`, removing `mask`
    /// on the way.
    pub fn copy_from(src: &[u8], mask: Option<[u8; 4]>, budget: &Budget) -> Result<Self, Exhausted> {
        let len = src.len();
        if len == 0 {
            return Ok(Self::empty());
        }

        let lease = budget.acquire(len).ok_or(Exhausted { len })?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| Exhausted { len })?;
        buf.extend_from_slice(src);
        if let Some(key) = mask {
            crate::frame::apply_mask(&mut buf, key);
        }

        Ok(Self {
            bytes: Bytes::from(buf),
            _lease: Some(lease),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for Payload {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("len", &self.len()).finish()
    }
}
