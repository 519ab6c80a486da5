use std::sync::atomic::{AtomicI32, Ordering};

/// Allocates the strictly-monotonic request ids used to correlate replies, wrapping at
/// `i32::MAX` (request ids are transmitted as an unsigned 31-bit quantity on the wire, but
/// represented as `i32` in memory like the rest of the header fields).
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    next: AtomicI32,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(0),
        }
    }

    pub fn next(&self) -> i32 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id < 0 {
            // Wrapped past i32::MAX; reset and hand out 0. A concurrent caller landing in
            // this same window may observe a duplicate id, which is acceptable: a single
            // connection only ever has one request in flight at a time (see the transport's
            // write-lock discipline), so ids are never compared across a wraparound while a
            // reply is still outstanding.
            self.next.store(1, Ordering::Relaxed);
            0
        } else {
            id
        }
    }
}
