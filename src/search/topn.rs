//! Bounded, deduplicating best-results collection shared by all probe
//! workers.

use std::cmp::Ordering;

use parking_lot::Mutex;

use super::TopResult;

/// Keeps the `n` lowest-scoring results seen so far, at most one entry
/// per address. All operations take the single internal lock.
pub struct TopN {
    n: usize,
    buf: Mutex<Vec<TopResult>>,
}

impl TopN {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            buf: Mutex::new(Vec::with_capacity(n)),
        }
    }

    /// Offers a result. A duplicate address only replaces the stored
    /// entry when it scores strictly better.
    pub fn consider(&self, r: TopResult) {
        if self.n == 0 {
            return;
        }
        let mut buf = self.buf.lock();
        if let Some(existing) = buf.iter_mut().find(|e| e.ip == r.ip) {
            if r.score_ms < existing.score_ms {
                *existing = r;
            }
        } else {
            buf.push(r);
        }
        buf.sort_by(|a, b| a.score_ms.partial_cmp(&b.score_ms).unwrap_or(Ordering::Equal));
        buf.truncate(self.n);
    }

    pub fn best(&self) -> Option<TopResult> {
        self.buf.lock().first().cloned()
    }

    pub fn snapshot(&self) -> Vec<TopResult> {
        self.buf.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }
}
