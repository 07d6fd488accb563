use std::sync::atomic::{AtomicI64, Ordering};

/// Reference count guarding a segment's backing storage.
///
/// Starts at one. The decrement that takes the count to zero is reported to
/// exactly one caller, which owns the release; after that the handle is dead
/// and taking a new reference is a bug.
#[derive(Debug)]
pub struct Refs {
    count: AtomicI64,
}

impl Refs {
    pub fn new() -> Self {
        Refs { count: AtomicI64::new(1) }
    }

    /// Rebuild a handle from a saved count.
    pub(crate) fn from_raw(count: i64) -> Self {
        Refs { count: AtomicI64::new(count) }
    }

    pub fn read_refs(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Take a reference the caller knows cannot race with the final release.
    ///
    /// # Panics
    ///
    /// If the handle was already released.
    pub fn inc_ref(&self) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev <= 0 {
            panic!("inc_ref on released handle (count was {})", prev);
        }
    }

    /// Drop a reference. Returns `true` for the one call that reached zero.
    ///
    /// # Panics
    ///
    /// If the count would go negative.
    #[must_use = "the caller reaching zero must release the resource"]
    pub fn dec_ref(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            panic!("dec_ref on released handle (count was {})", prev);
        }
        prev == 1
    }
}

impl Default for Refs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_zero_edge() {
        let refs = Refs::new();
        refs.inc_ref();
        assert_eq!(refs.read_refs(), 2);
        assert!(!refs.dec_ref());
        assert!(refs.dec_ref());
        assert_eq!(refs.read_refs(), 0);
    }

    #[test]
    #[should_panic(expected = "inc_ref on released handle")]
    fn test_inc_after_release_panics() {
        let refs = Refs::new();
        assert!(refs.dec_ref());
        refs.inc_ref();
    }

    #[test]
    #[should_panic(expected = "dec_ref on released handle")]
    fn test_underflow_panics() {
        let refs = Refs::new();
        assert!(refs.dec_ref());
        let _ = refs.dec_ref();
    }

    #[test]
    fn test_concurrent_decrements_fire_once() {
        const THREADS: usize = 16;
        const PER_THREAD: usize = 1000;

        let refs = Refs::from_raw((THREADS * PER_THREAD) as i64);
        let zero_edges = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..PER_THREAD {
                        if refs.dec_ref() {
                            zero_edges.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(zero_edges.load(Ordering::SeqCst), 1);
        assert_eq!(refs.read_refs(), 0);
    }
}
