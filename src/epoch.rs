use std::sync::Arc;

use parking_lot::RwLock;

/// How long one relayer-committee rotation epoch lasts, in seconds.
///
/// This must match the bridge contract's definition exactly; every epoch
/// comparison in the relayer goes through [`epoch_of`] so the constant is
/// defined in one place only.
pub const EPOCH_DURATION_SECONDS: u64 = 1200;

/// Maps a block timestamp (seconds) to its epoch index.
pub fn epoch_of(timestamp: u64) -> u64 {
    timestamp / EPOCH_DURATION_SECONDS
}

/// The latest epoch observed by a chain listener, shared with the signer.
///
/// `None` until the listener has seen its first head block; the signer
/// refuses to sign with a default epoch before that.
#[derive(Clone, Default)]
pub struct CurrentEpoch(Arc<RwLock<Option<u64>>>);

impl CurrentEpoch {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last observed epoch, if any.
    pub fn get(&self) -> Option<u64> {
        *self.0.read()
    }

    /// Records a newly observed epoch.
    pub fn set(&self, epoch: u64) {
        *self.0.write() = Some(epoch);
    }
}

impl std::fmt::Debug for CurrentEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CurrentEpoch").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_timestamp_floor_div_1200() {
        assert_eq!(epoch_of(0), 0);
        assert_eq!(epoch_of(1199), 0);
        assert_eq!(epoch_of(1200), 1);
        assert_eq!(epoch_of(1201), 1);
        assert_eq!(epoch_of(120_000), 100);
        assert_eq!(epoch_of(1_700_000_000), 1_700_000_000 / 1200);
    }

    #[test]
    fn epoch_is_monotonic() {
        let mut last = 0;
        for t in (0..10_000).step_by(17) {
            let e = epoch_of(t);
            assert!(e >= last);
            last = e;
        }
    }

    #[test]
    fn current_epoch_starts_empty() {
        let cell = CurrentEpoch::new();
        assert_eq!(cell.get(), None);
        cell.set(42);
        assert_eq!(cell.get(), Some(42));
        cell.set(43);
        assert_eq!(cell.get(), Some(43));
    }
}
