//! In-process mutual exclusion for concurrent issuance.
//!
//! Two requests carrying the same public key or the same canonical
//! subject must not be adjudicated at the same time, or both could pass
//! the duplicate checks. The guard keys on fingerprints; markers release
//! their slot on drop, also on error paths.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::api::Fingerprint;

//------------ InFlightSet ---------------------------------------------------

#[derive(Debug, Default)]
pub struct InFlightSet {
    inner: Mutex<HashSet<Fingerprint>>,
}

impl InFlightSet {
    pub fn new() -> Arc<Self> {
        Arc::new(InFlightSet::default())
    }

    /// Claims the fingerprint, or returns `None` when another request
    /// holds it.
    pub fn try_acquire(self: &Arc<Self>, fp: Fingerprint) -> Option<InFlightMarker> {
        let mut inner = self.inner.lock().ok()?;
        if inner.insert(fp) {
            Some(InFlightMarker {
                set: self.clone(),
                fp,
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// RAII claim on one fingerprint.
#[derive(Debug)]
pub struct InFlightMarker {
    set: Arc<InFlightSet>,
    fp: Fingerprint,
}

impl Drop for InFlightMarker {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.set.inner.lock() {
            inner.remove(&self.fp);
        }
    }
}

//------------ DedupGuard ----------------------------------------------------

/// The per-CA pair of in-flight sets for keys and subjects.
#[derive(Debug)]
pub struct DedupGuard {
    pub keys: Arc<InFlightSet>,
    pub subjects: Arc<InFlightSet>,
}

impl Default for DedupGuard {
    fn default() -> Self {
        DedupGuard {
            keys: InFlightSet::new(),
            subjects: InFlightSet::new(),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint([byte; 32])
    }

    #[test]
    fn second_acquire_is_refused_until_release() {
        let set = InFlightSet::new();
        let marker = set.try_acquire(fp(1)).unwrap();
        assert!(set.try_acquire(fp(1)).is_none());
        assert!(set.try_acquire(fp(2)).is_some());
        drop(marker);
        assert!(set.try_acquire(fp(1)).is_some());
    }

    #[test]
    fn marker_releases_on_drop_in_error_paths() {
        let set = InFlightSet::new();
        let result: Result<(), ()> = (|| {
            let _marker = set.try_acquire(fp(9)).ok_or(())?;
            Err(())
        })();
        assert!(result.is_err());
        assert_eq!(set.len(), 0);
    }
}
