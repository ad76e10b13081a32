//! Reproducible pseudo-random keys
//!
//! Keys are plain values: splitting is a pure function of the parent key,
//! so every worker of a distributed run can derive its own key from a root
//! key handed out once at process start, without any shared state.
//!
//! ```
//! use wirtinger_core::{derive_worker_key, PrngKey};
//!
//! let root = PrngKey::new(1234);
//! let k0 = derive_worker_key(root, 0, 4).unwrap();
//! let k1 = derive_worker_key(root, 1, 4).unwrap();
//! assert_ne!(k0, k1);
//! assert_eq!(k0, derive_worker_key(root, 0, 4).unwrap());
//! ```

use crate::error::{Result, WirtingerError};
use scirs2_core::random::{rngs::StdRng, thread_rng, RngCore, SeedableRng};

/// Seed of a deterministic random stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PrngKey(u64);

impl PrngKey {
    /// Key from an explicit seed
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Key from an optional seed, drawing a fresh one from the thread RNG
    /// when none is given
    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self(s),
            None => {
                let s = thread_rng().random::<u64>();
                log::debug!("no seed given, drew PRNG seed {}", s);
                Self(s)
            }
        }
    }

    /// Raw seed, for seeding a generator
    pub fn seed(self) -> u64 {
        self.0
    }

    /// Split into `n` independent child keys
    pub fn split(self, n: usize) -> Vec<PrngKey> {
        let mut rng = StdRng::seed_from_u64(self.0);
        (0..n).map(|_| PrngKey(rng.next_u64())).collect()
    }
}

/// Key of worker `worker_rank` among `worker_count` workers.
///
/// Equivalent to `root_key.split(worker_count)[worker_rank]`: every worker
/// calling this with the same root key gets a distinct, reproducible key.
pub fn derive_worker_key(root_key: PrngKey, worker_rank: usize, worker_count: usize) -> Result<PrngKey> {
    if worker_count == 0 {
        return Err(WirtingerError::InvalidArgument(
            "worker_count must be at least 1".to_string(),
        ));
    }
    if worker_rank >= worker_count {
        return Err(WirtingerError::InvalidArgument(format!(
            "worker rank {} out of range for {} workers",
            worker_rank, worker_count
        )));
    }
    let mut rng = StdRng::seed_from_u64(root_key.0);
    let mut key = PrngKey(rng.next_u64());
    for _ in 0..worker_rank {
        key = PrngKey(rng.next_u64());
    }
    Ok(key)
}
