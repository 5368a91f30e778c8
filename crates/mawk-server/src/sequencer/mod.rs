//! Response ordering state.
//!
//! Every request descriptor owns one [`Sequencer`]. It picks which of the
//! descriptor's candidate responses the next request receives:
//!
//! - `ordered`: `counter % N` from a shared atomic counter.
//! - `unordered`: a permutation of `0..N`, reshuffled with the seeded
//!   generator each time the counter wraps to a multiple of N.
//! - `random`: an independent draw from `0..2N` reduced modulo N.
//!
//! Both seeded policies draw from [`GoSource`], so a pinned seed replays
//! the same sequence as other mock servers sharing the config format.

mod source;

pub use source::GoSource;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ordering policy for a descriptor's responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPolicy {
    #[default]
    Ordered,
    Unordered,
    Random,
}

impl fmt::Display for OrderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderPolicy::Ordered => write!(f, "ordered"),
            OrderPolicy::Unordered => write!(f, "unordered"),
            OrderPolicy::Random => write!(f, "random"),
        }
    }
}

/// Permutation state for `unordered`. The position counter lives under the
/// same lock as the permutation so each cycle is a strict permutation.
struct Shuffle {
    rng: GoSource,
    permutation: Vec<usize>,
    served: u64,
}

enum Strategy {
    Ordered(AtomicU64),
    Unordered(Mutex<Shuffle>),
    Random(Mutex<GoSource>),
}

pub struct Sequencer {
    len: usize,
    seed: u64,
    strategy: Strategy,
}

impl Sequencer {
    /// Create a sequencer over `len` candidates. The seed only matters for
    /// `unordered` and `random`.
    pub fn new(policy: OrderPolicy, len: usize, seed: u64) -> Self {
        let strategy = match policy {
            OrderPolicy::Ordered => Strategy::Ordered(AtomicU64::new(0)),
            OrderPolicy::Unordered => Strategy::Unordered(Mutex::new(Shuffle {
                rng: GoSource::new(seed as i64),
                permutation: (0..len).collect(),
                served: 0,
            })),
            OrderPolicy::Random => Strategy::Random(Mutex::new(GoSource::new(seed as i64))),
        };
        Self {
            len,
            seed,
            strategy,
        }
    }

    pub fn policy(&self) -> OrderPolicy {
        match self.strategy {
            Strategy::Ordered(_) => OrderPolicy::Ordered,
            Strategy::Unordered(_) => OrderPolicy::Unordered,
            Strategy::Random(_) => OrderPolicy::Random,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the next candidate, or `None` when there are no candidates.
    pub fn next_index(&self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let n = self.len as u64;
        let idx = match &self.strategy {
            Strategy::Ordered(counter) => counter.fetch_add(1, Ordering::Relaxed) % n,
            Strategy::Unordered(shuffle) => {
                let mut state = shuffle.lock();
                let pos = state.served % n;
                if pos == 0 {
                    let Shuffle {
                        rng, permutation, ..
                    } = &mut *state;
                    rng.shuffle(permutation);
                }
                state.served = state.served.wrapping_add(1);
                state.permutation[pos as usize] as u64
            }
            Strategy::Random(rng) => rng.lock().int63n(2 * n as i64) as u64 % n,
        };
        Some(idx as usize)
    }
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Sequencer")
            .field("policy", &self.policy())
            .field("len", &self.len)
            .field("seed", &self.seed)
            .finish()
    }
}

/// Seed used when a descriptor does not pin one.
pub fn time_seed() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n as u64)
        .unwrap_or_default()
}
