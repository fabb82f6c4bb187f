// ─────────────────────────────────────────────────────────────────────
// Gradspace — Seeded Random Streams
// ─────────────────────────────────────────────────────────────────────
//! Forkable random source for reproducible per-repetition parallelism.
//!
//! A `SeedStream` never yields numbers itself. Each consumer asks for a
//! sub-stream by index, so repetition `i` draws the same sequence no matter
//! which thread runs it or in what order.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Root of a family of independent ChaCha streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedStream {
    seed: u64,
}

impl SeedStream {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Fixed seed if given, otherwise one drawn from the OS.
    pub fn from_option(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self::new(s),
            None => {
                let s = rand::random::<u64>();
                log::debug!("no random_seed configured, drew {s}");
                Self::new(s)
            }
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Independent generator for sub-stream `index`.
    pub fn fork(&self, index: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(index);
        rng
    }
}

/// Stream indices reserved for non-repetition consumers, kept far away
/// from repetition indices `0..n_rep`.
pub mod streams {
    pub const SOLVER: u64 = u64::MAX - 1;
    pub const RIGHT_HEMISPHERE: u64 = 1 << 62;
}
