//! Random Selection
//!
//! Every probabilistic decision (threshold draw, reply draw, repeat break,
//! chain continuation, poke) goes through an injectable [`RandomSource`],
//! so tests can force either branch.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;

/// Uniform source of rolls in `[0, 1)`
pub trait RandomSource: Send + Sync {
    fn roll(&self) -> f64;
}

/// `StdRng`-backed source
pub struct StdRandom {
    rng: Mutex<StdRng>,
}

impl StdRandom {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible sequence
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for StdRandom {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl RandomSource for StdRandom {
    fn roll(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

/// Replays queued rolls, then repeats a fallback
pub struct ScriptedRandom {
    queue: Mutex<VecDeque<f64>>,
    fallback: f64,
}

impl ScriptedRandom {
    pub fn new(rolls: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            queue: Mutex::new(rolls.into_iter().collect()),
            fallback,
        }
    }

    /// Every roll returns `value`
    pub fn constant(value: f64) -> Self {
        Self::new([], value)
    }

    pub fn push(&self, roll: f64) {
        self.queue.lock().push_back(roll);
    }
}

impl RandomSource for ScriptedRandom {
    fn roll(&self) -> f64 {
        self.queue.lock().pop_front().unwrap_or(self.fallback)
    }
}

/// `true` with probability `p`
pub fn chance(rng: &dyn RandomSource, p: f64) -> bool {
    rng.roll() < p
}

/// Index drawn proportionally to `weights`.
///
/// Non-positive and non-finite weights never win. `None` when nothing can
/// be drawn.
pub fn weighted_index(rng: &dyn RandomSource, weights: &[f64]) -> Option<usize> {
    let clean = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
    let total: f64 = weights.iter().copied().map(clean).sum();
    if total <= 0.0 {
        return None;
    }

    let target = rng.roll() * total;
    let mut acc = 0.0;
    let mut last = None;
    for (i, w) in weights.iter().copied().map(clean).enumerate() {
        if w == 0.0 {
            continue;
        }
        acc += w;
        last = Some(i);
        if target < acc {
            return Some(i);
        }
    }
    // Float rounding at the top end
    last
}

/// Element drawn proportionally to `weights`
pub fn weighted_choice<'a, T>(
    rng: &dyn RandomSource,
    items: &'a [T],
    weights: &[f64],
) -> Option<&'a T> {
    debug_assert_eq!(items.len(), weights.len());
    weighted_index(rng, weights).and_then(|i| items.get(i))
}

/// Uniformly chosen element
pub fn pick<'a, T>(rng: &dyn RandomSource, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    let i = ((rng.roll() * items.len() as f64) as usize).min(items.len() - 1);
    items.get(i)
}

/// Uniform float in `[low, high)`
pub fn uniform(rng: &dyn RandomSource, low: f64, high: f64) -> f64 {
    low + rng.roll() * (high - low)
}

/// Fisher-Yates shuffle
pub fn shuffle<T>(rng: &dyn RandomSource, items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = ((rng.roll() * (i + 1) as f64) as usize).min(i);
        items.swap(i, j);
    }
}
