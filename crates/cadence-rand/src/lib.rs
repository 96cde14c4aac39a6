//! Seeded randomization engine.
//!
//! Every function here draws from an explicit [`RngHandle`] rather than a
//! process-global source. Reseeding is "construct a new handle": a run that
//! threads one handle through all of its consumers (shuffles, sampling,
//! simulated responses) is deterministically reproducible from the seed
//! alone. Inputs are never mutated; each function returns a new sequence.

use cadence_types::{CadenceError, Result, TrialRecord};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

// ---------------------------------------------------------------------------
// RngHandle
// ---------------------------------------------------------------------------

/// An explicit handle to a seedable pseudo-random source.
///
/// The handle records the seed that produced it, so auto-seeded runs can
/// still report a seed that reproduces them.
#[derive(Debug, Clone)]
pub struct RngHandle {
    rng: Pcg64Mcg,
    seed: u64,
}

impl RngHandle {
    /// Create a handle from an explicit seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Pcg64Mcg::seed_from_u64(seed),
            seed,
        }
    }

    /// Create a handle from the given seed, or auto-generate one.
    /// The seed actually used is available via [`seed`](RngHandle::seed).
    pub fn seeded(seed: Option<u64>) -> Self {
        Self::from_seed(seed.unwrap_or_else(|| rand::thread_rng().gen()))
    }

    /// The seed this handle was constructed from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform draw in `[0, n)`. Panics if `n == 0`.
    pub fn next_index(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }
}

// ---------------------------------------------------------------------------
// Shuffles
// ---------------------------------------------------------------------------

/// Uniform random permutation (Fisher–Yates, from the end).
/// Draws exactly `n - 1` random numbers for a sequence of length `n`.
pub fn shuffle<T: Clone>(items: &[T], rng: &mut RngHandle) -> Vec<T> {
    let mut out = items.to_vec();
    for m in (1..out.len()).rev() {
        let i = rng.next_index(m + 1);
        out.swap(m, i);
    }
    out
}

/// Independently shuffles each group, then interleaves position-wise:
/// `out[i]` cycles through the groups (in a shuffled group order when
/// `randomize_group_order` is set). All groups must have the same length.
pub fn shuffle_alternate_groups<T: Clone>(
    groups: &[Vec<T>],
    randomize_group_order: bool,
    rng: &mut RngHandle,
) -> Result<Vec<T>> {
    if groups.is_empty() {
        return Ok(Vec::new());
    }
    let len = groups[0].len();
    if groups.iter().any(|g| g.len() != len) {
        return Err(CadenceError::InvalidArgument(
            "alternate-group shuffle requires groups of equal length".into(),
        ));
    }

    let mut group_order: Vec<usize> = (0..groups.len()).collect();
    if randomize_group_order {
        group_order = shuffle(&group_order, rng);
    }

    let shuffled: Vec<Vec<T>> = groups.iter().map(|g| shuffle(g, rng)).collect();

    let mut out = Vec::with_capacity(groups.len() * len);
    for i in 0..len {
        for &g in &group_order {
            out.push(shuffled[g][i].clone());
        }
    }
    Ok(out)
}

/// A permutation in which no two adjacent elements are equal under `eq`.
///
/// Fails with `Unsatisfiable` when the multiset makes this provably
/// impossible (one equivalence class holding more than half the elements),
/// rather than looping forever. After a bounded number of rejection-sampled
/// shuffles, falls back to a greedy largest-class construction that always
/// succeeds for feasible inputs.
pub fn shuffle_no_repeats<T, F>(items: &[T], eq: F, rng: &mut RngHandle) -> Result<Vec<T>>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    if items.len() < 2 {
        return Ok(items.to_vec());
    }

    // Partition into equivalence classes (eq is assumed transitive).
    let mut classes: Vec<Vec<T>> = Vec::new();
    for item in items {
        match classes.iter_mut().find(|c| eq(&c[0], item)) {
            Some(class) => class.push(item.clone()),
            None => classes.push(vec![item.clone()]),
        }
    }

    let max_class = classes.iter().map(Vec::len).max().unwrap_or(0);
    if max_class > (items.len() + 1) / 2 {
        return Err(CadenceError::Unsatisfiable(format!(
            "a value occurs {} times in a sequence of {}; no adjacent-distinct ordering exists",
            max_class,
            items.len()
        )));
    }

    const SHUFFLE_ATTEMPTS: usize = 32;
    for _ in 0..SHUFFLE_ATTEMPTS {
        let candidate = shuffle(items, rng);
        if candidate.windows(2).all(|w| !eq(&w[0], &w[1])) {
            return Ok(candidate);
        }
    }

    // Greedy construction: at each step take an element from the largest
    // remaining class that differs from the previous pick, breaking ties at
    // random. Feasibility was established above, so this cannot dead-end.
    let mut buckets: Vec<Vec<T>> = classes.into_iter().map(|c| shuffle(&c, rng)).collect();
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    let mut prev_class: Option<usize> = None;
    for _ in 0..items.len() {
        let best = buckets
            .iter()
            .enumerate()
            .filter(|(i, b)| Some(*i) != prev_class && !b.is_empty())
            .map(|(_, b)| b.len())
            .max()
            .unwrap_or(0);
        let candidates: Vec<usize> = buckets
            .iter()
            .enumerate()
            .filter(|(i, b)| Some(*i) != prev_class && b.len() == best && best > 0)
            .map(|(i, _)| i)
            .collect();
        let pick = candidates[rng.next_index(candidates.len())];
        out.push(buckets[pick].pop().unwrap());
        prev_class = Some(pick);
    }
    Ok(out)
}

/// Each element repeated `repetitions` times, then shuffled.
pub fn repeat<T: Clone>(items: &[T], repetitions: usize, rng: &mut RngHandle) -> Vec<T> {
    let mut all = Vec::with_capacity(items.len() * repetitions);
    for item in items {
        for _ in 0..repetitions {
            all.push(item.clone());
        }
    }
    shuffle(&all, rng)
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// `size` distinct draws from `items`, in random order.
pub fn sample_without_replacement<T: Clone>(
    items: &[T],
    size: usize,
    rng: &mut RngHandle,
) -> Result<Vec<T>> {
    if size > items.len() {
        return Err(CadenceError::InvalidArgument(format!(
            "cannot sample {} items without replacement from a set of {}",
            size,
            items.len()
        )));
    }
    let mut out = shuffle(items, rng);
    out.truncate(size);
    Ok(out)
}

/// `size` independent draws from `items`, optionally weighted. The weight
/// vector must match the input length and sum to a positive value.
pub fn sample_with_replacement<T: Clone>(
    items: &[T],
    size: usize,
    weights: Option<&[f64]>,
    rng: &mut RngHandle,
) -> Result<Vec<T>> {
    if items.is_empty() {
        return Err(CadenceError::InvalidArgument(
            "cannot sample with replacement from an empty set".into(),
        ));
    }

    let normalized: Vec<f64> = match weights {
        Some(weights) => {
            if weights.len() != items.len() {
                return Err(CadenceError::InvalidArgument(format!(
                    "weight vector length {} does not match sequence length {}",
                    weights.len(),
                    items.len()
                )));
            }
            if weights.iter().any(|w| *w < 0.0) {
                return Err(CadenceError::InvalidArgument(
                    "sampling weights must be non-negative".into(),
                ));
            }
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                return Err(CadenceError::InvalidArgument(
                    "sampling weights must sum to a positive value".into(),
                ));
            }
            weights.iter().map(|w| w / total).collect()
        }
        None => vec![1.0 / items.len() as f64; items.len()],
    };

    let mut cumulative = Vec::with_capacity(normalized.len());
    let mut acc = 0.0;
    for w in &normalized {
        acc += w;
        cumulative.push(acc);
    }

    let mut out = Vec::with_capacity(size);
    for _ in 0..size {
        let draw = rng.next_f64();
        let mut index = 0;
        while index + 1 < cumulative.len() && draw > cumulative[index] {
            index += 1;
        }
        out.push(items[index].clone());
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Factorial designs
// ---------------------------------------------------------------------------

/// Full cartesian product of named factor levels. Factors nest in the order
/// given, with the first factor varying slowest; each combination is
/// repeated `repetitions` times contiguously.
pub fn factorial(
    factors: &[(String, Vec<serde_json::Value>)],
    repetitions: usize,
) -> Vec<TrialRecord> {
    let mut design: Vec<TrialRecord> = vec![TrialRecord::new()];
    for (name, levels) in factors {
        let mut expanded = Vec::with_capacity(design.len() * levels.len());
        for cell in &design {
            for level in levels {
                let mut next = cell.clone();
                next.insert(name.clone(), level.clone());
                expanded.push(next);
            }
        }
        design = expanded;
    }

    let mut out = Vec::with_capacity(design.len() * repetitions);
    for cell in design {
        for _ in 0..repetitions {
            out.push(cell.clone());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Scalar draws
// ---------------------------------------------------------------------------

/// Uniform integer in `[lower, upper]`, inclusive on both ends.
pub fn random_int(lower: i64, upper: i64, rng: &mut RngHandle) -> Result<i64> {
    if upper < lower {
        return Err(CadenceError::InvalidArgument(format!(
            "random_int upper bound {upper} is below lower bound {lower}"
        )));
    }
    let span = (upper - lower) as u64 + 1;
    Ok(lower + (rng.rng.gen_range(0..span)) as i64)
}

/// A draw from an ex-Gaussian distribution: the sum of a Normal
/// (Box–Muller) and an Exponential deviate. With `positive_only`, redraws
/// until the value is non-negative. Used for simulated reaction times.
pub fn sample_ex_gaussian(
    mean: f64,
    sd: f64,
    rate: f64,
    positive_only: bool,
    rng: &mut RngHandle,
) -> f64 {
    loop {
        let u1: f64 = loop {
            let u = rng.next_f64();
            if u > 0.0 {
                break u;
            }
        };
        let u2 = rng.next_f64();
        let normal = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        let exponential = if rate > 0.0 {
            let u = loop {
                let u = rng.next_f64();
                if u > 0.0 {
                    break u;
                }
            };
            -u.ln() / rate
        } else {
            0.0
        };
        let value = mean + sd * normal + exponential;
        if !positive_only || value >= 0.0 {
            return value;
        }
    }
}

/// A single Bernoulli draw with success probability `p`.
pub fn sample_bernoulli(p: f64, rng: &mut RngHandle) -> Result<bool> {
    if !(0.0..=1.0).contains(&p) {
        return Err(CadenceError::InvalidArgument(format!(
            "Bernoulli probability must be in [0, 1], got {p}"
        )));
    }
    Ok(rng.next_f64() < p)
}

/// A random lowercase alphanumeric identifier. The alphabet matches the
/// one used in exported run ids (no 'i', to avoid '1'/'l' confusion).
pub fn random_id(length: usize, rng: &mut RngHandle) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghjklmnopqrstuvwxyz";
    (0..length)
        .map(|_| CHARS[rng.next_index(CHARS.len())] as char)
        .collect()
}
