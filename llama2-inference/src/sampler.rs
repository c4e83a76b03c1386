use crate::kernels::softmax;

/// Stores a probability and its associated index (token id).
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// xorshift64* pseudo-random generator.
///
/// A plain value: copying it snapshots the stream, which makes sampling runs reproducible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545F4914F6CDD1D) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }
}

/// Top-p/temperature sampler for language model logits.
///
/// This struct implements temperature scaling, top-p (nucleus) sampling,
/// and multinomial sampling, using a simple xorshift RNG for reproducibility.
#[derive(Debug)]
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    temperature: f32,
    topp: f32,
    rng: XorShiftRng,
}

impl Sampler {
    /// Creates a new sampler with the given vocabulary size, temperature, top-p, and RNG seed.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - Temperature for sampling (0.0 for greedy)
    /// * `topp` - Top-p threshold, anything outside (0, 1) selects plain multinomial sampling
    /// * `rng_seed` - Random seed for reproducibility
    pub fn new(vocab_size: usize, temperature: f32, topp: f32, rng_seed: u64) -> Self {
        Self { probindex: vec![ProbIndex::default(); vocab_size], temperature, topp, rng: XorShiftRng::new(rng_seed) }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn topp(&self) -> f32 {
        self.topp
    }

    /// Current generator state, advanced once per non-greedy `sample` call.
    pub fn rng(&self) -> XorShiftRng {
        self.rng
    }

    /// Returns the index of the maximum logit, the first one on ties.
    pub fn sample_argmax(probabilities: &[f32]) -> usize {
        let mut max_i = 0;
        let mut max_p = f32::NEG_INFINITY;
        for (i, &p) in probabilities.iter().enumerate() {
            if p > max_p {
                max_i = i;
                max_p = p;
            }
        }
        max_i
    }

    /// Multinomial sampling: the first index whose cumulative probability exceeds `coin`.
    pub fn sample_mult(probabilities: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probabilities.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        // in case of rounding errors
        probabilities.len().saturating_sub(1)
    }

    /// Top-p (nucleus) sampling: sample from the smallest set of tokens whose cumulative probability exceeds `topp`.
    pub fn sample_topp(probabilities: &[f32], topp: f32, probindex: &mut [ProbIndex], coin: f32) -> usize {
        // Tokens below the cutoff can never be part of the nucleus
        let cutoff = (1.0 - topp) / probabilities.len().saturating_sub(1).max(1) as f32;
        let mut n0 = 0;

        for (i, &prob) in probabilities.iter().enumerate() {
            if prob >= cutoff {
                probindex[n0] = ProbIndex { prob, index: i };
                n0 += 1;
            }
        }

        if n0 == 0 {
            return Self::sample_mult(probabilities, coin);
        }

        // Sort by probability (descending)
        let candidates = &mut probindex[..n0];
        candidates.sort_unstable_by(|a, b| b.prob.total_cmp(&a.prob).then(a.index.cmp(&b.index)));

        // Find truncation point
        let mut cumulative_prob = 0.0;
        let mut last_idx = n0 - 1;
        for (i, candidate) in candidates.iter().enumerate() {
            cumulative_prob += candidate.prob;
            if cumulative_prob > topp {
                last_idx = i;
                break;
            }
        }

        // Sample from truncated list
        let r = coin * cumulative_prob;
        let mut cdf = 0.0;
        for candidate in &candidates[..=last_idx] {
            cdf += candidate.prob;
            if r < cdf {
                return candidate.index;
            }
        }
        candidates[last_idx].index
    }

    /// Samples a token index from logits using temperature and top-p.
    ///
    /// - If temperature is 0, returns the argmax (greedy) without touching the RNG.
    /// - Otherwise, applies temperature scaling, softmax, and top-p or multinomial sampling.
    ///
    /// The logits are overwritten with probabilities in the second case.
    pub fn sample(&mut self, logits: &mut [f32]) -> usize {
        if self.temperature == 0.0 {
            return Self::sample_argmax(logits);
        }

        logits.iter_mut().for_each(|logit| *logit /= self.temperature);
        softmax(logits);

        let coin = self.rng.next_f32();

        if self.topp <= 0.0 || self.topp >= 1.0 {
            Self::sample_mult(logits, coin)
        } else {
            // scratch was sized for the vocabulary given at construction
            if self.probindex.len() < logits.len() {
                self.probindex.resize(logits.len(), ProbIndex::default());
            }
            Self::sample_topp(logits, self.topp, &mut self.probindex[..logits.len()], coin)
        }
    }
}
