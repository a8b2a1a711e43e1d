//! Random page sampling.
//!
//! `fraction[:passes]` selects `floor(pages * fraction)` distinct pages per
//! pass. Later passes only draw pages no earlier pass drew. Each pass is
//! scheduled in ascending page order.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("invalid sampling parameter '{0}': expected fraction[:passes] with 0 < fraction < 1 and passes >= 1")]
pub struct SamplingError(pub String);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub fraction: f64,
    pub passes: u32,
    /// `fraction` as `numerator / denominator`, exact for decimal input.
    ratio: (u64, u64),
}

/// Denominator used when the fraction is not written as a plain decimal.
const FALLBACK_DENOMINATOR: u64 = 1_000_000_000_000;

impl Sampling {
    /// Pages drawn per pass for an image of `total_pages`.
    pub fn pages_per_pass(&self, total_pages: u64) -> u64 {
        let (num, den) = self.ratio;
        (total_pages as u128 * num as u128 / den as u128) as u64
    }
}

/// `"0.29"` -> `(29, 100)`. `None` for anything but `digits[.digits]`.
fn decimal_ratio(text: &str) -> Option<(u64, u64)> {
    let (int, frac) = text.split_once('.').unwrap_or((text, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) || frac.len() > 18 {
        return None;
    }
    let den = 10u64.checked_pow(frac.len() as u32)?;
    let int: u64 = if int.is_empty() { 0 } else { int.parse().ok()? };
    let frac: u64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    Some((int.checked_mul(den)?.checked_add(frac)?, den))
}

impl FromStr for Sampling {
    type Err = SamplingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SamplingError(s.to_string());
        let (fraction, passes) = match s.split_once(':') {
            Some((f, p)) => (f, Some(p)),
            None => (s, None),
        };
        let text = fraction.trim();
        let fraction: f64 = text.parse().map_err(|_| err())?;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(err());
        }
        let ratio = decimal_ratio(text).unwrap_or_else(|| {
            let num = (fraction * FALLBACK_DENOMINATOR as f64).round() as u64;
            (num, FALLBACK_DENOMINATOR)
        });
        let passes = match passes {
            Some(p) => p.trim().parse::<u32>().map_err(|_| err())?,
            None => 1,
        };
        if passes == 0 {
            return Err(err());
        }
        Ok(Self {
            fraction,
            passes,
            ratio,
        })
    }
}

impl fmt::Display for Sampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fraction, self.passes)
    }
}

/// xorshift64; reproducible for a given seed.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Seed from the clock.
    pub fn from_clock() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::new(nanos)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in `0..bound`. `bound` must be positive.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Page indices for every pass, each pass sorted ascending. No index appears
/// twice across passes.
pub fn sample_pages(total_pages: u64, sampling: &Sampling, rng: &mut SimpleRng) -> Vec<Vec<u64>> {
    let per_pass = sampling.pages_per_pass(total_pages);
    let mut drawn: HashSet<u64> = HashSet::new();
    let mut passes = Vec::with_capacity(sampling.passes as usize);

    for _ in 0..sampling.passes {
        let remaining = total_pages - drawn.len() as u64;
        let target = per_pass.min(remaining);
        let mut pass: Vec<u64> = if target == 0 {
            Vec::new()
        } else if target.saturating_mul(2) > remaining {
            // dense: shuffle what is left and take a prefix
            let mut left: Vec<u64> = (0..total_pages).filter(|i| !drawn.contains(i)).collect();
            for i in 0..target as usize {
                let j = i + rng.below((left.len() - i) as u64) as usize;
                left.swap(i, j);
            }
            left.truncate(target as usize);
            left
        } else {
            let mut picked: HashSet<u64> = HashSet::with_capacity(target as usize);
            while (picked.len() as u64) < target {
                let idx = rng.below(total_pages);
                if !drawn.contains(&idx) {
                    picked.insert(idx);
                }
            }
            picked.into_iter().collect()
        };
        pass.sort_unstable();
        drawn.extend(pass.iter().copied());
        passes.push(pass);
    }
    passes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fraction_and_passes() {
        let quarter: Sampling = "0.25".parse().unwrap();
        assert_eq!(quarter.fraction, 0.25);
        assert_eq!(quarter.passes, 1);
        assert_eq!(quarter.ratio, (25, 100));
        assert_eq!("1e-1".parse::<Sampling>().unwrap().pages_per_pass(50), 5);
        assert_eq!("0.1:3".parse::<Sampling>().unwrap().passes, 3);
        for bad in ["0", "1", "1.5", "-0.1", "abc", "0.5:0", "0.5:x"] {
            assert!(bad.parse::<Sampling>().is_err(), "{bad}");
        }
    }

    #[test]
    fn pass_has_exact_distinct_count() {
        let sampling: Sampling = "0.3".parse().unwrap();
        let mut rng = SimpleRng::new(42);
        let passes = sample_pages(1000, &sampling, &mut rng);
        assert_eq!(passes.len(), 1);
        let pass = &passes[0];
        assert_eq!(pass.len(), 300);
        assert!(pass.windows(2).all(|w| w[0] < w[1]));
        assert!(pass.iter().all(|&i| i < 1000));

        // 100 * 0.29 is 28.999999999999996 in floating point
        let sampling: Sampling = "0.29".parse().unwrap();
        assert_eq!(sampling.pages_per_pass(100), 29);
        let passes = sample_pages(100, &sampling, &mut rng);
        assert_eq!(passes[0].len(), 29);
        let sampling: Sampling = ".07".parse().unwrap();
        assert_eq!(sampling.pages_per_pass(100), 7);
    }

    #[test]
    fn dense_fraction_still_exact() {
        let sampling: Sampling = "0.99".parse().unwrap();
        let mut rng = SimpleRng::new(7);
        let passes = sample_pages(101, &sampling, &mut rng);
        assert_eq!(passes[0].len(), 99);
    }

    #[test]
    fn later_passes_draw_fresh_pages() {
        let sampling: Sampling = "0.4:3".parse().unwrap();
        let mut rng = SimpleRng::new(3);
        let passes = sample_pages(10, &sampling, &mut rng);
        assert_eq!(passes[0].len(), 4);
        assert_eq!(passes[1].len(), 4);
        // only two pages left for the third pass
        assert_eq!(passes[2].len(), 2);
        let all: HashSet<u64> = passes.iter().flatten().copied().collect();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn same_seed_same_sample() {
        let sampling: Sampling = "0.05".parse().unwrap();
        let a = sample_pages(5000, &sampling, &mut SimpleRng::new(99));
        let b = sample_pages(5000, &sampling, &mut SimpleRng::new(99));
        assert_eq!(a, b);
    }
}
