// Randomized intervals and delays used to keep request timing irregular.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RandomizerConfig;

/// Distribution family used for intervals and delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Strategy {
    Poisson,
    Uniform,
    Normal,
    Exponential,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Poisson => "poisson",
            Strategy::Uniform => "uniform",
            Strategy::Normal => "normal",
            Strategy::Exponential => "exponential",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poisson" => Ok(Strategy::Poisson),
            "uniform" => Ok(Strategy::Uniform),
            "normal" => Ok(Strategy::Normal),
            "exponential" => Ok(Strategy::Exponential),
            other => Err(format!("unknown randomization strategy {:?}", other)),
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Strategy> for String {
    fn from(value: Strategy) -> Self {
        value.as_str().to_string()
    }
}

/// Source of randomized durations. One instance is shared process-wide; its
/// generator is the only state carried between calls.
pub struct Randomizer {
    rng: Mutex<StdRng>,
    min_factor: f64,
    max_factor: f64,
    poisson_min_factor: f64,
}

impl Randomizer {
    pub fn new(config: &RandomizerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng: Mutex::new(rng),
            min_factor: config.min_factor,
            max_factor: config.max_factor,
            poisson_min_factor: config.poisson_min_factor,
        }
    }

    /// Deterministic randomizer with default factors.
    pub fn seeded(seed: u64) -> Self {
        Self::new(&RandomizerConfig {
            seed: Some(seed),
            ..RandomizerConfig::default()
        })
    }

    /// Next scheduling interval around `base`.
    ///
    /// Poisson draws `-ln(1-U) * base` and only clamps from below, so long
    /// gaps stay possible. The other strategies stay inside
    /// `[base * min_factor, base * max_factor]`.
    pub fn next_interval(&self, base: Duration, strategy: Strategy) -> Duration {
        let min = base.mul_f64(self.min_factor);
        let max = base.mul_f64(self.max_factor);
        let interval = match strategy {
            Strategy::Poisson => {
                let floor = base.mul_f64(self.poisson_min_factor);
                let drawn = secs(self.unit_exponential() * base.as_secs_f64());
                drawn.max(floor)
            }
            Strategy::Uniform => self.uniform(min, max),
            Strategy::Normal => self.bounded_normal(min, max),
            Strategy::Exponential => {
                self.bounded_tail(min, max, max.saturating_sub(min).as_secs_f64() / 3.0)
            }
        };
        debug!(
            "next interval strategy={} base_s={:.1} result_s={:.1}",
            strategy,
            base.as_secs_f64(),
            interval.as_secs_f64()
        );
        interval
    }

    /// Delay bounded to `[min, max]` for every strategy.
    pub fn next_delay(&self, min: Duration, max: Duration, strategy: Strategy) -> Duration {
        if max <= min {
            return min;
        }
        let span = (max - min).as_secs_f64();
        match strategy {
            Strategy::Uniform => self.uniform(min, max),
            Strategy::Normal => self.bounded_normal(min, max),
            Strategy::Exponential => self.bounded_tail(min, max, span / 3.0),
            Strategy::Poisson => self.bounded_tail(min, max, span / 2.0),
        }
    }

    /// Scale `d` by a uniform factor in `[low, high]`.
    pub fn jitter(&self, d: Duration, low: f64, high: f64) -> Duration {
        if high <= low {
            return d.mul_f64(low.max(0.0));
        }
        let factor = self.rng.lock().random_range(low..=high);
        d.mul_f64(factor)
    }

    fn unit_exponential(&self) -> f64 {
        let u: f64 = self.rng.lock().random();
        -(1.0 - u).ln()
    }

    fn uniform(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let s = self
            .rng
            .lock()
            .random_range(min.as_secs_f64()..=max.as_secs_f64());
        secs(s).clamp(min, max)
    }

    /// Normal around the midpoint with σ = span/6, resampled until inside the range.
    fn bounded_normal(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let lo = min.as_secs_f64();
        let hi = max.as_secs_f64();
        let mid = (lo + hi) / 2.0;
        let normal = match Normal::new(mid, (hi - lo) / 6.0) {
            Ok(n) => n,
            Err(_) => return secs(mid),
        };
        let mut rng = self.rng.lock();
        loop {
            let v = normal.sample(&mut *rng);
            if v >= lo && v <= hi {
                return secs(v).clamp(min, max);
            }
        }
    }

    /// `min + Exp(scale)`, resampled until `<= max`.
    fn bounded_tail(&self, min: Duration, max: Duration, scale: f64) -> Duration {
        if max <= min || scale <= 0.0 {
            return min;
        }
        let exp = match Exp::new(1.0 / scale) {
            Ok(e) => e,
            Err(_) => return min,
        };
        let lo = min.as_secs_f64();
        let hi = max.as_secs_f64();
        let mut rng = self.rng.lock();
        loop {
            let v = lo + exp.sample(&mut *rng);
            if v <= hi {
                return secs(v).clamp(min, max);
            }
        }
    }
}

fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v.max(0.0)).unwrap_or(Duration::MAX)
}
