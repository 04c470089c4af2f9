//! Random generators and variates.
//!
//! Two small families behind traits: generators produce raw uniform
//! integers, variates shape them into a distribution via inverse-CDF (or
//! summation for Erlang, Box-Muller for normal). Generator and variate
//! classes are closed sets constructed from configuration specs; seeds
//! make runs reproducible.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::config::{RandGenSpec, RandVarSpec};
use crate::errors::{Error, Result};
use crate::time;

/// Uniform integer source.
///
/// `generate` returns a nonnegative integer not exceeding `max`;
/// `generate_double` maps it into `[0, 1)`.
pub trait RandomGen: Send {
    fn generate(&mut self) -> u64;

    fn max(&self) -> u64;

    fn generate_double(&mut self) -> f64 {
        // max() + 1 may overflow u64; go through f64 where the +1 is exact
        // enough for the 48..64 bit ranges the classes use.
        self.generate() as f64 / (self.max() as f64 + 1.0)
    }
}

/// Linear congruential generator (MMIX constants), 48 significant bits.
pub struct LcgGen {
    state: u64,
}

const LCG_A: u64 = 6364136223846793005;
const LCG_C: u64 = 1442695040888963407;
const LCG_MAX: u64 = (1u64 << 48) - 1;

impl LcgGen {
    pub fn new(seed: u64) -> LcgGen {
        LcgGen { state: seed }
    }
}

impl RandomGen for LcgGen {
    fn generate(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(LCG_A).wrapping_add(LCG_C);
        // Low bits of an LCG are weak; keep the high 48.
        self.state >> 16
    }

    fn max(&self) -> u64 {
        LCG_MAX
    }
}

/// Platform-quality generator backed by `rand`'s `StdRng`.
pub struct StdGen {
    rng: StdRng,
}

impl StdGen {
    pub fn new(seed: u64) -> StdGen {
        StdGen {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomGen for StdGen {
    fn generate(&mut self) -> u64 {
        self.rng.next_u64() >> 1
    }

    fn max(&self) -> u64 {
        u64::MAX >> 1
    }
}

/// Build a generator from its spec. Unknown classes are rejected.
pub fn create_generator(spec: &RandGenSpec) -> Result<Box<dyn RandomGen>> {
    let seed = spec.seed.unwrap_or_else(|| time::now_wall() as u64);
    match spec.class.as_str() {
        "lcg" => Ok(Box::new(LcgGen::new(seed))),
        "std" => Ok(Box::new(StdGen::new(seed))),
        other => Err(Error::invalid_value(
            "randgen.class",
            format!("unknown generator class '{other}'"),
        )),
    }
}

/// Distribution over a generator's uniform output.
pub trait RandomVariate: Send {
    fn sample(&mut self, rg: &mut dyn RandomGen) -> f64;

    /// Expected value, used by schedulers for scope clamping.
    fn mean(&self) -> f64;
}

pub struct Exponential {
    rate: f64,
}

impl Exponential {
    pub fn new(rate: f64) -> Result<Exponential> {
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(Error::invalid_value(
                "exponential.rate",
                format!("rate must be positive, got {rate}"),
            ));
        }
        Ok(Exponential { rate })
    }
}

impl RandomVariate for Exponential {
    fn sample(&mut self, rg: &mut dyn RandomGen) -> f64 {
        let u = rg.generate_double();
        -(1.0 - u).ln() / self.rate
    }

    fn mean(&self) -> f64 {
        1.0 / self.rate
    }
}

pub struct Uniform {
    min: f64,
    max: f64,
}

impl Uniform {
    pub fn new(min: f64, max: f64) -> Result<Uniform> {
        if !(min < max) || !min.is_finite() || !max.is_finite() {
            return Err(Error::invalid_value(
                "uniform",
                format!("requires min < max, got [{min}, {max})"),
            ));
        }
        Ok(Uniform { min, max })
    }
}

impl RandomVariate for Uniform {
    fn sample(&mut self, rg: &mut dyn RandomGen) -> f64 {
        self.min + rg.generate_double() * (self.max - self.min)
    }

    fn mean(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

/// Erlang-k: sum of `shape` independent exponentials.
pub struct Erlang {
    shape: u32,
    rate: f64,
}

impl Erlang {
    pub fn new(shape: u32, rate: f64) -> Result<Erlang> {
        if shape == 0 {
            return Err(Error::invalid_value(
                "erlang.shape",
                "shape must be at least 1",
            ));
        }
        if !(rate > 0.0) || !rate.is_finite() {
            return Err(Error::invalid_value(
                "erlang.rate",
                format!("rate must be positive, got {rate}"),
            ));
        }
        Ok(Erlang { shape, rate })
    }
}

impl RandomVariate for Erlang {
    fn sample(&mut self, rg: &mut dyn RandomGen) -> f64 {
        let mut acc = 0.0;
        for _ in 0..self.shape {
            let u = rg.generate_double();
            acc += -(1.0 - u).ln();
        }
        acc / self.rate
    }

    fn mean(&self) -> f64 {
        self.shape as f64 / self.rate
    }
}

/// Normal distribution via Box-Muller, one spare sample cached.
pub struct Normal {
    mean: f64,
    stddev: f64,
    spare: Option<f64>,
}

impl Normal {
    pub fn new(mean: f64, stddev: f64) -> Result<Normal> {
        if !(stddev > 0.0) || !stddev.is_finite() || !mean.is_finite() {
            return Err(Error::invalid_value(
                "normal",
                format!("requires finite mean and positive stddev, got ({mean}, {stddev})"),
            ));
        }
        Ok(Normal {
            mean,
            stddev,
            spare: None,
        })
    }
}

impl RandomVariate for Normal {
    fn sample(&mut self, rg: &mut dyn RandomGen) -> f64 {
        if let Some(z) = self.spare.take() {
            return self.mean + self.stddev * z;
        }
        // u1 must be nonzero for the log.
        let mut u1 = rg.generate_double();
        if u1 <= f64::MIN_POSITIVE {
            u1 = f64::MIN_POSITIVE;
        }
        let u2 = rg.generate_double();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare = Some(r * theta.sin());
        self.mean + self.stddev * r * theta.cos()
    }

    fn mean(&self) -> f64 {
        self.mean
    }
}

/// Build a variate from its spec, checking parameter ranges.
pub fn create_variate(spec: &RandVarSpec) -> Result<Box<dyn RandomVariate>> {
    match *spec {
        RandVarSpec::Exponential { rate } => Ok(Box::new(Exponential::new(rate)?)),
        RandVarSpec::Uniform { min, max } => Ok(Box::new(Uniform::new(min, max)?)),
        RandVarSpec::Erlang { shape, rate } => Ok(Box::new(Erlang::new(shape, rate)?)),
        RandVarSpec::Normal { mean, stddev } => Ok(Box::new(Normal::new(mean, stddev)?)),
    }
}
