//! Weight and bias initializers.
use anyhow::{bail, Result};
use derive_more::Display;
use rand::{distributions::Distribution, Rng};
use rand_distr::{Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Which fan a variance scaling filler divides by.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FillerMode {
    /// `(fan_in + fan_out) / 2`
    Avg,
    /// `fan_in`
    #[default]
    In,
    /// `fan_out`
    Out,
}

impl FillerMode {
    fn fan(self, fan_in: usize, fan_out: usize) -> f32 {
        let fan = match self {
            Self::Avg => (fan_in + fan_out) as f32 / 2.,
            Self::In => fan_in as f32,
            Self::Out => fan_out as f32,
        };
        fan.max(1.)
    }
}

impl FromStr for FillerMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        crate::engine::parse_variant(
            s,
            &[("Avg", Self::Avg), ("In", Self::In), ("Out", Self::Out)],
            "filler mode",
        )
    }
}

/// Initializer for a parameter tensor.
///
/// Textual form is `Name` or `Name(args)`, for example `HeNormal(In,1.0)`, `Uniform(0.05)` or
/// `Constant(0)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filler {
    /// Every element is `value`.
    Constant(f32),
    /// `N(0, gain * sqrt(2 / fan))`.
    HeNormal(FillerMode, f32),
    /// `U(-l, l)`, `l = gain * sqrt(6 / fan)`.
    HeUniform(FillerMode, f32),
    /// `N(0, gain * sqrt(1 / fan))`.
    LeCunNormal(FillerMode, f32),
    /// `U(-l, l)`, `l = gain * sqrt(3 / fan)`.
    LeCunUniform(FillerMode, f32),
    /// LeCun normal over the average fan by default.
    XavierNormal(FillerMode, f32),
    /// LeCun uniform over the average fan by default.
    XavierUniform(FillerMode, f32),
    /// `N(0, stddev)`.
    Normal(f32),
    /// `N(0, stddev)` redrawn outside two standard deviations.
    TruncatedNormal(f32),
    /// `U(-limit, limit)`.
    Uniform(f32),
}

impl Default for Filler {
    fn default() -> Self {
        Self::HeNormal(FillerMode::In, 1.)
    }
}

/// Distribution drawn from by a [`Filler`].
enum Sampler {
    Constant(f32),
    Normal(Normal<f32>),
    Truncated(Normal<f32>, f32),
    Uniform(Uniform<f32>),
}

impl Sampler {
    fn sample<R: Rng>(&self, rng: &mut R) -> f32 {
        match self {
            Self::Constant(x) => *x,
            Self::Normal(normal) => normal.sample(rng),
            Self::Truncated(normal, limit) => loop {
                let x = normal.sample(rng);
                if x.abs() <= *limit {
                    break x;
                }
            },
            Self::Uniform(uniform) => uniform.sample(rng),
        }
    }
}

fn uniform(limit: f32) -> Sampler {
    if limit > 0. {
        Sampler::Uniform(Uniform::new_inclusive(-limit, limit))
    } else {
        Sampler::Constant(0.)
    }
}

impl Filler {
    fn sampler(&self, fan_in: usize, fan_out: usize) -> Result<Sampler> {
        let sampler = match *self {
            Self::Constant(x) => Sampler::Constant(x),
            Self::HeNormal(mode, gain) => {
                Sampler::Normal(Normal::new(0., gain * (2. / mode.fan(fan_in, fan_out)).sqrt())?)
            }
            Self::HeUniform(mode, gain) => uniform(gain * (6. / mode.fan(fan_in, fan_out)).sqrt()),
            Self::LeCunNormal(mode, gain) | Self::XavierNormal(mode, gain) => {
                Sampler::Normal(Normal::new(0., gain * (1. / mode.fan(fan_in, fan_out)).sqrt())?)
            }
            Self::LeCunUniform(mode, gain) | Self::XavierUniform(mode, gain) => {
                uniform(gain * (3. / mode.fan(fan_in, fan_out)).sqrt())
            }
            Self::Normal(stddev) => Sampler::Normal(Normal::new(0., stddev)?),
            Self::TruncatedNormal(stddev) => {
                Sampler::Truncated(Normal::new(0., stddev)?, 2. * stddev.abs())
            }
            Self::Uniform(limit) => uniform(limit),
        };
        Ok(sampler)
    }
    /// Fills `data` with `rng`.
    ///
    /// **Errors**
    ///
    /// The distribution parameters are invalid (ie a NaN standard deviation).
    pub fn fill_with<R: Rng>(
        &self,
        data: &mut [f32],
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
    ) -> Result<()> {
        let sampler = self.sampler(fan_in, fan_out)?;
        data.iter_mut().for_each(|x| *x = sampler.sample(rng));
        Ok(())
    }
    /// Fills `data` with the thread rng.
    pub fn fill(&self, data: &mut [f32], fan_in: usize, fan_out: usize) -> Result<()> {
        self.fill_with(data, fan_in, fan_out, &mut rand::thread_rng())
    }
}

fn parse_f32(s: &str) -> Result<f32> {
    match s.trim().parse::<f32>() {
        Ok(x) if x.is_finite() => Ok(x),
        _ => bail!("Invalid number {s:?}!"),
    }
}

impl FromStr for Filler {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let (name, args) = match s.find('(') {
            Some(open) => {
                let Some(args) = s[open + 1..].strip_suffix(')') else {
                    bail!("Filler {s:?} is missing ')'!");
                };
                (&s[..open], args.split(',').map(str::trim).collect::<Vec<_>>())
            }
            None => (s, Vec::new()),
        };
        let scalar = |default: f32| -> Result<f32> {
            match args.as_slice() {
                [] => Ok(default),
                [x] => parse_f32(x),
                _ => bail!("Filler {name} takes one argument!"),
            }
        };
        let scaling = |default: FillerMode| -> Result<(FillerMode, f32)> {
            match args.as_slice() {
                [] => Ok((default, 1.)),
                [mode] => Ok((mode.parse()?, 1.)),
                [mode, gain] => Ok((mode.parse()?, parse_f32(gain)?)),
                _ => bail!("Filler {name} takes a mode and a gain!"),
            }
        };
        let filler = match name {
            "Constant" => Self::Constant(scalar(0.)?),
            "HeNormal" => {
                let (mode, gain) = scaling(FillerMode::In)?;
                Self::HeNormal(mode, gain)
            }
            "HeUniform" => {
                let (mode, gain) = scaling(FillerMode::In)?;
                Self::HeUniform(mode, gain)
            }
            "LeCunNormal" => {
                let (mode, gain) = scaling(FillerMode::In)?;
                Self::LeCunNormal(mode, gain)
            }
            "LeCunUniform" => {
                let (mode, gain) = scaling(FillerMode::In)?;
                Self::LeCunUniform(mode, gain)
            }
            "XavierNormal" => {
                let (mode, gain) = scaling(FillerMode::Avg)?;
                Self::XavierNormal(mode, gain)
            }
            "XavierUniform" => {
                let (mode, gain) = scaling(FillerMode::Avg)?;
                Self::XavierUniform(mode, gain)
            }
            "Normal" => Self::Normal(scalar(0.05)?),
            "TruncatedNormal" => Self::TruncatedNormal(scalar(0.05)?),
            "Uniform" => Self::Uniform(scalar(0.05)?),
            _ => bail!("Unknown filler {name:?}!"),
        };
        Ok(filler)
    }
}

impl fmt::Display for Filler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Constant(x) => write!(f, "Constant({x})"),
            Self::HeNormal(mode, gain) => write!(f, "HeNormal({mode},{gain})"),
            Self::HeUniform(mode, gain) => write!(f, "HeUniform({mode},{gain})"),
            Self::LeCunNormal(mode, gain) => write!(f, "LeCunNormal({mode},{gain})"),
            Self::LeCunUniform(mode, gain) => write!(f, "LeCunUniform({mode},{gain})"),
            Self::XavierNormal(mode, gain) => write!(f, "XavierNormal({mode},{gain})"),
            Self::XavierUniform(mode, gain) => write!(f, "XavierUniform({mode},{gain})"),
            Self::Normal(x) => write!(f, "Normal({x})"),
            Self::TruncatedNormal(x) => write!(f, "TruncatedNormal({x})"),
            Self::Uniform(x) => write!(f, "Uniform({x})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn parse_defaults_and_arguments() -> Result<()> {
        assert_eq!("HeNormal".parse::<Filler>()?, Filler::HeNormal(FillerMode::In, 1.));
        assert_eq!(
            "HeNormal(Out,2.0)".parse::<Filler>()?,
            Filler::HeNormal(FillerMode::Out, 2.)
        );
        assert_eq!(
            "XavierUniform".parse::<Filler>()?,
            Filler::XavierUniform(FillerMode::Avg, 1.)
        );
        assert_eq!("Uniform(0.1)".parse::<Filler>()?, Filler::Uniform(0.1));
        assert_eq!("Constant".parse::<Filler>()?, Filler::Constant(0.));
        assert!("HeNormal(Sideways)".parse::<Filler>().is_err());
        assert!("Uniform(0.1".parse::<Filler>().is_err());
        assert!("Gaussian".parse::<Filler>().is_err());
        Ok(())
    }

    #[test]
    fn display_round_trips() -> Result<()> {
        for filler in [
            Filler::Constant(0.5),
            Filler::LeCunUniform(FillerMode::Avg, 1.5),
            Filler::TruncatedNormal(0.01),
        ] {
            assert_eq!(filler.to_string().parse::<Filler>()?, filler);
        }
        Ok(())
    }

    #[test]
    fn samples_respect_limits() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(100);
        let mut x = vec![0f32; 4096];
        Filler::HeUniform(FillerMode::In, 1.).fill_with(&mut x, 24, 12, &mut rng)?;
        let limit = (6f32 / 24.).sqrt();
        assert!(x.iter().all(|x| x.abs() <= limit));
        Filler::TruncatedNormal(0.1).fill_with(&mut x, 1, 1, &mut rng)?;
        assert!(x.iter().all(|x| x.abs() <= 0.2));
        let mean = x.iter().sum::<f32>() / x.len() as f32;
        assert!(mean.abs() < 0.01);
        Filler::Constant(0.25).fill_with(&mut x, 1, 1, &mut rng)?;
        assert!(x.iter().all(|x| *x == 0.25));
        Ok(())
    }
}
