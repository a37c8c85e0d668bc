// ekf_sim/src/simulation/prng.rs

use ekf_core::types::{Vector2f, Vector3f};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, NormalError};

use crate::errors::{SimError, SimResult};

/// The deterministic noise source of a run.
#[derive(Debug, Clone)]
pub struct SimulationRng(pub ChaCha8Rng);

impl SimulationRng {
    pub fn from_seed(seed: u64) -> Self {
        Self(ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn sample(&mut self, noise: &Normal<f32>) -> f32 {
        noise.sample(&mut self.0)
    }

    pub fn vector2(&mut self, noise: &Normal<f32>) -> Vector2f {
        Vector2f::new(self.sample(noise), self.sample(noise))
    }

    pub fn vector3(&mut self, noise: &Normal<f32>) -> Vector3f {
        Vector3f::new(self.sample(noise), self.sample(noise), self.sample(noise))
    }
}

/// Zero mean noise with standard deviation `std_dev`.
///
/// `Normal::new` accepts a negative deviation and mirrors it, so the sign is
/// checked here.
pub fn zero_mean(sensor: &'static str, std_dev: f32) -> SimResult<Normal<f32>> {
    if !(std_dev >= 0.0) {
        return Err(SimError::Noise {
            sensor,
            source: NormalError::BadVariance,
        });
    }
    Normal::new(0.0, std_dev).map_err(|source| SimError::Noise { sensor, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() {
        let noise = zero_mean("test", 1.0).expect("valid deviation");
        let mut a = SimulationRng::from_seed(3);
        let mut b = SimulationRng::from_seed(3);
        assert_eq!(a.vector3(&noise), b.vector3(&noise));
    }

    #[test]
    fn negative_deviation_is_rejected() {
        assert!(matches!(zero_mean("baro", -1.0), Err(SimError::Noise { sensor: "baro", .. })));
        assert!(matches!(zero_mean("baro", f32::NAN), Err(SimError::Noise { .. })));
    }

    #[test]
    fn zero_deviation_is_allowed() {
        let noise = zero_mean("gps", 0.0).expect("noiseless sensor");
        assert_eq!(SimulationRng::from_seed(9).sample(&noise), 0.0);
    }
}
