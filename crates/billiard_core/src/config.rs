use crate::flow::{FlowSettings, SeedSettings, VelocityMode};
use crate::linalg::Vec3;
use crate::mesher::MeshDomain;
use crate::stability::StabilitySettings;
use crate::surface::{Surface, SurfaceParameters};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Every input of one engine computation. Missing JSON fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub surface: SurfaceParameters,
    pub domain: MeshDomain,
    pub flow: FlowSettings,
    pub seed: SeedSettings,
    pub stability: StabilitySettings,
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).context("Failed to parse engine configuration JSON.")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize engine configuration.")
    }

    pub fn validate(&self) -> Result<()> {
        Surface::from_parameters(&self.surface).context("Invalid surface parameters.")?;
        self.domain.validate().context("Invalid mesh domain.")?;
        self.flow.validate().context("Invalid flow settings.")?;
        validate_seed(&self.seed).context("Invalid seed.")?;
        self.stability.validate().context("Invalid stability settings.")?;
        Ok(())
    }
}

fn validate_seed(seed: &SeedSettings) -> Result<()> {
    let finite = |v: &Vec3| v.iter().all(|c| c.is_finite());
    if !finite(&seed.position) || !finite(&seed.direction) {
        bail!("Seed position and direction must be finite.");
    }
    match seed.velocity {
        VelocityMode::ConstantSpeed { speed } => {
            if !speed.is_finite() || speed <= 0.0 {
                bail!("Constant speed must be finite and positive.");
            }
        }
        VelocityMode::ConstantEnergy { energy, potential } => {
            if !energy.is_finite() {
                bail!("Seed energy must be finite.");
            }
            if !(0.0..=1.0).contains(&potential.mass_ratio) {
                bail!("mass_ratio must lie in [0, 1].");
            }
            if !potential.angular_velocity.is_finite() {
                bail!("angular_velocity must be finite.");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::RotatingPotential;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        let chain = format!("{err:#}");
        assert!(chain.contains(needle), "error `{chain}` does not mention `{needle}`");
    }

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "surface": { "surface_type": "torus", "major_radius": 2.0, "minor_radius": 0.5 },
                "flow": {
                    "intersection": { "step_size": 0.02, "max_steps": 500, "number_of_bisection_steps": 12 },
                    "number_of_intersections": 7
                }
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.surface,
            SurfaceParameters::Torus {
                major_radius: 2.0,
                minor_radius: 0.5
            }
        );
        assert_eq!(config.flow.intersection.bisection_steps, 12);
        assert_eq!(config.flow.number_of_intersections, 7);
        assert_eq!(config.domain, MeshDomain::default());
        assert_eq!(config.stability, StabilitySettings::default());
    }

    #[test]
    fn json_round_trip_preserves_config() {
        let mut config = EngineConfig::default();
        config.seed.velocity = VelocityMode::ConstantEnergy {
            energy: -1.2,
            potential: RotatingPotential {
                mass_ratio: 0.1,
                angular_velocity: 0.5,
            },
        };
        let text = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn invalid_sections_are_reported_with_context() {
        let mut config = EngineConfig::default();
        config.surface = SurfaceParameters::Ellipsoid {
            a: -1.0,
            b: 1.0,
            c: 1.0,
        };
        assert_err_contains(config.validate(), "Invalid surface parameters");

        let mut config = EngineConfig::default();
        config.domain.resolution = [1, 8, 8];
        assert_err_contains(config.validate(), "at least 2 samples");

        let mut config = EngineConfig::default();
        config.flow.number_of_intersections = 0;
        assert_err_contains(config.validate(), "number_of_intersections");

        let mut config = EngineConfig::default();
        config.seed.velocity = VelocityMode::ConstantEnergy {
            energy: 0.0,
            potential: RotatingPotential {
                mass_ratio: 1.5,
                angular_velocity: 1.0,
            },
        };
        assert_err_contains(config.validate(), "mass_ratio");

        let mut config = EngineConfig::default();
        config.stability.kernel_distance = 0.0;
        assert_err_contains(config.validate(), "kernel_distance");
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert_err_contains(EngineConfig::from_json("{ not json"), "parse engine configuration");
    }
}
