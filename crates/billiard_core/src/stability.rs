//! Finite-time Lyapunov exponents of the one-return billiard map.
//!
//! Each surface point is perturbed along its two tangent directions; the
//! returned positions and directions are differenced to build 3×2 Jacobians,
//! from which a 2×2 Cauchy-Green tensor and its dominant eigenvalue follow.

use crate::flow::{bounce, resolve_seed, DirectionFrame, PhaseState, SeedSettings};
use crate::intersection::{project_to_surface, IntersectionSettings};
use crate::linalg::{
    cauchy_green, jacobian_columns, max_symmetric_eigenvalue, tangent_derivative, Vec3,
};
use crate::mesher::SurfaceMesh;
use crate::traits::ImplicitSurface;
use anyhow::{bail, Result};
use nalgebra::{Matrix2, Matrix3x2};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilitySettings {
    /// Tangent offset of the four neighbour seeds.
    pub kernel_distance: f64,
    pub advection_time: f64,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            kernel_distance: 1e-3,
            advection_time: 1.0,
        }
    }
}

impl StabilitySettings {
    pub fn validate(&self) -> Result<()> {
        if !self.kernel_distance.is_finite() || self.kernel_distance <= 0.0 {
            bail!("kernel_distance must be finite and positive.");
        }
        if !self.advection_time.is_finite() || self.advection_time <= 0.0 {
            bail!("advection_time must be finite and positive.");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityVariant {
    Combined,
    PositionOnly,
    VelocityOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityResult {
    pub combined: f64,
    pub position_only: f64,
    pub velocity_only: f64,
    /// Set when the centre flow, or both neighbours on one axis, failed.
    pub degenerate: bool,
}

impl StabilityResult {
    pub fn degenerate() -> Self {
        Self {
            combined: f64::NEG_INFINITY,
            position_only: f64::NEG_INFINITY,
            velocity_only: f64::NEG_INFINITY,
            degenerate: true,
        }
    }

    pub fn value(&self, variant: StabilityVariant) -> f64 {
        match variant {
            StabilityVariant::Combined => self.combined,
            StabilityVariant::PositionOnly => self.position_only,
            StabilityVariant::VelocityOnly => self.velocity_only,
        }
    }
}

/// `ln(sqrt(λmax)) / T`, or `-∞` when `λmax` is not a positive finite number.
pub fn ftle_from_tensor(tensor: &Matrix2<f64>, advection_time: f64) -> f64 {
    let lambda = max_symmetric_eigenvalue(tensor);
    if !lambda.is_finite() || lambda <= 0.0 {
        return f64::NEG_INFINITY;
    }
    0.5 * lambda.ln() / advection_time
}

struct Neighborhood {
    center: PhaseState,
    along_a: [Option<PhaseState>; 2],
    along_b: [Option<PhaseState>; 2],
}

fn one_return<S: ImplicitSurface + ?Sized>(
    surface: &S,
    position: Vec3,
    seed: &SeedSettings,
    intersection: &IntersectionSettings,
) -> Option<PhaseState> {
    let local = SeedSettings {
        position,
        frame: DirectionFrame::Local,
        ..*seed
    };
    let state = resolve_seed(surface, &local).ok()?;
    bounce(surface, &state, intersection).ok()
}

fn sample_neighborhood<S: ImplicitSurface + ?Sized>(
    surface: &S,
    point: &Vec3,
    seed: &SeedSettings,
    settings: &StabilitySettings,
    intersection: &IntersectionSettings,
) -> Option<Neighborhood> {
    let frame = surface.tangent_basis(point)?;
    let center = one_return(surface, *point, seed, intersection)?;
    let h = settings.kernel_distance;
    let projection = IntersectionSettings {
        step_size: h / 4.0,
        max_steps: 16,
        bisection_steps: intersection.bisection_steps,
    };
    let neighbor = |offset: Vec3| {
        let projected = project_to_surface(surface, &(point + offset), &projection).ok()?;
        one_return(surface, projected, seed, intersection)
    };
    Some(Neighborhood {
        center,
        along_a: [neighbor(-frame.tangent_a * h), neighbor(frame.tangent_a * h)],
        along_b: [neighbor(-frame.tangent_b * h), neighbor(frame.tangent_b * h)],
    })
}

fn jacobian(
    neighborhood: &Neighborhood,
    h: f64,
    component: fn(&PhaseState) -> Vec3,
) -> Option<Matrix3x2<f64>> {
    let center = component(&neighborhood.center);
    let derivative = |pair: &[Option<PhaseState>; 2]| {
        let minus = pair[0].as_ref().map(component);
        let plus = pair[1].as_ref().map(component);
        tangent_derivative(minus.as_ref(), &center, plus.as_ref(), h)
    };
    let d_a = derivative(&neighborhood.along_a)?;
    let d_b = derivative(&neighborhood.along_b)?;
    Some(jacobian_columns(&d_a, &d_b))
}

/// FTLE of the return map at a surface point.
///
/// The seed direction is read in the local frame of each sampled point; its
/// position is ignored.
pub fn analyze_point<S: ImplicitSurface + ?Sized>(
    surface: &S,
    point: &Vec3,
    seed: &SeedSettings,
    settings: &StabilitySettings,
    intersection: &IntersectionSettings,
) -> StabilityResult {
    let Some(neighborhood) = sample_neighborhood(surface, point, seed, settings, intersection)
    else {
        return StabilityResult::degenerate();
    };
    let h = settings.kernel_distance;
    let (Some(jx), Some(jv)) = (
        jacobian(&neighborhood, h, |s| s.position),
        jacobian(&neighborhood, h, |s| s.direction),
    ) else {
        return StabilityResult::degenerate();
    };
    let t = settings.advection_time;
    StabilityResult {
        combined: ftle_from_tensor(&cauchy_green(&[&jx, &jv]), t),
        position_only: ftle_from_tensor(&cauchy_green(&[&jx]), t),
        velocity_only: ftle_from_tensor(&cauchy_green(&[&jv]), t),
        degenerate: false,
    }
}

/// Per-vertex FTLE over a mesh. Vertices are independent.
pub fn analyze_mesh<S: ImplicitSurface + ?Sized>(
    surface: &S,
    mesh: &SurfaceMesh,
    seed: &SeedSettings,
    settings: &StabilitySettings,
    intersection: &IntersectionSettings,
) -> Vec<StabilityResult> {
    mesh.positions
        .iter()
        .map(|p| analyze_point(surface, p, seed, settings, intersection))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::VelocityMode;
    use crate::mesher::{build_mesh, MeshDomain};
    use crate::surface::Ellipsoid;

    fn normal_seed() -> SeedSettings {
        SeedSettings {
            position: Vec3::zeros(),
            direction: Vec3::new(0.0, 0.0, 1.0),
            frame: DirectionFrame::Local,
            velocity: VelocityMode::ConstantSpeed { speed: 1.0 },
        }
    }

    fn precise() -> IntersectionSettings {
        IntersectionSettings {
            step_size: 0.01,
            max_steps: 1000,
            bisection_steps: 40,
        }
    }

    #[test]
    fn zero_tensor_gives_negative_infinity() {
        assert_eq!(ftle_from_tensor(&Matrix2::zeros(), 1.0), f64::NEG_INFINITY);
        let nan = Matrix2::new(f64::NAN, 0.0, 0.0, 1.0);
        assert_eq!(ftle_from_tensor(&nan, 1.0), f64::NEG_INFINITY);
    }

    #[test]
    fn ftle_scales_with_advection_time() {
        let c = Matrix2::new(4.0, 0.0, 0.0, 1.0);
        let one = ftle_from_tensor(&c, 1.0);
        assert!((one - 2f64.ln()).abs() < 1e-12);
        assert!((ftle_from_tensor(&c, 2.0) - one / 2.0).abs() < 1e-12);
    }

    #[test]
    fn sphere_normal_shots_map_to_antipodes() {
        // Normal shots on the unit sphere land at the antipode and leave along
        // the outward radius there, so both Jacobians are isometries.
        let sphere = Ellipsoid::new(1.0, 1.0, 1.0).unwrap();
        let result = analyze_point(
            &sphere,
            &Vec3::new(0.6, 0.0, 0.8),
            &normal_seed(),
            &StabilitySettings::default(),
            &precise(),
        );
        assert!(!result.degenerate);
        assert!(result.position_only.abs() < 1e-4, "{result:?}");
        assert!(result.velocity_only.abs() < 1e-4, "{result:?}");
        assert!((result.combined - 0.5 * 2f64.ln()).abs() < 1e-4, "{result:?}");
        assert_eq!(result.value(StabilityVariant::Combined), result.combined);
    }

    #[test]
    fn failed_center_flow_is_degenerate() {
        let sphere = Ellipsoid::new(1.0, 1.0, 1.0).unwrap();
        let starved = IntersectionSettings {
            step_size: 0.01,
            max_steps: 3,
            bisection_steps: 8,
        };
        let result = analyze_point(
            &sphere,
            &Vec3::new(0.0, 0.0, 1.0),
            &normal_seed(),
            &StabilitySettings::default(),
            &starved,
        );
        assert!(result.degenerate);
        assert_eq!(result.combined, f64::NEG_INFINITY);
        assert_eq!(result.position_only, f64::NEG_INFINITY);
        assert_eq!(result.velocity_only, f64::NEG_INFINITY);
    }

    #[test]
    fn zero_gradient_point_is_degenerate() {
        let sphere = Ellipsoid::new(1.0, 1.0, 1.0).unwrap();
        let result = analyze_point(
            &sphere,
            &Vec3::zeros(),
            &normal_seed(),
            &StabilitySettings::default(),
            &precise(),
        );
        assert_eq!(result, StabilityResult::degenerate());
    }

    #[test]
    fn mesh_analysis_covers_every_vertex() {
        let surface = Ellipsoid::new(1.5, 1.0, 0.8).unwrap();
        let domain = MeshDomain {
            min: Vec3::new(-2.0, -1.5, -1.0),
            max: Vec3::new(2.0, 1.5, 1.0),
            resolution: [9, 7, 5],
        };
        let mesh = build_mesh(&surface, &domain).unwrap();
        let seed = SeedSettings {
            direction: Vec3::new(0.3, 0.2, 1.0),
            ..normal_seed()
        };
        let results = analyze_mesh(
            &surface,
            &mesh,
            &seed,
            &StabilitySettings::default(),
            &IntersectionSettings::default(),
        );
        assert_eq!(results.len(), mesh.vertex_count());
        assert!(results.iter().any(|r| !r.degenerate && r.combined.is_finite()));
    }

    #[test]
    fn settings_validation() {
        assert!(StabilitySettings::default().validate().is_ok());
        let bad = StabilitySettings {
            advection_time: 0.0,
            ..StabilitySettings::default()
        };
        assert!(bad.validate().is_err());
        let bad = StabilitySettings {
            kernel_distance: f64::NAN,
            ..StabilitySettings::default()
        };
        assert!(bad.validate().is_err());
    }
}
