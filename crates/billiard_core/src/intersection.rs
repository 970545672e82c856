//! Ray/surface intersection by fixed-step marching and bisection.
//!
//! The march brackets the first sign change of the surface field along the
//! ray; bisection then shrinks the bracket to `step_size / 2^bisection_steps`.
//! The point handed back is always the endpoint inside the solid, so a flight
//! segment started from it begins strictly inside.

use crate::linalg::{normalize, Vec3};
use crate::traits::ImplicitSurface;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntersectionSettings {
    /// Marching increment, in world units.
    pub step_size: f64,
    /// Sample budget; at most `max_steps - 1` samples past the origin are taken.
    pub max_steps: usize,
    #[serde(alias = "number_of_bisection_steps")]
    pub bisection_steps: usize,
}

impl Default for IntersectionSettings {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            max_steps: 2000,
            bisection_steps: 16,
        }
    }
}

impl IntersectionSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.step_size.is_finite() || self.step_size <= 0.0 {
            bail!("step_size must be finite and positive.");
        }
        if self.max_steps < 2 {
            bail!("max_steps must be at least 2.");
        }
        if self.bisection_steps > 64 {
            bail!("bisection_steps above 64 cannot improve an f64 bracket.");
        }
        Ok(())
    }

    /// Upper bound on the distance between a returned point and the crossing.
    pub fn tolerance(&self) -> f64 {
        self.step_size / 2f64.powi(self.bisection_steps as i32)
    }
}

/// Which side of the surface the search starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSide {
    FromInside,
    FromOutside,
}

impl SearchSide {
    fn is_post_crossing(self, value: f64) -> bool {
        match self {
            SearchSide::FromInside => value >= 0.0,
            SearchSide::FromOutside => value < 0.0,
        }
    }
}

/// A refined bracket around a surface crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    /// Inside endpoint of the final bracket; the approximate intersection.
    pub point: Vec3,
    /// Outside endpoint of the final bracket.
    pub outside: Vec3,
    /// Number of marching steps taken before the sign change.
    pub steps: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchFailure {
    #[error("No surface crossing found within {max_steps} steps.")]
    NoIntersectionFound { max_steps: usize },
    #[error("Surface value is not finite at marching step {step}.")]
    NonFiniteValue { step: usize },
    #[error("Search direction has zero length.")]
    DegenerateDirection,
    #[error("Surface gradient vanishes at the hit point.")]
    ZeroGradient,
}

/// Finds the first crossing of the surface along `origin + t * direction`.
pub fn find_crossing<S: ImplicitSurface + ?Sized>(
    surface: &S,
    origin: &Vec3,
    direction: &Vec3,
    side: SearchSide,
    settings: &IntersectionSettings,
) -> Result<Crossing, SearchFailure> {
    let unit = normalize(direction).ok_or(SearchFailure::DegenerateDirection)?;
    let delta = unit * settings.step_size;

    let mut last_pre = *origin;
    let mut bracket = None;
    for step in 1..settings.max_steps {
        let sample = origin + delta * step as f64;
        let value = surface.value(&sample);
        if !value.is_finite() {
            return Err(SearchFailure::NonFiniteValue { step });
        }
        if side.is_post_crossing(value) {
            bracket = Some((sample, step));
            break;
        }
        last_pre = sample;
    }
    let (post, steps) = bracket.ok_or(SearchFailure::NoIntersectionFound {
        max_steps: settings.max_steps,
    })?;

    let (mut inside, mut outside) = match side {
        SearchSide::FromInside => (last_pre, post),
        SearchSide::FromOutside => (post, last_pre),
    };
    for _ in 0..settings.bisection_steps {
        let mid = (inside + outside) * 0.5;
        let value = surface.value(&mid);
        if !value.is_finite() {
            return Err(SearchFailure::NonFiniteValue { step: steps });
        }
        if value >= 0.0 {
            outside = mid;
        } else {
            inside = mid;
        }
    }

    Ok(Crossing {
        point: inside,
        outside,
        steps,
    })
}

/// Moves `p` onto the surface along its gradient line.
///
/// Inside points march along the gradient, outside points against it; the
/// inside endpoint of the refined bracket is returned.
pub fn project_to_surface<S: ImplicitSurface + ?Sized>(
    surface: &S,
    p: &Vec3,
    settings: &IntersectionSettings,
) -> Result<Vec3, SearchFailure> {
    let value = surface.value(p);
    if !value.is_finite() {
        return Err(SearchFailure::NonFiniteValue { step: 0 });
    }
    let gradient = surface.gradient(p);
    let (direction, side) = if value < 0.0 {
        (gradient, SearchSide::FromInside)
    } else {
        (-gradient, SearchSide::FromOutside)
    };
    find_crossing(surface, p, &direction, side, settings)
        .map(|crossing| crossing.point)
        .map_err(|failure| match failure {
            SearchFailure::DegenerateDirection => SearchFailure::ZeroGradient,
            other => other,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{Ellipsoid, Torus};

    struct NanBeyond {
        limit: f64,
    }

    impl ImplicitSurface for NanBeyond {
        fn value(&self, p: &Vec3) -> f64 {
            if p.x > self.limit {
                f64::NAN
            } else {
                p.norm() - 10.0
            }
        }
        fn gradient(&self, p: &Vec3) -> Vec3 {
            *p
        }
        fn tangent_hint(&self, _p: &Vec3, _g: &Vec3) -> Vec3 {
            Vec3::z()
        }
    }

    fn settings(step_size: f64, bisection_steps: usize) -> IntersectionSettings {
        IntersectionSettings {
            step_size,
            max_steps: 10_000,
            bisection_steps,
        }
    }

    #[test]
    fn from_inside_returns_interior_point_within_tolerance() {
        let surface = Ellipsoid::new(3.5, 2.5, 1.5).unwrap();
        let s = settings(0.01, 12);
        let crossing =
            find_crossing(&surface, &Vec3::zeros(), &Vec3::x(), SearchSide::FromInside, &s)
                .unwrap();
        assert!(surface.value(&crossing.point) < 0.0, "must stay inside");
        assert!(surface.value(&crossing.outside) >= 0.0);
        assert!((crossing.point.x - 3.5).abs() <= s.tolerance());
        assert!((crossing.point - crossing.outside).norm() <= s.tolerance() * (1.0 + 1e-9));
    }

    #[test]
    fn from_outside_returns_interior_point_within_tolerance() {
        let surface = Ellipsoid::new(3.5, 2.5, 1.5).unwrap();
        let s = settings(0.05, 10);
        let crossing = find_crossing(
            &surface,
            &Vec3::new(10.0, 0.0, 0.0),
            &Vec3::new(-2.0, 0.0, 0.0),
            SearchSide::FromOutside,
            &s,
        )
        .unwrap();
        assert!(surface.value(&crossing.point) < 0.0);
        assert!((crossing.point.x - 3.5).abs() <= s.tolerance());
    }

    #[test]
    fn bisection_error_shrinks_with_more_steps() {
        let surface = Ellipsoid::new(2.0, 2.0, 2.0).unwrap();
        let direction = Vec3::new(1.0, 0.7, -0.3);
        let exact = direction.normalize() * 2.0;
        let mut previous_value = f64::INFINITY;
        for n in 0..24 {
            let s = settings(0.013, n);
            let crossing =
                find_crossing(&surface, &Vec3::zeros(), &direction, SearchSide::FromInside, &s)
                    .unwrap();
            let error = (crossing.point - exact).norm();
            assert!(error <= s.tolerance() + 1e-12, "n={n}: {error} > {}", s.tolerance());
            let value = surface.value(&crossing.point).abs();
            assert!(value <= previous_value, "n={n}: |f| grew from {previous_value} to {value}");
            previous_value = value;
        }
    }

    #[test]
    fn torus_tube_crossing_from_ring() {
        let surface = Torus::new(2.0, 1.0).unwrap();
        let s = settings(0.01, 16);
        let crossing = find_crossing(
            &surface,
            &Vec3::new(2.0, 0.0, 0.0),
            &Vec3::z(),
            SearchSide::FromInside,
            &s,
        )
        .unwrap();
        assert!((crossing.point.z - 1.0).abs() <= s.tolerance());
    }

    #[test]
    fn failures_are_reported_not_raised() {
        let surface = Ellipsoid::new(3.5, 2.5, 1.5).unwrap();
        let short = IntersectionSettings {
            step_size: 0.01,
            max_steps: 10,
            bisection_steps: 8,
        };
        assert_eq!(
            find_crossing(&surface, &Vec3::zeros(), &Vec3::x(), SearchSide::FromInside, &short),
            Err(SearchFailure::NoIntersectionFound { max_steps: 10 })
        );
        assert_eq!(
            find_crossing(
                &surface,
                &Vec3::zeros(),
                &Vec3::zeros(),
                SearchSide::FromInside,
                &settings(0.01, 8)
            ),
            Err(SearchFailure::DegenerateDirection)
        );
        let nan_surface = NanBeyond { limit: 1.0 };
        assert!(matches!(
            find_crossing(
                &nan_surface,
                &Vec3::zeros(),
                &Vec3::x(),
                SearchSide::FromInside,
                &settings(0.1, 8)
            ),
            Err(SearchFailure::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn projection_lands_on_surface_from_both_sides() {
        let surface = Ellipsoid::new(3.5, 2.5, 1.5).unwrap();
        let s = settings(0.005, 20);
        for p in [Vec3::new(3.2, 0.4, 0.3), Vec3::new(3.7, -0.2, 0.1)] {
            let projected = project_to_surface(&surface, &p, &s).unwrap();
            assert!(surface.value(&projected) <= 0.0);
            assert!(surface.value(&projected).abs() < 1e-6, "value {}", surface.value(&projected));
        }
        assert_eq!(
            project_to_surface(&surface, &Vec3::zeros(), &s),
            Err(SearchFailure::ZeroGradient)
        );
    }

    #[test]
    fn settings_validation() {
        assert!(IntersectionSettings::default().validate().is_ok());
        let bad = IntersectionSettings {
            step_size: 0.0,
            ..IntersectionSettings::default()
        };
        assert!(bad.validate().is_err());
        let bad = IntersectionSettings {
            max_steps: 1,
            ..IntersectionSettings::default()
        };
        assert!(bad.validate().is_err());
    }
}
