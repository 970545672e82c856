//! Implicit surface models.
//!
//! Three families are supported: axis-aligned ellipsoids, tori around the z
//! axis, and user-supplied formulas in `x`, `y`, `z`. Every model is negative
//! inside the solid, zero on the boundary and positive outside.

use crate::equation_engine::{differentiate, parse, Bytecode, Compiler, Expr, ExpressionError, VM};
use crate::linalg::Vec3;
use crate::traits::ImplicitSurface;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

const AXES: [&str; 3] = ["x", "y", "z"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SurfaceError {
    #[error("Degenerate surface parameters: {0}")]
    DegenerateParameters(String),
    #[error("Invalid custom surface expression: {0}")]
    InvalidExpression(#[from] ExpressionError),
}

/// Shape configuration, discriminated by `surface_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "surface_type", rename_all = "snake_case")]
pub enum SurfaceParameters {
    Ellipsoid {
        a: f64,
        b: f64,
        c: f64,
    },
    Torus {
        major_radius: f64,
        minor_radius: f64,
    },
    Custom {
        expression: String,
        /// Named constants the expression may reference.
        #[serde(default)]
        parameters: BTreeMap<String, f64>,
    },
}

const DEFAULT_SEMI_AXES: (f64, f64, f64) = (3.5, 2.5, 1.5);

impl Default for SurfaceParameters {
    fn default() -> Self {
        let (a, b, c) = DEFAULT_SEMI_AXES;
        SurfaceParameters::Ellipsoid { a, b, c }
    }
}

/// `x²/a² + y²/b² + z²/c² - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ellipsoid {
    a: f64,
    b: f64,
    c: f64,
    inv_a2: f64,
    inv_b2: f64,
    inv_c2: f64,
}

impl Ellipsoid {
    pub fn new(a: f64, b: f64, c: f64) -> Result<Self, SurfaceError> {
        validate_semi_axes(a, b, c)?;
        Ok(Self::from_valid_axes(a, b, c))
    }

    fn from_valid_axes(a: f64, b: f64, c: f64) -> Self {
        Self {
            a,
            b,
            c,
            inv_a2: 1.0 / (a * a),
            inv_b2: 1.0 / (b * b),
            inv_c2: 1.0 / (c * c),
        }
    }

    pub fn semi_axes(&self) -> (f64, f64, f64) {
        (self.a, self.b, self.c)
    }

    pub fn reciprocal_squares(&self) -> (f64, f64, f64) {
        (self.inv_a2, self.inv_b2, self.inv_c2)
    }

    /// Updates the semi-axes and refreshes the cached reciprocals.
    /// Returns `true` when the axes were already equal to the input.
    pub fn set_semi_axes(&mut self, a: f64, b: f64, c: f64) -> Result<bool, SurfaceError> {
        if (a, b, c) == (self.a, self.b, self.c) {
            return Ok(true);
        }
        *self = Self::new(a, b, c)?;
        Ok(false)
    }
}

fn validate_semi_axes(a: f64, b: f64, c: f64) -> Result<(), SurfaceError> {
    for (name, value) in [("a", a), ("b", b), ("c", c)] {
        if !value.is_finite() || value <= 0.0 {
            return Err(SurfaceError::DegenerateParameters(format!(
                "ellipsoid semi-axis {name} must be finite and positive, got {value}"
            )));
        }
    }
    Ok(())
}

impl ImplicitSurface for Ellipsoid {
    fn value(&self, p: &Vec3) -> f64 {
        p.x * p.x * self.inv_a2 + p.y * p.y * self.inv_b2 + p.z * p.z * self.inv_c2 - 1.0
    }

    fn gradient(&self, p: &Vec3) -> Vec3 {
        Vec3::new(
            2.0 * p.x * self.inv_a2,
            2.0 * p.y * self.inv_b2,
            2.0 * p.z * self.inv_c2,
        )
    }

    /// Tangent of the constant-z ellipse through `p`.
    fn tangent_hint(&self, _p: &Vec3, gradient: &Vec3) -> Vec3 {
        Vec3::new(-gradient.y, gradient.x, 0.0)
    }
}

/// Torus around the z axis: `(sqrt(x² + y²) - R)² + z² - r²`.
#[derive(Debug, Clone, PartialEq)]
pub struct Torus {
    major_radius: f64,
    minor_radius: f64,
    minor_radius_sq: f64,
}

impl Torus {
    pub fn new(major_radius: f64, minor_radius: f64) -> Result<Self, SurfaceError> {
        if !major_radius.is_finite() || !minor_radius.is_finite() {
            return Err(SurfaceError::DegenerateParameters(
                "torus radii must be finite".to_string(),
            ));
        }
        if minor_radius <= 0.0 {
            return Err(SurfaceError::DegenerateParameters(format!(
                "torus minor radius must be positive, got {minor_radius}"
            )));
        }
        if major_radius <= minor_radius {
            return Err(SurfaceError::DegenerateParameters(format!(
                "torus major radius ({major_radius}) must exceed minor radius ({minor_radius})"
            )));
        }
        Ok(Self {
            major_radius,
            minor_radius,
            minor_radius_sq: minor_radius * minor_radius,
        })
    }

    pub fn radii(&self) -> (f64, f64) {
        (self.major_radius, self.minor_radius)
    }
}

impl ImplicitSurface for Torus {
    fn value(&self, p: &Vec3) -> f64 {
        let ring = p.x.hypot(p.y) - self.major_radius;
        ring * ring + p.z * p.z - self.minor_radius_sq
    }

    fn gradient(&self, p: &Vec3) -> Vec3 {
        let q = p.x.hypot(p.y);
        if q <= f64::EPSILON {
            // On the axis the radial part has no direction; keep only z.
            return Vec3::new(0.0, 0.0, 2.0 * p.z);
        }
        let radial = 2.0 * (q - self.major_radius) / q;
        Vec3::new(radial * p.x, radial * p.y, 2.0 * p.z)
    }

    /// Planar tangent around the symmetry axis.
    fn tangent_hint(&self, p: &Vec3, _gradient: &Vec3) -> Vec3 {
        Vec3::new(p.y, -p.x, 0.0)
    }
}

/// User formula compiled once, together with its symbolic partials.
#[derive(Debug, Clone)]
pub struct CustomSurface {
    expression: String,
    parameters: BTreeMap<String, f64>,
    partials: [Expr; 3],
    value_code: Bytecode,
    gradient_code: [Bytecode; 3],
    param_values: Vec<f64>,
}

impl CustomSurface {
    pub fn new(
        expression: &str,
        parameters: &BTreeMap<String, f64>,
    ) -> Result<Self, SurfaceError> {
        for (name, value) in parameters {
            if AXES.contains(&name.as_str()) {
                return Err(SurfaceError::DegenerateParameters(format!(
                    "parameter name '{name}' is reserved for a coordinate"
                )));
            }
            if !value.is_finite() {
                return Err(SurfaceError::DegenerateParameters(format!(
                    "parameter '{name}' must be finite, got {value}"
                )));
            }
        }

        let var_names: Vec<String> = AXES.iter().map(|s| s.to_string()).collect();
        let param_names: Vec<String> = parameters.keys().cloned().collect();
        let param_values: Vec<f64> = parameters.values().copied().collect();
        let compiler = Compiler::new(&var_names, &param_names);

        let expr = parse(expression)?;
        let value_code = compiler.compile(&expr)?;
        let partials = [
            differentiate(&expr, AXES[0])?,
            differentiate(&expr, AXES[1])?,
            differentiate(&expr, AXES[2])?,
        ];
        let gradient_code = [
            compiler.compile(&partials[0])?,
            compiler.compile(&partials[1])?,
            compiler.compile(&partials[2])?,
        ];

        Ok(Self {
            expression: expression.to_string(),
            parameters: parameters.clone(),
            partials,
            value_code,
            gradient_code,
            param_values,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Partial derivatives in source form, in (x, y, z) order.
    pub fn partial_derivatives(&self) -> [String; 3] {
        [
            self.partials[0].to_string(),
            self.partials[1].to_string(),
            self.partials[2].to_string(),
        ]
    }
}

impl ImplicitSurface for CustomSurface {
    fn value(&self, p: &Vec3) -> f64 {
        VM::evaluate(&self.value_code, p.as_slice(), &self.param_values)
    }

    fn gradient(&self, p: &Vec3) -> Vec3 {
        let vars = p.as_slice();
        Vec3::new(
            VM::evaluate(&self.gradient_code[0], vars, &self.param_values),
            VM::evaluate(&self.gradient_code[1], vars, &self.param_values),
            VM::evaluate(&self.gradient_code[2], vars, &self.param_values),
        )
    }

    /// Tangent of the constant-z level curve, as for the ellipsoid.
    fn tangent_hint(&self, _p: &Vec3, gradient: &Vec3) -> Vec3 {
        Vec3::new(-gradient.y, gradient.x, 0.0)
    }
}

/// A validated, evaluation-ready surface.
#[derive(Debug, Clone)]
pub enum Surface {
    Ellipsoid(Ellipsoid),
    Torus(Torus),
    Custom(CustomSurface),
}

impl Surface {
    pub fn from_parameters(params: &SurfaceParameters) -> Result<Self, SurfaceError> {
        Ok(match params {
            SurfaceParameters::Ellipsoid { a, b, c } => {
                Surface::Ellipsoid(Ellipsoid::new(*a, *b, *c)?)
            }
            SurfaceParameters::Torus {
                major_radius,
                minor_radius,
            } => Surface::Torus(Torus::new(*major_radius, *minor_radius)?),
            SurfaceParameters::Custom {
                expression,
                parameters,
            } => Surface::Custom(CustomSurface::new(expression, parameters)?),
        })
    }

    pub fn parameters(&self) -> SurfaceParameters {
        match self {
            Surface::Ellipsoid(e) => {
                let (a, b, c) = e.semi_axes();
                SurfaceParameters::Ellipsoid { a, b, c }
            }
            Surface::Torus(t) => {
                let (major_radius, minor_radius) = t.radii();
                SurfaceParameters::Torus {
                    major_radius,
                    minor_radius,
                }
            }
            Surface::Custom(c) => SurfaceParameters::Custom {
                expression: c.expression.clone(),
                parameters: c.parameters.clone(),
            },
        }
    }

    fn inner(&self) -> &dyn ImplicitSurface {
        match self {
            Surface::Ellipsoid(s) => s,
            Surface::Torus(s) => s,
            Surface::Custom(s) => s,
        }
    }
}

impl ImplicitSurface for Surface {
    fn value(&self, p: &Vec3) -> f64 {
        self.inner().value(p)
    }

    fn gradient(&self, p: &Vec3) -> Vec3 {
        self.inner().gradient(p)
    }

    fn tangent_hint(&self, p: &Vec3, gradient: &Vec3) -> Vec3 {
        self.inner().tangent_hint(p, gradient)
    }
}

/// Session-level holder for the active surface.
#[derive(Debug, Clone)]
pub struct SurfaceModel {
    parameters: SurfaceParameters,
    surface: Surface,
}

impl SurfaceModel {
    pub fn new(parameters: SurfaceParameters) -> Result<Self, SurfaceError> {
        let surface = Surface::from_parameters(&parameters)?;
        Ok(Self {
            parameters,
            surface,
        })
    }

    pub fn parameters(&self) -> &SurfaceParameters {
        &self.parameters
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Replaces the parameters, validating them first.
    ///
    /// Returns `Ok(true)` when the new parameters equal the current ones, so
    /// callers can skip dependent recomputation. On error the previous surface
    /// is kept.
    pub fn set_parameters(&mut self, parameters: SurfaceParameters) -> Result<bool, SurfaceError> {
        if parameters == self.parameters {
            return Ok(true);
        }
        let updated_in_place = match (&mut self.surface, &parameters) {
            (Surface::Ellipsoid(ellipsoid), SurfaceParameters::Ellipsoid { a, b, c }) => {
                ellipsoid.set_semi_axes(*a, *b, *c)?;
                true
            }
            _ => false,
        };
        if !updated_in_place {
            self.surface = Surface::from_parameters(&parameters)?;
        }
        self.parameters = parameters;
        Ok(false)
    }
}

impl Default for SurfaceModel {
    fn default() -> Self {
        let (a, b, c) = DEFAULT_SEMI_AXES;
        let parameters = SurfaceParameters::default();
        let surface = Surface::Ellipsoid(Ellipsoid::from_valid_axes(a, b, c));
        Self {
            parameters,
            surface,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(expression: &str) -> SurfaceParameters {
        SurfaceParameters::Custom {
            expression: expression.to_string(),
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn ellipsoid_scenario() {
        let surface = Ellipsoid::new(3.5, 2.5, 1.5).unwrap();
        assert!(surface.value(&Vec3::new(3.5, 0.0, 0.0)).abs() < 1e-12);
        assert_eq!(surface.value(&Vec3::zeros()), -1.0);
        let g = surface.gradient(&Vec3::new(3.5, 0.0, 0.0));
        assert!(g.x > 0.0 && g.y == 0.0 && g.z == 0.0, "gradient {g:?}");
    }

    #[test]
    fn torus_scenario() {
        let surface = Torus::new(2.0, 1.0).unwrap();
        assert!(surface.value(&Vec3::new(2.0, 0.0, 0.0)) < 0.0);
        assert!(surface.value(&Vec3::new(4.0, 0.0, 0.0)) > 0.0);
        assert!(surface.value(&Vec3::new(3.0, 0.0, 0.0)).abs() < 1e-12);
        assert!(surface.value(&Vec3::zeros()) > 0.0, "the hole is outside the solid");
    }

    #[test]
    fn degenerate_parameters_are_rejected() {
        for params in [
            SurfaceParameters::Ellipsoid { a: 0.0, b: 1.0, c: 1.0 },
            SurfaceParameters::Ellipsoid { a: 1.0, b: f64::NAN, c: 1.0 },
            SurfaceParameters::Torus { major_radius: 1.0, minor_radius: 1.0 },
            SurfaceParameters::Torus { major_radius: 2.0, minor_radius: -0.5 },
        ] {
            let err = Surface::from_parameters(&params).unwrap_err();
            assert!(
                matches!(err, SurfaceError::DegenerateParameters(_)),
                "unexpected error {err:?} for {params:?}"
            );
        }
    }

    #[test]
    fn malformed_custom_expression_fails_at_set_time() {
        let err = Surface::from_parameters(&custom("x^2 + (y")).unwrap_err();
        assert!(matches!(err, SurfaceError::InvalidExpression(_)));
        let err = Surface::from_parameters(&custom("x^2 + w^2 - 1")).unwrap_err();
        assert!(err.to_string().contains("Unknown variable"), "{err}");
    }

    #[test]
    fn custom_parameters_cannot_shadow_coordinates() {
        let mut parameters = BTreeMap::new();
        parameters.insert("x".to_string(), 1.0);
        let err = Surface::from_parameters(&SurfaceParameters::Custom {
            expression: "x - 1".to_string(),
            parameters,
        })
        .unwrap_err();
        assert!(matches!(err, SurfaceError::DegenerateParameters(_)));
    }

    #[test]
    fn custom_sphere_matches_ellipsoid() {
        let mut parameters = BTreeMap::new();
        parameters.insert("rho".to_string(), 2.0);
        let custom = Surface::from_parameters(&SurfaceParameters::Custom {
            expression: "(x^2 + y^2 + z^2) / rho^2 - 1".to_string(),
            parameters,
        })
        .unwrap();
        let sphere = Ellipsoid::new(2.0, 2.0, 2.0).unwrap();
        for p in [
            Vec3::new(0.3, -1.2, 0.8),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(-1.5, 1.5, 1.5),
        ] {
            assert!((custom.value(&p) - sphere.value(&p)).abs() < 1e-12);
            assert!((custom.gradient(&p) - sphere.gradient(&p)).norm() < 1e-12);
        }
        match custom {
            Surface::Custom(c) => {
                let partials = c.partial_derivatives();
                assert!(partials[0].contains('x'), "{}", partials[0]);
                assert!(!partials[0].contains('y'), "{}", partials[0]);
            }
            other => panic!("expected custom surface, got {other:?}"),
        }
    }

    #[test]
    fn tangent_bases_follow_surface_specific_directions() {
        let ellipsoid = Ellipsoid::new(3.5, 2.5, 1.5).unwrap();
        let frame = ellipsoid.tangent_basis(&Vec3::new(3.5, 0.0, 0.0)).unwrap();
        assert!((frame.normal - Vec3::x()).norm() < 1e-12);
        assert!((frame.tangent_a - Vec3::y()).norm() < 1e-12);
        assert!((frame.tangent_b - Vec3::z()).norm() < 1e-12);

        let torus = Torus::new(2.0, 1.0).unwrap();
        let frame = torus.tangent_basis(&Vec3::new(3.0, 0.0, 0.0)).unwrap();
        assert!((frame.normal - Vec3::x()).norm() < 1e-12);
        assert!((frame.tangent_a + Vec3::y()).norm() < 1e-12);

        // Pole of the ellipsoid: the analytic hint vanishes, the frame must not.
        let frame = ellipsoid.tangent_basis(&Vec3::new(0.0, 0.0, 1.5)).unwrap();
        assert!(frame.tangent_a.dot(&frame.normal).abs() < 1e-12);
        assert!((frame.tangent_b.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn nan_input_propagates() {
        let surface = Surface::from_parameters(&SurfaceParameters::default()).unwrap();
        let p = Vec3::new(f64::NAN, 0.0, 0.0);
        assert!(surface.value(&p).is_nan());
        assert!(surface.tangent_basis(&p).is_none());
    }

    #[test]
    fn set_parameters_reports_unchanged_and_refreshes_cache() {
        let mut model = SurfaceModel::default();
        assert!(model.set_parameters(SurfaceParameters::default()).unwrap());
        let unchanged = model
            .set_parameters(SurfaceParameters::Ellipsoid { a: 1.0, b: 2.0, c: 4.0 })
            .unwrap();
        assert!(!unchanged);
        match model.surface() {
            Surface::Ellipsoid(e) => {
                assert_eq!(e.reciprocal_squares(), (1.0, 0.25, 0.0625));
            }
            other => panic!("expected ellipsoid, got {other:?}"),
        }

        let before = model.parameters().clone();
        assert!(model
            .set_parameters(SurfaceParameters::Torus { major_radius: 1.0, minor_radius: 2.0 })
            .is_err());
        assert_eq!(model.parameters(), &before, "failed update must keep old surface");

        assert!(!model.set_parameters(custom("x^2 + y^2 + z^2 - 1")).unwrap());
        assert_eq!(model.surface().parameters(), *model.parameters());
    }

    #[test]
    fn default_model_matches_default_parameters() {
        let model = SurfaceModel::default();
        let fresh = SurfaceModel::new(SurfaceParameters::default()).unwrap();
        assert_eq!(model.parameters(), fresh.parameters());
        assert_eq!(model.surface().parameters(), *model.parameters());
        match (model.surface(), fresh.surface()) {
            (Surface::Ellipsoid(a), Surface::Ellipsoid(b)) => assert_eq!(a, b),
            other => panic!("expected ellipsoids, got {other:?}"),
        }
    }
}
