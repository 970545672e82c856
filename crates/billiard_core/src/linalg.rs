//! Small fixed-size linear algebra used throughout the engine.
//!
//! Everything here works on `nalgebra` fixed-size types: 3-vectors for
//! positions and directions, 3×2 Jacobians for tangent-plane sensitivities
//! and the 2×2 Cauchy-Green tensor built from them.

use nalgebra::{Matrix2, Matrix3x2, Vector3};
use serde::{Deserialize, Serialize};

pub type Vec3 = Vector3<f64>;

/// Vectors shorter than this are treated as zero when normalizing.
pub const NORM_EPS: f64 = 1e-12;

/// Returns `v / |v|`, or `None` if `v` is (numerically) zero or non-finite.
pub fn normalize(v: &Vec3) -> Option<Vec3> {
    if !v.iter().all(|c| c.is_finite()) {
        return None;
    }
    v.try_normalize(NORM_EPS)
}

/// Specular reflection `r = d - 2 (d·n) n` for a unit normal `n`.
///
/// The result does not depend on the orientation of `n`, and preserves both
/// `|d|` and the angle to the normal.
pub fn reflect(direction: &Vec3, unit_normal: &Vec3) -> Vec3 {
    direction - unit_normal * (2.0 * direction.dot(unit_normal))
}

/// Orthonormal frame attached to a surface point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TangentFrame {
    pub tangent_a: Vec3,
    pub tangent_b: Vec3,
    /// Outward unit normal.
    pub normal: Vec3,
}

impl TangentFrame {
    /// Builds a frame from a gradient and a preferred first tangent.
    ///
    /// The hint is projected into the tangent plane; if that leaves nothing
    /// usable the coordinate axis least aligned with the normal is used
    /// instead. Returns `None` for a zero or non-finite gradient.
    pub fn from_gradient(gradient: &Vec3, hint: &Vec3) -> Option<Self> {
        let normal = normalize(gradient)?;
        let tangent_a = project_to_plane(hint, &normal)
            .or_else(|| project_to_plane(&least_aligned_axis(&normal), &normal))?;
        let tangent_b = normalize(&normal.cross(&tangent_a))?;
        Some(Self {
            tangent_a,
            tangent_b,
            normal,
        })
    }

    pub fn inward_normal(&self) -> Vec3 {
        -self.normal
    }

    /// Converts components along (tangent_a, tangent_b, inward normal) into a
    /// world-space vector.
    pub fn to_world(&self, local: &Vec3) -> Vec3 {
        self.tangent_a * local.x + self.tangent_b * local.y + self.inward_normal() * local.z
    }

    /// Inverse of [`TangentFrame::to_world`].
    pub fn to_local(&self, world: &Vec3) -> Vec3 {
        Vec3::new(
            world.dot(&self.tangent_a),
            world.dot(&self.tangent_b),
            world.dot(&self.inward_normal()),
        )
    }
}

fn project_to_plane(v: &Vec3, unit_normal: &Vec3) -> Option<Vec3> {
    // Relative threshold: a hint nearly parallel to the normal is unusable.
    let scale = v.norm();
    if !(scale > NORM_EPS) {
        return None;
    }
    let projected = v - unit_normal * v.dot(unit_normal);
    if projected.norm() <= 1e-8 * scale {
        return None;
    }
    normalize(&projected)
}

fn least_aligned_axis(n: &Vec3) -> Vec3 {
    let (ax, ay, az) = (n.x.abs(), n.y.abs(), n.z.abs());
    if ax <= ay && ax <= az {
        Vec3::x()
    } else if ay <= az {
        Vec3::y()
    } else {
        Vec3::z()
    }
}

/// Largest eigenvalue of a symmetric 2×2 matrix, in closed form.
///
/// Off-diagonal entries are averaged so slightly asymmetric input (from
/// round-off) is handled consistently.
pub fn max_symmetric_eigenvalue(m: &Matrix2<f64>) -> f64 {
    let a = m[(0, 0)];
    let d = m[(1, 1)];
    let b = 0.5 * (m[(0, 1)] + m[(1, 0)]);
    let mean = 0.5 * (a + d);
    let half_gap = 0.5 * (a - d);
    mean + half_gap.hypot(b)
}

/// Cauchy-Green tensor `AᵀA` where `A` is the row-wise stack of `blocks`.
pub fn cauchy_green(blocks: &[&Matrix3x2<f64>]) -> Matrix2<f64> {
    blocks
        .iter()
        .fold(Matrix2::zeros(), |acc, block| acc + block.transpose() * *block)
}

/// Finite-difference derivative of a sampled vector quantity along one axis.
///
/// Uses the central stencil when both neighbours are present and falls back
/// to forward/backward differences with the centre sample otherwise.
pub fn tangent_derivative(
    minus: Option<&Vec3>,
    center: &Vec3,
    plus: Option<&Vec3>,
    h: f64,
) -> Option<Vec3> {
    match (minus, plus) {
        (Some(m), Some(p)) => Some((p - m) / (2.0 * h)),
        (None, Some(p)) => Some((p - center) / h),
        (Some(m), None) => Some((center - m) / h),
        (None, None) => None,
    }
}

/// Assembles a 3×2 Jacobian from two column derivatives.
pub fn jacobian_columns(d_a: &Vec3, d_b: &Vec3) -> Matrix3x2<f64> {
    Matrix3x2::from_columns(&[*d_a, *d_b])
}
