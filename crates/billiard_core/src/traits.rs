use crate::linalg::{TangentFrame, Vec3};
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the expression VM.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A closed implicit surface `f(p) = 0` bounding the solid `f(p) < 0`.
///
/// Implementations must be pure: evaluation has no side effects and never
/// panics. Non-finite input propagates as non-finite output.
pub trait ImplicitSurface {
    /// Evaluates the scalar field at `p`.
    fn value(&self, p: &Vec3) -> f64;

    /// Evaluates the gradient of the field at `p`.
    fn gradient(&self, p: &Vec3) -> Vec3;

    /// Preferred first tangent direction at `p`. It need not be unit length
    /// or exactly tangent; it may vanish where the analytic choice degenerates.
    fn tangent_hint(&self, p: &Vec3, gradient: &Vec3) -> Vec3;

    /// Orthonormal (tangent_a, tangent_b, outward normal) frame at `p`.
    /// Returns `None` where the gradient vanishes.
    fn tangent_basis(&self, p: &Vec3) -> Option<TangentFrame> {
        let gradient = self.gradient(p);
        TangentFrame::from_gradient(&gradient, &self.tangent_hint(p, &gradient))
    }
}
