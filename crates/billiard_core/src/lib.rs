pub mod config;
pub mod engine;
pub mod equation_engine;
pub mod flow;
pub mod intersection;
pub mod linalg;
pub mod mesher;
pub mod stability;
pub mod surface;
/// The `billiard_core` crate is the reference engine for billiard dynamics
/// inside closed implicit solids.
///
/// Key components:
/// - **Surface**: ellipsoid, torus and formula-defined surfaces (`ImplicitSurface`).
/// - **Equation Engine**: parser, symbolic derivatives and bytecode VM for custom formulas.
/// - **Intersection / Flow**: ray marching with bisection, and the specular return map.
/// - **Mesher**: welded marching-cubes tessellation with memoized rebuilds.
/// - **Stability**: FTLE fields from the Cauchy-Green tensor of the return map.
/// - **Engine**: a configuration-driven session that recomputes only stale outputs.
pub mod traits;
