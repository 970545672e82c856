//! Billiard flow: straight flights through the solid with specular
//! reflection at the boundary.

use crate::intersection::{find_crossing, IntersectionSettings, SearchFailure, SearchSide};
use crate::linalg::{normalize, reflect, Vec3};
use crate::traits::ImplicitSurface;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Seeds farther outside than this (in field units) are rejected.
const SEED_SURFACE_TOLERANCE: f64 = 1e-9;
/// Seeds closer to the wall than this must point into the solid.
const SEED_WALL_TOLERANCE: f64 = 1e-6;

/// A point and heading in phase space. The magnitude of `direction` is the
/// particle speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub position: Vec3,
    pub direction: Vec3,
}

impl PhaseState {
    pub fn new(position: Vec3, direction: Vec3) -> Self {
        Self {
            position,
            direction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowSettings {
    pub intersection: IntersectionSettings,
    pub number_of_intersections: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            intersection: IntersectionSettings::default(),
            number_of_intersections: 20,
        }
    }
}

impl FlowSettings {
    pub fn validate(&self) -> Result<()> {
        self.intersection.validate()?;
        if self.number_of_intersections == 0 {
            bail!("number_of_intersections must be at least 1.");
        }
        Ok(())
    }
}

/// Ordered bounce states with cumulative arc length per sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub states: Vec<PhaseState>,
    pub arc_lengths: Vec<f64>,
    pub success: bool,
    /// Why integration stopped early, if it did.
    pub failure: Option<SearchFailure>,
}

impl Trajectory {
    pub fn seeded(seed: PhaseState) -> Self {
        Self {
            states: vec![seed],
            arc_lengths: vec![0.0],
            success: true,
            failure: None,
        }
    }

    /// `None` only for a hand-built trajectory with no states.
    pub fn last_state(&self) -> Option<&PhaseState> {
        self.states.last()
    }

    pub fn bounces(&self) -> usize {
        self.states.len().saturating_sub(1)
    }

    pub fn total_arc_length(&self) -> f64 {
        self.arc_lengths.last().copied().unwrap_or(0.0)
    }

    fn push(&mut self, state: PhaseState) {
        let segment = self
            .last_state()
            .map_or(0.0, |last| (state.position - last.position).norm());
        let total = self.total_arc_length() + segment;
        self.states.push(state);
        self.arc_lengths.push(total);
    }

    fn fail(&mut self, failure: SearchFailure) {
        self.success = false;
        self.failure = Some(failure);
    }
}

/// One application of the return map: fly from `state` to the next wall hit
/// and reflect there.
pub fn bounce<S: ImplicitSurface + ?Sized>(
    surface: &S,
    state: &PhaseState,
    settings: &IntersectionSettings,
) -> Result<PhaseState, SearchFailure> {
    let crossing = find_crossing(
        surface,
        &state.position,
        &state.direction,
        SearchSide::FromInside,
        settings,
    )?;
    let outward = normalize(&surface.gradient(&crossing.point)).ok_or(SearchFailure::ZeroGradient)?;
    let inward = -outward;
    Ok(PhaseState::new(crossing.point, reflect(&state.direction, &inward)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Seeded,
    Advancing,
    Succeeded,
    Failed,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Succeeded | FlowStatus::Failed)
    }
}

/// Stepwise integrator over a borrowed surface.
pub struct BilliardFlow<'a, S: ImplicitSurface + ?Sized> {
    surface: &'a S,
    settings: IntersectionSettings,
    remaining: usize,
    status: FlowStatus,
    trajectory: Trajectory,
}

impl<'a, S: ImplicitSurface + ?Sized> BilliardFlow<'a, S> {
    pub fn new(surface: &'a S, seed: PhaseState, settings: &FlowSettings) -> Self {
        Self::resume(
            surface,
            Trajectory::seeded(seed),
            settings.number_of_intersections,
            &settings.intersection,
        )
    }

    /// Continues an existing trajectory for `additional` more bounces
    /// without recomputing its prefix. A failed or empty trajectory is
    /// returned unchanged.
    pub fn resume(
        surface: &'a S,
        trajectory: Trajectory,
        additional: usize,
        settings: &IntersectionSettings,
    ) -> Self {
        let status = if trajectory.success && !trajectory.states.is_empty() {
            FlowStatus::Seeded
        } else {
            FlowStatus::Failed
        };
        Self {
            surface,
            settings: *settings,
            remaining: additional,
            status,
            trajectory,
        }
    }

    pub fn status(&self) -> FlowStatus {
        self.status
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Performs one bounce and returns the new status.
    pub fn advance(&mut self) -> FlowStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        if self.remaining == 0 {
            self.status = FlowStatus::Succeeded;
            return self.status;
        }
        self.status = FlowStatus::Advancing;

        let Some(current) = self.trajectory.last_state().copied() else {
            self.status = FlowStatus::Failed;
            return self.status;
        };
        match bounce(self.surface, &current, &self.settings) {
            Ok(next) => {
                self.trajectory.push(next);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.status = FlowStatus::Succeeded;
                }
            }
            Err(failure) => {
                debug!(
                    bounce = self.trajectory.bounces(),
                    %failure,
                    "billiard flow terminated early"
                );
                self.trajectory.fail(failure);
                self.status = FlowStatus::Failed;
            }
        }
        self.status
    }

    pub fn run(mut self) -> Trajectory {
        while !self.advance().is_terminal() {}
        self.trajectory
    }
}

/// Integrates `settings.number_of_intersections` bounces from `seed`.
pub fn integrate<S: ImplicitSurface + ?Sized>(
    surface: &S,
    seed: PhaseState,
    settings: &FlowSettings,
) -> Trajectory {
    BilliardFlow::new(surface, seed, settings).run()
}

/// Grows `trajectory` by `additional` bounces.
pub fn extend<S: ImplicitSurface + ?Sized>(
    surface: &S,
    trajectory: Trajectory,
    additional: usize,
    settings: &IntersectionSettings,
) -> Trajectory {
    BilliardFlow::resume(surface, trajectory, additional, settings).run()
}

// --- Seeding ---

/// Frame in which the configured seed direction is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionFrame {
    /// Components along (tangent_a, tangent_b, inward normal) at the seed.
    Local,
    Global,
}

/// Rotating-frame three-body-like potential with primaries on the x axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotatingPotential {
    /// Mass of the second primary; the first carries `1 - mass_ratio`.
    pub mass_ratio: f64,
    pub angular_velocity: f64,
}

impl Default for RotatingPotential {
    fn default() -> Self {
        Self {
            mass_ratio: 0.5,
            angular_velocity: 1.0,
        }
    }
}

impl RotatingPotential {
    pub fn primaries(&self) -> (Vec3, Vec3) {
        (
            Vec3::new(-self.mass_ratio, 0.0, 0.0),
            Vec3::new(1.0 - self.mass_ratio, 0.0, 0.0),
        )
    }

    pub fn potential(&self, p: &Vec3) -> f64 {
        let (first, second) = self.primaries();
        let r1 = (p - first).norm();
        let r2 = (p - second).norm();
        -(1.0 - self.mass_ratio) / r1 - self.mass_ratio / r2
    }

    pub fn coriolis(&self, p: &Vec3, v: &Vec3) -> f64 {
        self.angular_velocity * (p.y * v.x - p.x * v.y)
    }

    pub fn hamiltonian(&self, p: &Vec3, v: &Vec3) -> f64 {
        0.5 * v.norm_squared() + self.coriolis(p, v) + self.potential(p)
    }

    /// Speed `s` along `unit_direction` with `H(p, s d) = energy`; the larger
    /// root of `s²/2 + b s + (U - E) = 0`.
    pub fn speed_for_energy(
        &self,
        p: &Vec3,
        unit_direction: &Vec3,
        energy: f64,
    ) -> Result<f64, SeedError> {
        let u = self.potential(p);
        if !u.is_finite() {
            return Err(SeedError::SingularPotential);
        }
        let b = self.coriolis(p, unit_direction);
        let discriminant = b * b - 2.0 * (u - energy);
        if discriminant < 0.0 {
            return Err(SeedError::ForbiddenEnergy { energy });
        }
        let speed = -b + discriminant.sqrt();
        if !(speed > 0.0) {
            return Err(SeedError::ForbiddenEnergy { energy });
        }
        Ok(speed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VelocityMode {
    ConstantSpeed {
        speed: f64,
    },
    ConstantEnergy {
        energy: f64,
        #[serde(default)]
        potential: RotatingPotential,
    },
}

impl Default for VelocityMode {
    fn default() -> Self {
        VelocityMode::ConstantSpeed { speed: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeedSettings {
    pub position: Vec3,
    pub direction: Vec3,
    pub frame: DirectionFrame,
    #[serde(default)]
    pub velocity: VelocityMode,
}

impl Default for SeedSettings {
    fn default() -> Self {
        Self {
            position: Vec3::new(3.5, 0.0, 0.0),
            direction: Vec3::new(0.3, 0.2, 1.0),
            frame: DirectionFrame::Local,
            velocity: VelocityMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SeedError {
    #[error("Seed direction has zero length.")]
    DegenerateDirection,
    #[error("Seed on the wall must point into the solid.")]
    LeavesSolid,
    #[error("Seed position lies outside the solid (surface value {value}).")]
    OutsideSolid { value: f64 },
    #[error("Surface gradient vanishes at the seed; no local frame exists.")]
    NoTangentFrame,
    #[error("Constant speed must be finite and positive, got {speed}.")]
    InvalidSpeed { speed: f64 },
    #[error("Potential is singular at the seed position.")]
    SingularPotential,
    #[error("Energy {energy} is not reachable with a positive speed at the seed.")]
    ForbiddenEnergy { energy: f64 },
}

/// Turns seed configuration into the initial phase state.
pub fn resolve_seed<S: ImplicitSurface + ?Sized>(
    surface: &S,
    seed: &SeedSettings,
) -> Result<PhaseState, SeedError> {
    let value = surface.value(&seed.position);
    if !(value <= SEED_SURFACE_TOLERANCE) {
        return Err(SeedError::OutsideSolid { value });
    }
    let world = match seed.frame {
        DirectionFrame::Global => seed.direction,
        DirectionFrame::Local => surface
            .tangent_basis(&seed.position)
            .ok_or(SeedError::NoTangentFrame)?
            .to_world(&seed.direction),
    };
    let unit = normalize(&world).ok_or(SeedError::DegenerateDirection)?;
    if value > -SEED_WALL_TOLERANCE {
        if let Some(normal) = normalize(&surface.gradient(&seed.position)) {
            if unit.dot(&normal) >= 0.0 {
                return Err(SeedError::LeavesSolid);
            }
        }
    }
    let speed = match seed.velocity {
        VelocityMode::ConstantSpeed { speed } => {
            if !speed.is_finite() || speed <= 0.0 {
                return Err(SeedError::InvalidSpeed { speed });
            }
            speed
        }
        VelocityMode::ConstantEnergy { energy, potential } => {
            potential.speed_for_energy(&seed.position, &unit, energy)?
        }
    };
    Ok(PhaseState::new(seed.position, unit * speed))
}
