//! Flat, render-ready views of core results.

use anyhow::{bail, Result};
use billiard_core::flow::Trajectory;
use billiard_core::mesher::SurfaceMesh;
use billiard_core::stability::{StabilityResult, StabilityVariant};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshPayload {
    pub positions: Vec<f64>,
    pub normals: Vec<f64>,
    pub indices: Vec<u32>,
    pub neighbors: Vec<Vec<u32>>,
}

impl From<&SurfaceMesh> for MeshPayload {
    fn from(mesh: &SurfaceMesh) -> Self {
        Self {
            positions: mesh.flat_positions(),
            normals: mesh.flat_normals(),
            indices: mesh.indices.clone(),
            neighbors: mesh.neighbors.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrajectoryPayload {
    pub positions: Vec<f64>,
    pub directions: Vec<f64>,
    pub arc_lengths: Vec<f64>,
    pub success: bool,
    pub failure: Option<String>,
}

impl From<&Trajectory> for TrajectoryPayload {
    fn from(trajectory: &Trajectory) -> Self {
        let flatten = |pick: fn(&billiard_core::flow::PhaseState) -> [f64; 3]| {
            trajectory.states.iter().flat_map(pick).collect::<Vec<_>>()
        };
        Self {
            positions: flatten(|s| [s.position.x, s.position.y, s.position.z]),
            directions: flatten(|s| [s.direction.x, s.direction.y, s.direction.z]),
            arc_lengths: trajectory.arc_lengths.clone(),
            success: trajectory.success,
            failure: trajectory.failure.map(|f| f.to_string()),
        }
    }
}

pub fn parse_variant(name: &str) -> Result<StabilityVariant> {
    Ok(match name {
        "combined" => StabilityVariant::Combined,
        "position_only" | "position" => StabilityVariant::PositionOnly,
        "velocity_only" | "velocity" => StabilityVariant::VelocityOnly,
        other => bail!("Unknown stability variant: {other}"),
    })
}

/// One value per vertex; degenerate points map to `-∞`.
pub fn stability_field(results: &[StabilityResult], variant: StabilityVariant) -> Vec<f64> {
    results.iter().map(|r| r.value(variant)).collect()
}
