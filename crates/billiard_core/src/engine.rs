//! Stateful session over the pure core: holds the current configuration and
//! the outputs derived from it, and recomputes only what a new configuration
//! invalidates.

use crate::config::EngineConfig;
use crate::flow::{extend, integrate, resolve_seed, Trajectory};
use crate::mesher::{MeshBuild, Mesher, SurfaceMesh};
use crate::stability::{analyze_mesh, StabilityResult};
use crate::surface::SurfaceModel;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// What an [`BilliardEngine::apply_config`] call recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub surface_changed: bool,
    pub mesh_rebuilt: bool,
    pub trajectory_recomputed: bool,
    pub stability_invalidated: bool,
}

pub struct BilliardEngine {
    config: Arc<EngineConfig>,
    model: SurfaceModel,
    mesher: Mesher,
    trajectory: Trajectory,
    stability: Option<Vec<StabilityResult>>,
}

impl BilliardEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let model = SurfaceModel::new(config.surface.clone())?;
        let trajectory = trace(&model, &config)?;
        let mut mesher = Mesher::new();
        mesher.build(&model, &config.domain)?;
        Ok(Self {
            config: Arc::new(config),
            model,
            mesher,
            trajectory,
            stability: None,
        })
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    pub fn model(&self) -> &SurfaceModel {
        &self.model
    }

    /// Replaces the configuration. On error nothing changes.
    pub fn apply_config(&mut self, config: EngineConfig) -> Result<UpdateSummary> {
        config.validate()?;
        let previous = Arc::clone(&self.config);

        let mut model = self.model.clone();
        let surface_unchanged = model.set_parameters(config.surface.clone())?;
        let trajectory_stale =
            !surface_unchanged || previous.flow != config.flow || previous.seed != config.seed;
        let trajectory = if trajectory_stale {
            Some(trace(&model, &config)?)
        } else {
            debug!("flow inputs unchanged, keeping trajectory");
            None
        };

        let mesh_rebuilt = self.mesher.build(&model, &config.domain)? == MeshBuild::Rebuilt;
        let stability_invalidated = mesh_rebuilt
            || previous.flow.intersection != config.flow.intersection
            || previous.seed.direction != config.seed.direction
            || previous.seed.velocity != config.seed.velocity
            || previous.stability != config.stability;

        self.model = model;
        let trajectory_recomputed = trajectory.is_some();
        if let Some(trajectory) = trajectory {
            self.trajectory = trajectory;
        }
        if stability_invalidated {
            self.stability = None;
        }
        self.config = Arc::new(config);

        Ok(UpdateSummary {
            surface_changed: !surface_unchanged,
            mesh_rebuilt,
            trajectory_recomputed,
            stability_invalidated,
        })
    }

    /// Edits a copy of the configuration and applies it.
    pub fn update(&mut self, edit: impl FnOnce(&mut EngineConfig)) -> Result<UpdateSummary> {
        let mut config = (*self.config).clone();
        edit(&mut config);
        self.apply_config(config)
    }

    pub fn mesh(&self) -> Option<&SurfaceMesh> {
        self.mesher.mesh()
    }

    pub fn rebuild_mesh(&mut self) -> Result<&SurfaceMesh> {
        self.mesher.force_rebuild(&self.model, &self.config.domain)?;
        self.stability = None;
        self.mesh().ok_or_else(|| anyhow!("Mesh missing after rebuild."))
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Appends bounces to the current trajectory without recomputing it.
    pub fn extend_trajectory(&mut self, additional: usize) -> &Trajectory {
        self.trajectory = extend(
            self.model.surface(),
            self.trajectory.clone(),
            additional,
            &self.config.flow.intersection,
        );
        report_truncation(&self.trajectory);
        &self.trajectory
    }

    /// Per-vertex stability, computed on first request after each change.
    pub fn stability(&mut self) -> Result<&[StabilityResult]> {
        if self.stability.is_none() {
            let mesh = self
                .mesher
                .mesh()
                .ok_or_else(|| anyhow!("No mesh available for stability analysis."))?;
            let results = analyze_mesh(
                self.model.surface(),
                mesh,
                &self.config.seed,
                &self.config.stability,
                &self.config.flow.intersection,
            );
            let degenerate = results.iter().filter(|r| r.degenerate).count();
            debug!(vertices = results.len(), degenerate, "stability analysis finished");
            self.stability = Some(results);
        }
        Ok(self.stability.as_deref().unwrap_or_default())
    }
}

fn trace(model: &SurfaceModel, config: &EngineConfig) -> Result<Trajectory> {
    let seed = resolve_seed(model.surface(), &config.seed).context("Failed to resolve seed.")?;
    let trajectory = integrate(model.surface(), seed, &config.flow);
    report_truncation(&trajectory);
    Ok(trajectory)
}

fn report_truncation(trajectory: &Trajectory) {
    if let Some(failure) = &trajectory.failure {
        warn!(
            bounces = trajectory.bounces(),
            %failure,
            "trajectory truncated"
        );
    }
}
