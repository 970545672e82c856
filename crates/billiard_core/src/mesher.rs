//! Marching-cubes tessellation of the active surface with vertex welding.

use crate::intersection::{project_to_surface, IntersectionSettings};
use crate::linalg::{normalize, Vec3};
use crate::surface::{SurfaceModel, SurfaceParameters};
use crate::traits::ImplicitSurface;
use anyhow::{bail, Result};
use marching_cubes::tables::{EDGE_TABLE, TRI_TABLE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

const PROJECTION_MAX_STEPS: usize = 16;
const PROJECTION_BISECTION_STEPS: usize = 20;

/// Axis-aligned sampling box and lattice resolution (samples per axis).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshDomain {
    pub min: Vec3,
    pub max: Vec3,
    pub resolution: [usize; 3],
}

impl Default for MeshDomain {
    fn default() -> Self {
        Self {
            min: Vec3::new(-4.0, -3.0, -2.0),
            max: Vec3::new(4.0, 3.0, 2.0),
            resolution: [48, 36, 24],
        }
    }
}

impl MeshDomain {
    pub fn validate(&self) -> Result<()> {
        for axis in 0..3 {
            let (min, max) = (self.min[axis], self.max[axis]);
            if !min.is_finite() || !max.is_finite() || max <= min {
                bail!("Domain axis {axis} must be finite with max > min.");
            }
            if self.resolution[axis] < 2 {
                bail!("Domain axis {axis} needs at least 2 samples.");
            }
        }
        Ok(())
    }

    pub fn spacing(&self) -> Vec3 {
        Vec3::new(
            (self.max.x - self.min.x) / (self.resolution[0] - 1) as f64,
            (self.max.y - self.min.y) / (self.resolution[1] - 1) as f64,
            (self.max.z - self.min.z) / (self.resolution[2] - 1) as f64,
        )
    }

    fn lattice_point(&self, spacing: &Vec3, ix: usize, iy: usize, iz: usize) -> Vec3 {
        Vec3::new(
            self.min.x + spacing.x * ix as f64,
            self.min.y + spacing.y * iy as f64,
            self.min.z + spacing.z * iz as f64,
        )
    }
}

const CUBE_EDGE_CORNERS: [(usize, usize); 12] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 0),
    (4, 5),
    (5, 6),
    (6, 7),
    (7, 4),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

const CUBE_CORNER_OFFSETS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Owner of each local cube edge: the cell holding the edge's lower
/// endpoint, and the edge's number there (0 = x, 3 = y, 8 = z).
pub const EDGE_OWNERS: [([usize; 3], u8); 12] = [
    ([0, 0, 0], 0),
    ([1, 0, 0], 3),
    ([0, 1, 0], 0),
    ([0, 0, 0], 3),
    ([0, 0, 1], 0),
    ([1, 0, 1], 3),
    ([0, 1, 1], 0),
    ([0, 0, 1], 3),
    ([0, 0, 0], 8),
    ([1, 0, 0], 8),
    ([1, 1, 0], 8),
    ([0, 1, 0], 8),
];

/// Lattice edge identity shared by every cell that touches the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub cell: [usize; 3],
    pub edge: u8,
}

pub fn canonical_edge_key(cell: [usize; 3], local_edge: usize) -> EdgeKey {
    let (offset, edge) = EDGE_OWNERS[local_edge];
    EdgeKey {
        cell: [cell[0] + offset[0], cell[1] + offset[1], cell[2] + offset[2]],
        edge,
    }
}

/// Welded triangle mesh. `neighbors[i]` is sorted and excludes `i`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SurfaceMesh {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub normals: Vec<Vec3>,
    pub neighbors: Vec<Vec<u32>>,
    /// Edge key of each vertex, in vertex order.
    pub edge_keys: Vec<EdgeKey>,
}

impl SurfaceMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Positions flattened to `[x0, y0, z0, x1, ...]` for vertex buffers.
    pub fn flat_positions(&self) -> Vec<f64> {
        self.positions.iter().flat_map(|p| [p.x, p.y, p.z]).collect()
    }

    pub fn flat_normals(&self) -> Vec<f64> {
        self.normals.iter().flat_map(|n| [n.x, n.y, n.z]).collect()
    }
}

/// Scratch state of one mesher pass.
#[derive(Default)]
struct MeshBuildState {
    vertex_of_key: HashMap<EdgeKey, u32>,
    edge_keys: Vec<EdgeKey>,
    positions: Vec<Vec3>,
    triangles: Vec<[u32; 3]>,
}

impl MeshBuildState {
    fn vertex_for(&mut self, key: EdgeKey, position: impl FnOnce() -> Vec3) -> u32 {
        if let Some(&index) = self.vertex_of_key.get(&key) {
            return index;
        }
        let index = self.positions.len() as u32;
        self.vertex_of_key.insert(key, index);
        self.edge_keys.push(key);
        self.positions.push(position());
        index
    }

    fn neighbors(&self) -> Vec<Vec<u32>> {
        let mut sets = vec![BTreeSet::new(); self.positions.len()];
        for &[a, b, c] in &self.triangles {
            for (from, to) in [(a, b), (b, c), (c, a)] {
                if from != to {
                    sets[from as usize].insert(to);
                    sets[to as usize].insert(from);
                }
            }
        }
        sets.into_iter().map(|set| set.into_iter().collect()).collect()
    }

    fn finish<S: ImplicitSurface + ?Sized>(
        self,
        surface: &S,
        projection: &IntersectionSettings,
    ) -> SurfaceMesh {
        let neighbors = self.neighbors();
        let mut fallbacks = 0usize;
        let positions: Vec<Vec3> = self
            .positions
            .iter()
            .map(|p| match project_to_surface(surface, p, projection) {
                Ok(projected) => projected,
                Err(failure) => {
                    fallbacks += 1;
                    debug!(?p, %failure, "vertex projection failed, keeping interpolated position");
                    *p
                }
            })
            .collect();
        let normals = positions
            .iter()
            .map(|p| normalize(&surface.gradient(p)).map_or_else(Vec3::zeros, |n| -n))
            .collect();
        if fallbacks > 0 {
            debug!(fallbacks, "mesh built with unprojected vertices");
        }
        SurfaceMesh {
            positions,
            indices: self.triangles.iter().flatten().copied().collect(),
            normals,
            neighbors,
            edge_keys: self.edge_keys,
        }
    }
}

fn interpolate_factor(v0: f64, v1: f64) -> f64 {
    let denominator = v0 - v1;
    if denominator.abs() <= 1e-12 {
        0.5
    } else {
        (v0 / denominator).clamp(0.0, 1.0)
    }
}

fn projection_settings(domain: &MeshDomain) -> IntersectionSettings {
    let spacing = domain.spacing();
    IntersectionSettings {
        step_size: spacing.x.min(spacing.y).min(spacing.z) / 4.0,
        max_steps: PROJECTION_MAX_STEPS,
        bisection_steps: PROJECTION_BISECTION_STEPS,
    }
}

/// Tessellates the zero level-set of `surface` inside `domain`.
pub fn build_mesh<S: ImplicitSurface + ?Sized>(
    surface: &S,
    domain: &MeshDomain,
) -> Result<SurfaceMesh> {
    domain.validate()?;
    let [nx, ny, nz] = domain.resolution;
    let spacing = domain.spacing();
    let index = |ix: usize, iy: usize, iz: usize| -> usize { ix + iy * nx + iz * nx * ny };

    let mut values = vec![0.0; nx * ny * nz];
    for iz in 0..nz {
        for iy in 0..ny {
            for ix in 0..nx {
                values[index(ix, iy, iz)] =
                    surface.value(&domain.lattice_point(&spacing, ix, iy, iz));
            }
        }
    }

    let mut state = MeshBuildState::default();
    let mut non_finite_cells = 0usize;
    for iz in 0..nz - 1 {
        for iy in 0..ny - 1 {
            for ix in 0..nx - 1 {
                let corners = CUBE_CORNER_OFFSETS.map(|[dx, dy, dz]| [ix + dx, iy + dy, iz + dz]);
                let corner_values = corners.map(|[x, y, z]| values[index(x, y, z)]);
                if corner_values.iter().any(|v| !v.is_finite()) {
                    non_finite_cells += 1;
                    continue;
                }

                let mut cube_index = 0usize;
                for (corner, value) in corner_values.iter().enumerate() {
                    if *value < 0.0 {
                        cube_index |= 1 << corner;
                    }
                }
                let edge_mask = EDGE_TABLE[cube_index] as i32;
                if edge_mask == 0 {
                    continue;
                }

                let mut edge_vertices = [0u32; 12];
                for (edge, slot) in edge_vertices.iter_mut().enumerate() {
                    if (edge_mask & (1 << edge)) == 0 {
                        continue;
                    }
                    let (ca, cb) = CUBE_EDGE_CORNERS[edge];
                    let key = canonical_edge_key([ix, iy, iz], edge);
                    *slot = state.vertex_for(key, || {
                        let [ax, ay, az] = corners[ca];
                        let [bx, by, bz] = corners[cb];
                        let a = domain.lattice_point(&spacing, ax, ay, az);
                        let b = domain.lattice_point(&spacing, bx, by, bz);
                        a + (b - a) * interpolate_factor(corner_values[ca], corner_values[cb])
                    });
                }

                let tri_row = TRI_TABLE[cube_index];
                let mut tri_offset = 0usize;
                while tri_offset + 2 < tri_row.len() && tri_row[tri_offset] != -1 {
                    state.triangles.push([
                        edge_vertices[tri_row[tri_offset] as usize],
                        edge_vertices[tri_row[tri_offset + 1] as usize],
                        edge_vertices[tri_row[tri_offset + 2] as usize],
                    ]);
                    tri_offset += 3;
                }
            }
        }
    }

    if non_finite_cells > 0 {
        debug!(non_finite_cells, "skipped cells with non-finite field samples");
    }
    Ok(state.finish(surface, &projection_settings(domain)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshBuild {
    Rebuilt,
    Unchanged,
}

/// Memoizing front end to [`build_mesh`].
#[derive(Debug, Default)]
pub struct Mesher {
    cached: Option<(MeshDomain, SurfaceParameters, SurfaceMesh)>,
}

impl Mesher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mesh(&self) -> Option<&SurfaceMesh> {
        self.cached.as_ref().map(|(_, _, mesh)| mesh)
    }

    /// Rebuilds unless the domain and surface parameters match the last build.
    pub fn build(&mut self, model: &SurfaceModel, domain: &MeshDomain) -> Result<MeshBuild> {
        if let Some((cached_domain, cached_parameters, _)) = &self.cached {
            if cached_domain == domain && cached_parameters == model.parameters() {
                debug!("mesh inputs unchanged, skipping rebuild");
                return Ok(MeshBuild::Unchanged);
            }
        }
        self.force_rebuild(model, domain)
    }

    pub fn force_rebuild(&mut self, model: &SurfaceModel, domain: &MeshDomain) -> Result<MeshBuild> {
        let mesh = build_mesh(model.surface(), domain)?;
        debug!(
            vertices = mesh.vertex_count(),
            triangles = mesh.triangle_count(),
            "mesh rebuilt"
        );
        self.cached = Some((*domain, model.parameters().clone(), mesh));
        Ok(MeshBuild::Rebuilt)
    }
}
