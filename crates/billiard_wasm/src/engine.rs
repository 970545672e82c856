use crate::payload::{parse_variant, stability_field, MeshPayload, TrajectoryPayload};
use crate::to_js_error;
use billiard_core::config::EngineConfig;
use billiard_core::engine::BilliardEngine;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmEngine {
    engine: BilliardEngine,
}

fn serialize<T: serde::Serialize>(value: &T, what: &str) -> Result<JsValue, JsValue> {
    to_value(value).map_err(|err| JsValue::from_str(&format!("Failed to serialize {what}: {err}")))
}

fn parse_config(config: JsValue) -> Result<EngineConfig, JsValue> {
    from_value(config).map_err(|err| JsValue::from_str(&format!("Invalid configuration: {err}")))
}

#[wasm_bindgen]
impl WasmEngine {
    #[wasm_bindgen(constructor)]
    pub fn new(config: JsValue) -> Result<WasmEngine, JsValue> {
        console_error_panic_hook::set_once();
        let config = parse_config(config)?;
        let engine = BilliardEngine::new(config).map_err(to_js_error)?;
        Ok(WasmEngine { engine })
    }

    pub fn from_json(text: &str) -> Result<WasmEngine, JsValue> {
        console_error_panic_hook::set_once();
        let config = EngineConfig::from_json(text).map_err(to_js_error)?;
        let engine = BilliardEngine::new(config).map_err(to_js_error)?;
        Ok(WasmEngine { engine })
    }

    /// Applies a new configuration and reports what was recomputed.
    pub fn apply_config(&mut self, config: JsValue) -> Result<JsValue, JsValue> {
        let config = parse_config(config)?;
        let summary = self.engine.apply_config(config).map_err(to_js_error)?;
        serialize(&summary, "update summary")
    }

    pub fn config(&self) -> Result<JsValue, JsValue> {
        serialize(&*self.engine.config(), "configuration")
    }

    pub fn config_json(&self) -> Result<String, JsValue> {
        self.engine.config().to_json().map_err(to_js_error)
    }

    pub fn mesh(&self) -> Result<JsValue, JsValue> {
        let mesh = self
            .engine
            .mesh()
            .ok_or_else(|| JsValue::from_str("No mesh available."))?;
        serialize(&MeshPayload::from(mesh), "mesh")
    }

    pub fn mesh_positions(&self) -> Vec<f64> {
        self.engine
            .mesh()
            .map(|mesh| mesh.flat_positions())
            .unwrap_or_default()
    }

    pub fn mesh_normals(&self) -> Vec<f64> {
        self.engine
            .mesh()
            .map(|mesh| mesh.flat_normals())
            .unwrap_or_default()
    }

    pub fn mesh_indices(&self) -> Vec<u32> {
        self.engine
            .mesh()
            .map(|mesh| mesh.indices.clone())
            .unwrap_or_default()
    }

    pub fn rebuild_mesh(&mut self) -> Result<u32, JsValue> {
        let mesh = self.engine.rebuild_mesh().map_err(to_js_error)?;
        Ok(mesh.vertex_count() as u32)
    }

    pub fn trajectory(&self) -> Result<JsValue, JsValue> {
        serialize(&TrajectoryPayload::from(self.engine.trajectory()), "trajectory")
    }

    pub fn extend_trajectory(&mut self, additional: u32) -> Result<JsValue, JsValue> {
        let trajectory = self.engine.extend_trajectory(additional as usize);
        serialize(&TrajectoryPayload::from(trajectory), "trajectory")
    }

    /// Per-vertex values of one stability variant.
    pub fn stability(&mut self, variant: &str) -> Result<Vec<f64>, JsValue> {
        let variant = parse_variant(variant).map_err(to_js_error)?;
        let results = self.engine.stability().map_err(to_js_error)?;
        Ok(stability_field(results, variant))
    }

    pub fn stability_results(&mut self) -> Result<JsValue, JsValue> {
        let results = self.engine.stability().map_err(to_js_error)?;
        serialize(&results, "stability results")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"{
        "surface": { "surface_type": "ellipsoid", "a": 1.5, "b": 1.0, "c": 0.8 },
        "domain": { "min": [-2.0, -1.5, -1.0], "max": [2.0, 1.5, 1.0], "resolution": [9, 7, 5] },
        "seed": { "position": [1.5, 0.0, 0.0], "direction": [0.3, 0.2, 1.0], "frame": "local" }
    }"#;

    #[test]
    fn engine_from_json_exposes_buffers() {
        let engine = WasmEngine::from_json(SMALL).expect("engine");
        let positions = engine.mesh_positions();
        assert!(!positions.is_empty());
        assert_eq!(positions.len() % 3, 0);
        assert_eq!(engine.mesh_normals().len(), positions.len());
        assert!(engine.mesh_indices().iter().all(|&i| (i as usize) < positions.len() / 3));
    }

    #[test]
    fn stability_field_matches_vertex_count() {
        let mut engine = WasmEngine::from_json(SMALL).expect("engine");
        let vertices = engine.mesh_positions().len() / 3;
        let field = engine.stability("combined").expect("stability");
        assert_eq!(field.len(), vertices);
    }

    #[test]
    #[cfg(target_arch = "wasm32")]
    fn engine_rejects_invalid_json() {
        assert!(WasmEngine::from_json("{ \"domain\": 3 }").is_err());
    }

    #[test]
    #[cfg(target_arch = "wasm32")]
    fn stability_rejects_unknown_variant() {
        let mut engine = WasmEngine::from_json(SMALL).expect("engine");
        assert!(engine.stability("shear").is_err());
    }
}
