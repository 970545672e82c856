//! WASM bridge for `billiard_core`.
//!
//! Configuration arrives as plain JS objects matching `EngineConfig`; meshes,
//! trajectories and stability fields go back out as JS objects or typed arrays.

mod engine;
mod payload;
mod surface;

pub use engine::WasmEngine;
pub use surface::{custom_surface_partials, probe_surface};

use wasm_bindgen::JsValue;

pub(crate) fn to_js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}
