//! Stateless surface queries for hosts that evaluate geometry elsewhere.

use crate::to_js_error;
use anyhow::{Context, Result};
use billiard_core::linalg::TangentFrame;
use billiard_core::surface::{CustomSurface, Surface, SurfaceParameters};
use billiard_core::traits::ImplicitSurface;
use nalgebra::Vector3;
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use std::collections::BTreeMap;
use wasm_bindgen::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfaceProbe {
    pub value: f64,
    pub gradient: [f64; 3],
    pub frame: Option<TangentFrame>,
}

pub(crate) fn probe(parameters: &SurfaceParameters, point: [f64; 3]) -> Result<SurfaceProbe> {
    let surface = Surface::from_parameters(parameters).context("Invalid surface parameters.")?;
    let p = Vector3::from(point);
    let gradient = surface.gradient(&p);
    Ok(SurfaceProbe {
        value: surface.value(&p),
        gradient: [gradient.x, gradient.y, gradient.z],
        frame: surface.tangent_basis(&p),
    })
}

/// Printed ∂f/∂x, ∂f/∂y, ∂f/∂z of a custom formula.
pub(crate) fn partials(expression: &str, parameters: &BTreeMap<String, f64>) -> Result<Vec<String>> {
    let surface = CustomSurface::new(expression, parameters)
        .with_context(|| format!("Invalid custom surface '{expression}'."))?;
    Ok(surface.partial_derivatives().to_vec())
}

#[wasm_bindgen]
pub fn probe_surface(parameters: JsValue, x: f64, y: f64, z: f64) -> Result<JsValue, JsValue> {
    let parameters: SurfaceParameters = from_value(parameters)
        .map_err(|err| JsValue::from_str(&format!("Invalid surface parameters: {err}")))?;
    let probe = probe(&parameters, [x, y, z]).map_err(to_js_error)?;
    to_value(&probe).map_err(|err| JsValue::from_str(&format!("Failed to serialize probe: {err}")))
}

#[wasm_bindgen]
pub fn custom_surface_partials(expression: &str, parameters: JsValue) -> Result<JsValue, JsValue> {
    let parameters: BTreeMap<String, f64> = if parameters.is_undefined() || parameters.is_null() {
        BTreeMap::new()
    } else {
        from_value(parameters)
            .map_err(|err| JsValue::from_str(&format!("Invalid parameters: {err}")))?
    };
    let printed = partials(expression, &parameters).map_err(to_js_error)?;
    to_value(&printed)
        .map_err(|err| JsValue::from_str(&format!("Failed to serialize partials: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reports_value_gradient_and_frame() {
        let parameters = SurfaceParameters::Ellipsoid {
            a: 3.5,
            b: 2.5,
            c: 1.5,
        };
        let probe = probe(&parameters, [3.5, 0.0, 0.0]).unwrap();
        assert!(probe.value.abs() < 1e-12);
        assert!(probe.gradient[0] > 0.0);
        assert!(probe.gradient[1].abs() < 1e-12 && probe.gradient[2].abs() < 1e-12);
        let frame = probe.frame.expect("frame on the surface");
        assert!((frame.normal - Vector3::x()).norm() < 1e-12);
    }

    #[test]
    fn probe_rejects_degenerate_torus() {
        let parameters = SurfaceParameters::Torus {
            major_radius: 1.0,
            minor_radius: 2.0,
        };
        let err = probe(&parameters, [0.0, 0.0, 0.0]).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid surface parameters"));
    }

    #[test]
    fn partials_print_parseable_derivatives() {
        let mut parameters = BTreeMap::new();
        parameters.insert("k".to_string(), 2.0);
        let printed = partials("k * x^2 + y^2 + z^2 - 1", &parameters).unwrap();
        assert_eq!(printed.len(), 3);
        assert!(printed[0].contains('k') && printed[0].contains('x'), "{}", printed[0]);
        assert!(!printed[1].contains('x'), "{}", printed[1]);
    }

    #[test]
    fn partials_reject_malformed_formula() {
        let err = partials("x +", &BTreeMap::new()).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid custom surface"));
    }
}
