use serde_json::json;

use super::{optional_str, require_str};
use crate::{
    row::{numeric_value, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "geolocation";
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Geospatial derivations: great-circle distance between two point columns
/// (Haversine, kilometers) and point-in-polygon membership (ray casting).
#[derive(Debug, Clone, Copy, Default)]
pub struct GeolocationTransformation;

impl Transformation for GeolocationTransformation {
    fn type_name(&self) -> &'static str {
        "geolocation"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let operation = require_str(config, "operation", OPERATOR)?;
        match operation {
            "distance" => {
                require_str(config, "point1_column", OPERATOR)?;
                require_str(config, "point2_column", OPERATOR)?;
            }
            "point_in_polygon" => {
                require_str(config, "point_column", OPERATOR)?;
                let polygon = config
                    .get("polygon")
                    .and_then(Value::as_array)
                    .ok_or_else(|| TransformError::invalid(OPERATOR, "polygon is required"))?;
                if polygon.len() < 3 {
                    return Err(TransformError::invalid(OPERATOR, "polygon needs >= 3 points"));
                }
            }
            other => {
                return Err(TransformError::invalid(
                    OPERATOR,
                    format!("invalid operation: {other}"),
                ))
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let operation = require_str(config, "operation", OPERATOR)?.to_string();
        let target_column = optional_str(config, "target_column")
            .unwrap_or("geolocation_result")
            .to_string();

        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            let value = match operation.as_str() {
                "distance" => {
                    let point1 = require_str(config, "point1_column", OPERATOR)?;
                    let point2 = require_str(config, "point2_column", OPERATOR)?;
                    match (
                        row.get(point1).and_then(parse_point),
                        row.get(point2).and_then(parse_point),
                    ) {
                        (Some(a), Some(b)) => json!(haversine_km(a, b)),
                        _ => Value::Null,
                    }
                }
                _ => {
                    let point_column = require_str(config, "point_column", OPERATOR)?;
                    let polygon: Vec<(f64, f64)> = config
                        .get("polygon")
                        .and_then(Value::as_array)
                        .map(|points| points.iter().filter_map(parse_point).collect())
                        .unwrap_or_default();
                    match row.get(point_column).and_then(parse_point) {
                        Some(point) if polygon.len() >= 3 => {
                            json!(point_in_polygon(point, &polygon))
                        }
                        _ => Value::Null,
                    }
                }
            };
            row.insert(target_column.clone(), value);
            out.push(row);
        }
        Ok(out)
    }
}

/// Accepts `{lat, lng}` / `{latitude, longitude}` objects and `[lat, lng]`
/// arrays.
fn parse_point(value: &Value) -> Option<(f64, f64)> {
    match value {
        Value::Object(object) => {
            let lat = object
                .get("lat")
                .or_else(|| object.get("latitude"))
                .and_then(numeric_value)?;
            let lng = object
                .get("lng")
                .or_else(|| object.get("longitude"))
                .and_then(numeric_value)?;
            Some((lat, lng))
        }
        Value::Array(items) if items.len() >= 2 => {
            Some((numeric_value(&items[0])?, numeric_value(&items[1])?))
        }
        _ => None,
    }
}

fn haversine_km((lat1, lon1): (f64, f64), (lat2, lon2): (f64, f64)) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Ray casting along a horizontal ray from the point.
fn point_in_polygon((px, py): (f64, f64), polygon: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if ((yi > py) != (yj > py)) && (px < (xj - xi) * (py - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}
