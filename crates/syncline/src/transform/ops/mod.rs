//! The operator library. Every operator consumes and produces "ordered
//! sequence of rows, each a mapping from column name to value".

mod aggregate;
mod cleansing;
mod dedup;
mod expression;
mod geolocation;
mod join;
mod json_parser;
mod lookup;
mod normalizer;
mod rank;
mod router;
mod sequence;
mod sorter;
mod union;
mod validation;
mod window;

pub use aggregate::AggregateTransformation;
pub use cleansing::DataCleansingTransformation;
pub use dedup::DeduplicationTransformation;
pub use expression::ExpressionTransformation;
pub use geolocation::GeolocationTransformation;
pub use join::JoinTransformation;
pub use json_parser::JsonParserTransformation;
pub use lookup::{lookup_cache_key, LookupTransformation};
pub use normalizer::NormalizerTransformation;
pub use rank::RankTransformation;
pub use router::RouterTransformation;
pub use sequence::SequenceGeneratorTransformation;
pub use sorter::SorterTransformation;
pub use union::UnionTransformation;
pub use validation::DataValidationTransformation;
pub use window::WindowFunctionsTransformation;

use super::{TransformError, Transformation};
use crate::row::Value;

/// The complete built-in operator set, in registry order.
pub fn builtin_operators() -> Vec<Box<dyn Transformation>> {
    vec![
        Box::new(AggregateTransformation),
        Box::new(JoinTransformation),
        Box::new(UnionTransformation),
        Box::new(SorterTransformation),
        Box::new(RankTransformation),
        Box::new(WindowFunctionsTransformation),
        Box::new(ExpressionTransformation),
        Box::new(LookupTransformation),
        Box::new(RouterTransformation),
        Box::new(DeduplicationTransformation),
        Box::new(DataCleansingTransformation),
        Box::new(DataValidationTransformation),
        Box::new(NormalizerTransformation),
        Box::new(SequenceGeneratorTransformation),
        Box::new(JsonParserTransformation),
        Box::new(GeolocationTransformation),
    ]
}

// Small config-extraction helpers shared by the operators.

pub(crate) fn require_str<'a>(
    config: &'a Value,
    key: &str,
    operator: &'static str,
) -> Result<&'a str, TransformError> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| TransformError::invalid(operator, format!("missing or invalid {key}")))
}

pub(crate) fn require_array<'a>(
    config: &'a Value,
    key: &str,
    operator: &'static str,
) -> Result<&'a Vec<Value>, TransformError> {
    config
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| TransformError::invalid(operator, format!("missing or invalid {key}")))
}

pub(crate) fn optional_str<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str)
}

pub(crate) fn string_list(
    config: &Value,
    key: &str,
    operator: &'static str,
) -> Result<Vec<String>, TransformError> {
    let array = require_array(config, key, operator)?;
    array
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| TransformError::invalid(operator, format!("{key} must hold strings")))
        })
        .collect()
}

pub(crate) fn optional_string_list(
    config: &Value,
    key: &str,
    operator: &'static str,
) -> Result<Vec<String>, TransformError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(_) => string_list(config, key, operator),
    }
}
