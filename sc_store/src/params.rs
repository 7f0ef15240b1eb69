//! Parameters stored one value per field.
//!
//! A parameter record is walked through its `serde_json` representation:
//! objects become subgroups, scalars and homogeneous arrays become values.
//! Reading folds the group back into JSON, so fields absent from older
//! documents fall back to the record's `#[serde(default)]`s.

use anyhow::{Context, Result};
use sc_types::PipelineError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number, Value as Json};

use crate::document::{Group, Node, Value};

/// Write every field of `params` into `group`.
pub fn write_parameters<P: Serialize>(group: &mut Group, params: &P) -> Result<()> {
    match serde_json::to_value(params).context("failed to encode parameters")? {
        Json::Object(fields) => write_object(group, fields),
        other => Err(PipelineError::format(format!(
            "parameters must be a record, got {other}"
        ))
        .into()),
    }
}

/// Read a parameter record from `group`.
pub fn read_parameters<P: DeserializeOwned>(group: &Group) -> Result<P> {
    serde_json::from_value(group_to_json(group)).context("failed to decode parameters")
}

fn write_object(group: &mut Group, fields: Map<String, Json>) -> Result<()> {
    for (name, field) in fields {
        match field {
            Json::Object(inner) => write_object(group.create_group(&name), inner)?,
            other => group.write(
                &name,
                json_to_value(other).with_context(|| format!("failed to encode {name:?}"))?,
            ),
        }
    }
    Ok(())
}

fn json_to_value(json: Json) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => number_to_value(&n),
        Json::String(s) => Value::Str(s),
        Json::Array(items) => array_to_value(items)?,
        Json::Object(_) => {
            return Err(PipelineError::format("nested record inside an array").into());
        }
    })
}

fn number_to_value(n: &Number) -> Value {
    match n.as_i64() {
        Some(i) => Value::Int(i),
        None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

fn array_to_value(items: Vec<Json>) -> Result<Value> {
    if items.iter().all(Json::is_boolean) {
        if items.is_empty() {
            return Ok(Value::IntArray(Vec::new()));
        }
        return Ok(Value::BoolArray(
            items.iter().filter_map(Json::as_bool).collect(),
        ));
    }
    if items.iter().all(Json::is_i64) {
        return Ok(Value::IntArray(
            items.iter().filter_map(Json::as_i64).collect(),
        ));
    }
    if items.iter().all(Json::is_number) {
        return Ok(Value::FloatArray(
            items.iter().filter_map(Json::as_f64).collect(),
        ));
    }
    if items.iter().all(Json::is_string) {
        return Ok(Value::StrArray(
            items
                .into_iter()
                .filter_map(|s| match s {
                    Json::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
        ));
    }
    Err(PipelineError::format("arrays must hold a single scalar type").into())
}

fn float_to_json(x: f64) -> Json {
    Number::from_f64(x).map_or(Json::Null, Json::Number)
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::Float(x) => float_to_json(*x),
        Value::Str(s) => Json::String(s.clone()),
        Value::BoolArray(v) => Json::Array(v.iter().map(|&b| Json::Bool(b)).collect()),
        Value::IntArray(v) => Json::Array(v.iter().map(|&i| Json::Number(i.into())).collect()),
        Value::FloatArray(v) => Json::Array(v.iter().map(|&x| float_to_json(x)).collect()),
        Value::StrArray(v) => Json::Array(v.iter().cloned().map(Json::String).collect()),
    }
}

/// Fold a group back into a JSON object.
pub fn group_to_json(group: &Group) -> Json {
    Json::Object(
        group
            .iter()
            .map(|(name, node)| {
                let json = match node {
                    Node::Group(g) => group_to_json(g),
                    Node::Value(v) => value_to_json(v),
                };
                (name.to_string(), json)
            })
            .collect(),
    )
}
