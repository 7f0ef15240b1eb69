//! The state document: named groups holding typed values.

use anyhow::{Context, Result};
use sc_types::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed leaf of the document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StrArray(Vec<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::BoolArray(_) => "bool array",
            Value::IntArray(_) => "int array",
            Value::FloatArray(_) => "float array",
            Value::StrArray(_) => "string array",
        }
    }
}

/// A child of a group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Group(Group),
    Value(Value),
}

/// An ordered set of named children.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    children: BTreeMap<String, Node>,
}

fn missing(kind: &str, name: &str) -> anyhow::Error {
    PipelineError::format(format!("missing {kind} {name:?}")).into()
}

impl Group {
    pub fn new() -> Self {
        Group::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn group(&self, name: &str) -> Result<&Group> {
        self.group_opt(name).ok_or_else(|| missing("group", name))
    }

    pub fn group_opt(&self, name: &str) -> Option<&Group> {
        match self.children.get(name) {
            Some(Node::Group(g)) => Some(g),
            _ => None,
        }
    }

    pub fn group_mut(&mut self, name: &str) -> Result<&mut Group> {
        match self.children.get_mut(name) {
            Some(Node::Group(g)) => Ok(g),
            _ => Err(missing("group", name)),
        }
    }

    /// Get or create a subgroup; a value of the same name is replaced.
    pub fn create_group(&mut self, name: &str) -> &mut Group {
        let node = self
            .children
            .entry(name.to_string())
            .or_insert_with(|| Node::Group(Group::new()));
        if !matches!(node, Node::Group(_)) {
            *node = Node::Group(Group::new());
        }
        match node {
            Node::Group(g) => g,
            Node::Value(_) => unreachable!(),
        }
    }

    pub fn insert_group(&mut self, name: &str, group: Group) {
        self.children.insert(name.to_string(), Node::Group(group));
    }

    pub fn remove(&mut self, name: &str) -> Option<Node> {
        self.children.remove(name)
    }

    /// Remove a subgroup, if there is one under that name.
    pub fn take_group(&mut self, name: &str) -> Option<Group> {
        match self.children.remove(name) {
            Some(Node::Group(g)) => Some(g),
            Some(other) => {
                self.children.insert(name.to_string(), other);
                None
            }
            None => None,
        }
    }

    /// Move a child to a new name. Returns false if there was nothing to move.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.children.remove(from) {
            Some(node) => {
                self.children.insert(to.to_string(), node);
                true
            }
            None => false,
        }
    }

    pub fn write(&mut self, name: &str, value: impl Into<Value>) {
        self.children
            .insert(name.to_string(), Node::Value(value.into()));
    }

    pub fn value(&self, name: &str) -> Result<&Value> {
        self.value_opt(name).ok_or_else(|| missing("dataset", name))
    }

    pub fn value_opt(&self, name: &str) -> Option<&Value> {
        match self.children.get(name) {
            Some(Node::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn read<T: FromValue>(&self, name: &str) -> Result<T> {
        T::from_value(self.value(name)?).with_context(|| format!("failed to read {name:?}"))
    }

    /// Read a value that may be absent or null.
    pub fn read_opt<T: FromValue>(&self, name: &str) -> Result<Option<T>> {
        match self.value_opt(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(
                T::from_value(v).with_context(|| format!("failed to read {name:?}"))?,
            )),
        }
    }
}

/// Conversion from a stored value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &str, value: &Value) -> anyhow::Error {
    PipelineError::format(format!(
        "expected {expected}, found {}",
        value.type_name()
    ))
    .into()
}

fn to_index(x: i64) -> Result<usize> {
    usize::try_from(x)
        .map_err(|_| PipelineError::format(format!("negative index {x}")).into())
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            v => Err(mismatch("bool", v)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            v => Err(mismatch("int", v)),
        }
    }
}

impl FromValue for usize {
    fn from_value(value: &Value) -> Result<Self> {
        to_index(i64::from_value(value)?)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(x) => Ok(*x),
            Value::Int(i) => Ok(*i as f64),
            v => Err(mismatch("float", v)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(s.clone()),
            v => Err(mismatch("string", v)),
        }
    }
}

impl FromValue for Vec<bool> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::BoolArray(v) => Ok(v.clone()),
            Value::IntArray(v) => Ok(v.iter().map(|&i| i != 0).collect()),
            v => Err(mismatch("bool array", v)),
        }
    }
}

impl FromValue for Vec<i64> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::IntArray(v) => Ok(v.clone()),
            v => Err(mismatch("int array", v)),
        }
    }
}

impl FromValue for Vec<usize> {
    fn from_value(value: &Value) -> Result<Self> {
        Vec::<i64>::from_value(value)?
            .into_iter()
            .map(to_index)
            .collect()
    }
}

impl FromValue for Vec<u32> {
    fn from_value(value: &Value) -> Result<Self> {
        Vec::<i64>::from_value(value)?
            .into_iter()
            .map(|x| {
                u32::try_from(x)
                    .map_err(|_| PipelineError::format(format!("code {x} out of range")).into())
            })
            .collect()
    }
}

impl FromValue for Vec<f64> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::FloatArray(v) => Ok(v.clone()),
            Value::IntArray(v) => Ok(v.iter().map(|&i| i as f64).collect()),
            v => Err(mismatch("float array", v)),
        }
    }
}

impl FromValue for Vec<String> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::StrArray(v) => Ok(v.clone()),
            v => Err(mismatch("string array", v)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::BoolArray(v)
    }
}

impl From<&[bool]> for Value {
    fn from(v: &[bool]) -> Self {
        Value::BoolArray(v.to_vec())
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::IntArray(v)
    }
}

impl From<&[usize]> for Value {
    fn from(v: &[usize]) -> Self {
        Value::IntArray(v.iter().map(|&x| x as i64).collect())
    }
}

impl From<&[u32]> for Value {
    fn from(v: &[u32]) -> Self {
        Value::IntArray(v.iter().map(|&x| i64::from(x)).collect())
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::FloatArray(v)
    }
}

impl From<&[f64]> for Value {
    fn from(v: &[f64]) -> Self {
        Value::FloatArray(v.to_vec())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StrArray(v)
    }
}

impl From<&[String]> for Value {
    fn from(v: &[String]) -> Self {
        Value::StrArray(v.to_vec())
    }
}
