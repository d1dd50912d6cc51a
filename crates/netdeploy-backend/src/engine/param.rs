//! Parser for the text structural description (`.param`).
//!
//! ```text
//! 7767517
//! 3 3
//! Input        data   0 1 data 0=4 1=4 2=1
//! Convolution  conv1  1 1 data conv1 0=2 1=3 5=1 6=18
//! ReLU         relu1  1 1 conv1 out
//! ```
//!
//! Scalar params are `id=value`; a value containing `.`, `e` or `E` is a
//! float. Array params use the key `-23300 - id` and the value
//! `count,v0,v1,...`.

use std::collections::HashMap;

use crate::error::EngineError;

/// Magic number on the first line of every param file.
pub const PARAM_MAGIC: i32 = 7_767_517;

const MAX_PARAM_ID: i32 = 32;
const ARRAY_KEY_BASE: i32 = -23300;

/// A single layer parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
}

/// Layer parameters keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamDict {
    values: HashMap<i32, ParamValue>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: i32, value: ParamValue) {
        self.values.insert(id, value);
    }

    pub fn contains(&self, id: i32) -> bool {
        self.values.contains_key(&id)
    }

    /// Integer param, accepting a float written for an int slot.
    pub fn get_int(&self, id: i32, default: i32) -> i32 {
        match self.values.get(&id) {
            Some(ParamValue::Int(v)) => *v,
            Some(ParamValue::Float(v)) => *v as i32,
            _ => default,
        }
    }

    /// Float param, accepting an int written for a float slot.
    pub fn get_float(&self, id: i32, default: f32) -> f32 {
        match self.values.get(&id) {
            Some(ParamValue::Float(v)) => *v,
            Some(ParamValue::Int(v)) => *v as f32,
            _ => default,
        }
    }

    pub fn get_ints(&self, id: i32) -> Vec<i32> {
        match self.values.get(&id) {
            Some(ParamValue::IntArray(v)) => v.clone(),
            Some(ParamValue::FloatArray(v)) => v.iter().map(|&f| f as i32).collect(),
            _ => Vec::new(),
        }
    }

    pub fn get_floats(&self, id: i32) -> Vec<f32> {
        match self.values.get(&id) {
            Some(ParamValue::FloatArray(v)) => v.clone(),
            Some(ParamValue::IntArray(v)) => v.iter().map(|&i| i as f32).collect(),
            _ => Vec::new(),
        }
    }
}

/// One layer line of a param file.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDecl {
    pub layer_type: String,
    pub name: String,
    pub bottoms: Vec<String>,
    pub tops: Vec<String>,
    pub params: ParamDict,
    /// 1-based line number in the source, for error reporting.
    pub line: usize,
}

/// Parsed structural description.
#[derive(Debug, Clone, PartialEq)]
pub struct NetParam {
    pub layers: Vec<LayerDecl>,
    pub blob_count: usize,
}

impl NetParam {
    /// Parse the text form of a param file.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let (line_no, magic_line) = lines.next().ok_or_else(|| EngineError::Param {
            line: 0,
            reason: "empty param file".to_string(),
        })?;
        let magic: i32 = magic_line.parse().map_err(|_| param_err(line_no, "missing magic number"))?;
        if magic != PARAM_MAGIC {
            return Err(param_err(
                line_no,
                format!("bad magic {}, expected {}", magic, PARAM_MAGIC),
            ));
        }

        let (line_no, counts_line) = lines
            .next()
            .ok_or_else(|| param_err(line_no, "missing layer and blob counts"))?;
        let counts: Vec<usize> = counts_line
            .split_whitespace()
            .map(|t| t.parse::<usize>())
            .collect::<Result<_, _>>()
            .map_err(|_| param_err(line_no, "layer and blob counts must be integers"))?;
        let &[layer_count, blob_count] = counts.as_slice() else {
            return Err(param_err(line_no, "expected `layer_count blob_count`"));
        };

        let mut layers = Vec::with_capacity(layer_count);
        for (line_no, line) in lines {
            layers.push(parse_layer_line(line_no, line)?);
        }

        if layers.len() != layer_count {
            return Err(EngineError::Param {
                line: 2,
                reason: format!("declared {} layers, found {}", layer_count, layers.len()),
            });
        }

        Ok(Self { layers, blob_count })
    }
}

fn param_err(line: usize, reason: impl Into<String>) -> EngineError {
    EngineError::Param {
        line,
        reason: reason.into(),
    }
}

fn parse_layer_line(line_no: usize, line: &str) -> Result<LayerDecl, EngineError> {
    let mut tokens = line.split_whitespace();

    let mut next = |what: &str| {
        tokens
            .next()
            .map(str::to_string)
            .ok_or_else(|| param_err(line_no, format!("missing {}", what)))
    };

    let layer_type = next("layer type")?;
    let name = next("layer name")?;
    let bottom_count: usize = next("bottom count")?
        .parse()
        .map_err(|_| param_err(line_no, "bottom count must be an integer"))?;
    let top_count: usize = next("top count")?
        .parse()
        .map_err(|_| param_err(line_no, "top count must be an integer"))?;

    let bottoms = (0..bottom_count)
        .map(|_| next("bottom blob name"))
        .collect::<Result<Vec<_>, _>>()?;
    let tops = (0..top_count)
        .map(|_| next("top blob name"))
        .collect::<Result<Vec<_>, _>>()?;

    let mut params = ParamDict::new();
    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| param_err(line_no, format!("malformed param `{}`", token)))?;
        let key: i32 = key
            .parse()
            .map_err(|_| param_err(line_no, format!("malformed param id `{}`", key)))?;

        if key <= ARRAY_KEY_BASE {
            let id = ARRAY_KEY_BASE - key;
            check_id(line_no, id)?;
            params.set(id, parse_array(line_no, value)?);
        } else {
            check_id(line_no, key)?;
            params.set(key, parse_scalar(line_no, value)?);
        }
    }

    Ok(LayerDecl {
        layer_type,
        name,
        bottoms,
        tops,
        params,
        line: line_no,
    })
}

fn check_id(line_no: usize, id: i32) -> Result<(), EngineError> {
    if (0..MAX_PARAM_ID).contains(&id) {
        Ok(())
    } else {
        Err(param_err(line_no, format!("param id {} out of range", id)))
    }
}

fn is_float_literal(value: &str) -> bool {
    value.contains(['.', 'e', 'E'])
}

fn parse_scalar(line_no: usize, value: &str) -> Result<ParamValue, EngineError> {
    if is_float_literal(value) {
        value
            .parse::<f32>()
            .map(ParamValue::Float)
            .map_err(|_| param_err(line_no, format!("bad float `{}`", value)))
    } else {
        value
            .parse::<i32>()
            .map(ParamValue::Int)
            .map_err(|_| param_err(line_no, format!("bad int `{}`", value)))
    }
}

fn parse_array(line_no: usize, value: &str) -> Result<ParamValue, EngineError> {
    let mut parts = value.split(',');
    let count: usize = parts
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| param_err(line_no, format!("bad array `{}`", value)))?;
    let items: Vec<&str> = parts.collect();
    if items.len() != count {
        return Err(param_err(
            line_no,
            format!("array declares {} items, found {}", count, items.len()),
        ));
    }

    if items.iter().any(|v| is_float_literal(v)) {
        items
            .iter()
            .map(|v| v.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map(ParamValue::FloatArray)
            .map_err(|_| param_err(line_no, format!("bad float array `{}`", value)))
    } else {
        items
            .iter()
            .map(|v| v.parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map(ParamValue::IntArray)
            .map_err(|_| param_err(line_no, format!("bad int array `{}`", value)))
    }
}
