//! Tunable parameters as the server describes them.
//!
//! The wire record is loose (`{id, name, val, min?, max?, step?, log_scale?,
//! oneof?, params?, hidden?}`); [`ParamRecord::classify_leaf`] turns it into a
//! typed [`Param`]. Group ("hyper") parameters hold their children as
//! [`ParamCell`]s so each child can be observed and edited on its own.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{ParamError, ProtocolError};
use crate::observable::Observable;

pub type ParamId = u64;

/// A parameter container. Each parameter in a node's tree has exactly one.
pub type ParamCell = Observable<Param>;

/// The value half of an outbound `[id, value]` edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Vector(Vec<f64>),
}

impl ParamValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(flag) => Some(Self::Bool(*flag)),
            Value::Number(number) => number.as_f64().map(Self::Number),
            Value::String(text) => Some(Self::Text(text.clone())),
            Value::Array(items) => items
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<_>>>()
                .map(Self::Vector),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Bool(flag) => json!(flag),
            Self::Number(number) => json!(number),
            Self::Text(text) => json!(text),
            Self::Vector(items) => json!(items),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    Scalar(Scalar),
    Numeric {
        val: f64,
        min: Option<f64>,
        max: Option<f64>,
        step: Option<f64>,
        log_scale: bool,
    },
    Vector {
        val: Vec<f64>,
        min: Option<Vec<f64>>,
        max: Option<Vec<f64>>,
        step: Option<f64>,
        log_scale: bool,
    },
    Enum {
        val: ParamValue,
        oneof: Vec<ParamValue>,
    },
    /// Named children in server order; `hidden` names are not displayed.
    Hyper {
        params: Vec<(String, ParamCell)>,
        hidden: Vec<String>,
    },
}

impl ParamKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scalar(Scalar::Bool(_)) => "bool",
            Self::Scalar(Scalar::Text(_)) => "string",
            Self::Numeric { .. } => "number",
            Self::Vector { .. } => "vector",
            Self::Enum { .. } => "enum",
            Self::Hyper { .. } => "group",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub id: ParamId,
    pub name: String,
    pub kind: ParamKind,
}

impl Param {
    /// The value sent to the server for a local edit. Groups have none.
    pub fn value(&self) -> Option<ParamValue> {
        match &self.kind {
            ParamKind::Scalar(Scalar::Bool(flag)) => Some(ParamValue::Bool(*flag)),
            ParamKind::Scalar(Scalar::Text(text)) => Some(ParamValue::Text(text.clone())),
            ParamKind::Numeric { val, .. } => Some(ParamValue::Number(*val)),
            ParamKind::Vector { val, .. } => Some(ParamValue::Vector(val.clone())),
            ParamKind::Enum { val, .. } => Some(val.clone()),
            ParamKind::Hyper { .. } => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, ParamKind::Hyper { .. })
    }

    pub fn child(&self, name: &str) -> Option<&ParamCell> {
        match &self.kind {
            ParamKind::Hyper { params, .. } => params
                .iter()
                .find(|(child_name, _)| child_name == name)
                .map(|(_, cell)| cell),
            _ => None,
        }
    }

    pub fn visible_children(&self) -> Vec<(&str, &ParamCell)> {
        match &self.kind {
            ParamKind::Hyper { params, hidden } => params
                .iter()
                .filter(|(name, _)| !hidden.contains(name))
                .map(|(name, cell)| (name.as_str(), cell))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// A copy of this parameter holding `value`, for a local edit.
    pub fn with_value(&self, value: ParamValue) -> Result<Param, ParamError> {
        let id = self.id;
        let mismatch = |expected| ParamError::KindMismatch { id, expected };

        let kind = match (&self.kind, value) {
            (ParamKind::Scalar(Scalar::Bool(_)), ParamValue::Bool(flag)) => {
                ParamKind::Scalar(Scalar::Bool(flag))
            }
            (ParamKind::Scalar(Scalar::Bool(_)), _) => return Err(mismatch("bool")),
            (ParamKind::Scalar(Scalar::Text(_)), ParamValue::Text(text)) => {
                ParamKind::Scalar(Scalar::Text(text))
            }
            (ParamKind::Scalar(Scalar::Text(_)), _) => return Err(mismatch("string")),
            (
                ParamKind::Numeric {
                    min,
                    max,
                    step,
                    log_scale,
                    ..
                },
                ParamValue::Number(val),
            ) => ParamKind::Numeric {
                val,
                min: *min,
                max: *max,
                step: *step,
                log_scale: *log_scale,
            },
            (ParamKind::Numeric { .. }, _) => return Err(mismatch("number")),
            (
                ParamKind::Vector {
                    val: current,
                    min,
                    max,
                    step,
                    log_scale,
                },
                ParamValue::Vector(val),
            ) => {
                if val.len() != current.len() {
                    return Err(ParamError::VectorLength {
                        id,
                        expected: current.len(),
                        got: val.len(),
                    });
                }
                ParamKind::Vector {
                    val,
                    min: min.clone(),
                    max: max.clone(),
                    step: *step,
                    log_scale: *log_scale,
                }
            }
            (ParamKind::Vector { .. }, _) => return Err(mismatch("vector")),
            (ParamKind::Enum { oneof, .. }, val) => {
                if !oneof.contains(&val) {
                    return Err(ParamError::NotAnOption { id });
                }
                ParamKind::Enum {
                    val,
                    oneof: oneof.clone(),
                }
            }
            (ParamKind::Hyper { .. }, _) => return Err(ParamError::GroupHasNoValue { id }),
        };

        Ok(Param {
            id,
            name: self.name.clone(),
            kind,
        })
    }

    /// Shallow-merge server patch fields over this parameter.
    ///
    /// The merged record is classified again, so a patch may not leave the
    /// parameter in a shape the server could not have described. Groups keep
    /// their child containers; a patch may not replace them.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<Param, ProtocolError> {
        if patch.contains_key("params") {
            return Err(ProtocolError::PatchReplacesChildren(self.id));
        }

        let mut fields = self.fields();
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }

        let record = ParamRecord::from_value(&Value::Object(fields))?;
        if record.id != self.id {
            return Err(ProtocolError::MalformedParam {
                id: self.id,
                reason: format!("patch changes id to {}", record.id),
            });
        }

        match &self.kind {
            ParamKind::Hyper { params, .. } => Ok(Param {
                id: record.id,
                name: record.name,
                kind: ParamKind::Hyper {
                    params: params.clone(),
                    hidden: record.hidden,
                },
            }),
            _ => record.classify_leaf(),
        }
    }

    /// The wire fields of this parameter, without group children.
    fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("id".into(), json!(self.id));
        fields.insert("name".into(), json!(self.name));

        match &self.kind {
            ParamKind::Scalar(_) => {}
            ParamKind::Numeric {
                min,
                max,
                step,
                log_scale,
                ..
            } => {
                fields.insert("min".into(), json!(min));
                fields.insert("max".into(), json!(max));
                fields.insert("step".into(), json!(step));
                fields.insert("log_scale".into(), json!(log_scale));
            }
            ParamKind::Vector {
                min,
                max,
                step,
                log_scale,
                ..
            } => {
                fields.insert("min".into(), json!(min));
                fields.insert("max".into(), json!(max));
                fields.insert("step".into(), json!(step));
                fields.insert("log_scale".into(), json!(log_scale));
            }
            ParamKind::Enum { oneof, .. } => {
                let options: Vec<Value> = oneof.iter().map(ParamValue::to_json).collect();
                fields.insert("oneof".into(), Value::Array(options));
            }
            ParamKind::Hyper { hidden, .. } => {
                fields.insert("hidden".into(), json!(hidden));
            }
        }

        let val = self.value().map(|value| value.to_json()).unwrap_or(Value::Null);
        fields.insert("val".into(), val);
        fields
    }
}

/// One parameter record as sent by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamRecord {
    pub id: ParamId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub val: Value,
    #[serde(default)]
    pub min: Option<Value>,
    #[serde(default)]
    pub max: Option<Value>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub log_scale: Option<bool>,
    #[serde(default)]
    pub oneof: Option<Vec<Value>>,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
    #[serde(default)]
    pub hidden: Vec<String>,
}

impl ParamRecord {
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        Self::deserialize(value).map_err(|err| {
            let id = value.get("id").and_then(Value::as_u64);
            match id {
                Some(id) => ProtocolError::MalformedParam {
                    id,
                    reason: err.to_string(),
                },
                None => ProtocolError::malformed("parameter record", err.to_string()),
            }
        })
    }

    /// Type a non-group record. Groups are built by the tree synchronizer,
    /// which has to materialize their children first.
    pub fn classify_leaf(self) -> Result<Param, ProtocolError> {
        let id = self.id;
        let malformed = |reason: String| ProtocolError::MalformedParam { id, reason };

        if self.params.is_some() {
            return Err(malformed("group record classified as a leaf".into()));
        }

        let kind = if let Some(options) = &self.oneof {
            let val = ParamValue::from_json(&self.val)
                .ok_or_else(|| malformed(format!("unsupported enum value {}", self.val)))?;
            let oneof = options
                .iter()
                .map(|option| {
                    ParamValue::from_json(option)
                        .ok_or_else(|| malformed(format!("unsupported enum option {option}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            ParamKind::Enum { val, oneof }
        } else {
            let log_scale = self.log_scale.unwrap_or(false);
            match &self.val {
                Value::Bool(flag) => ParamKind::Scalar(Scalar::Bool(*flag)),
                Value::String(text) => ParamKind::Scalar(Scalar::Text(text.clone())),
                Value::Number(number) => ParamKind::Numeric {
                    val: number
                        .as_f64()
                        .ok_or_else(|| malformed(format!("non-finite number {number}")))?,
                    min: bound_scalar(self.min.as_ref()).map_err(&malformed)?,
                    max: bound_scalar(self.max.as_ref()).map_err(&malformed)?,
                    step: self.step,
                    log_scale,
                },
                Value::Array(_) => {
                    let Some(ParamValue::Vector(val)) = ParamValue::from_json(&self.val) else {
                        return Err(malformed("vector value must hold only numbers".into()));
                    };
                    let min = bound_vector(self.min.as_ref(), val.len()).map_err(&malformed)?;
                    let max = bound_vector(self.max.as_ref(), val.len()).map_err(&malformed)?;
                    ParamKind::Vector {
                        val,
                        min,
                        max,
                        step: self.step,
                        log_scale,
                    }
                }
                other => return Err(malformed(format!("unsupported value {other}"))),
            }
        };

        Ok(Param {
            id,
            name: self.name,
            kind,
        })
    }
}

fn bound_scalar(bound: Option<&Value>) -> Result<Option<f64>, String> {
    match bound {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| format!("numeric bound must be a number, got {value}")),
    }
}

/// Vector bounds may be given per component or as one number for all.
fn bound_vector(bound: Option<&Value>, len: usize) -> Result<Option<Vec<f64>>, String> {
    match bound {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64().map(|limit| vec![limit; len])),
        Some(Value::Array(items)) => {
            let limits = items
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| "vector bound must hold only numbers".to_string())?;
            if limits.len() != len {
                return Err(format!(
                    "vector bound has {} components, value has {len}",
                    limits.len()
                ));
            }
            Ok(Some(limits))
        }
        Some(other) => Err(format!("unsupported vector bound {other}")),
    }
}
