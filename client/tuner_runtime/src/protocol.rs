use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::param::{ParamId, ParamValue};

pub const CLIENT_TO_SERVER_CAP: usize = 65_536;
pub const SERVER_TO_CLIENT_CAP: usize = 1_048_576;

/// Endpoint identifier meaning "no node". Sent as `chosenNode` to deselect.
pub const NO_ENDPOINT: &str = "None";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    ChooseNode {
        #[serde(rename = "chosenNode")]
        chosen_node: String,
    },
    ParamChanged(ParamId, ParamValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Telemetry(TelemetryUpdate),
    PatchBatch(Vec<ParamPatch>),
    Endpoints(Vec<String>),
    NodeDescription(NodeDescription),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryUpdate {
    pub scope_index: usize,
    pub times: Vec<f64>,
    pub series: Vec<Vec<f64>>,
}

/// Changed fields of one parameter, addressed by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamPatch {
    pub id: ParamId,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeDescription {
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default, alias = "url")]
    pub ip: String,
    /// Raw parameter records; the synchronizer types them.
    pub params: Vec<Value>,
    #[serde(default)]
    pub video_streams: Vec<String>,
    #[serde(default)]
    pub signal_scopes: Vec<ScopeDescription>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScopeDescription {
    pub name: String,
    pub n: usize,
    #[serde(default)]
    pub styles: Option<Value>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub keep_last_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EndpointList {
    #[serde(alias = "available_nodes", alias = "availableNodes")]
    available_endpoints: Vec<String>,
}

const ENDPOINT_KEYS: [&str; 3] = ["available_endpoints", "available_nodes", "availableNodes"];

pub fn encode_client_message(message: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = rmp_serde::to_vec_named(message)?;
    if payload.len() > CLIENT_TO_SERVER_CAP {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: CLIENT_TO_SERVER_CAP,
        });
    }
    Ok(payload)
}

/// Decode a binary (msgpack) frame.
pub fn decode_server_frame(payload: &[u8], max_len: usize) -> Result<ServerMessage, ProtocolError> {
    check_len(payload.len(), max_len)?;
    let value: Value = rmp_serde::from_slice(payload)?;
    classify(value)
}

/// Decode a text (JSON) frame, as sent by older servers.
pub fn decode_server_text(payload: &str, max_len: usize) -> Result<ServerMessage, ProtocolError> {
    check_len(payload.len(), max_len)?;
    let value: Value = serde_json::from_str(payload)?;
    classify(value)
}

fn check_len(len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        Err(ProtocolError::FrameTooLarge { len, max })
    } else {
        Ok(())
    }
}

/// Disambiguate a decoded message by shape, in this order: telemetry
/// (array led by a number), patch batch (array led by a record), endpoint
/// list, node description.
pub fn classify(value: Value) -> Result<ServerMessage, ProtocolError> {
    match value {
        Value::Array(items) => {
            let leads_with_number = matches!(items.first(), Some(Value::Number(_)));
            let leads_with_record = matches!(
                items.first(),
                Some(Value::Object(first)) if first.contains_key("name") || first.contains_key("id")
            );

            if leads_with_number {
                decode_telemetry(items).map(ServerMessage::Telemetry)
            } else if leads_with_record {
                decode_patches(items).map(ServerMessage::PatchBatch)
            } else {
                Err(ProtocolError::UnknownShape(describe(&Value::Array(items))))
            }
        }
        Value::Object(map) if ENDPOINT_KEYS.iter().any(|key| map.contains_key(*key)) => {
            let list = EndpointList::deserialize(Value::Object(map))
                .map_err(|err| ProtocolError::malformed("endpoint list", err.to_string()))?;
            Ok(ServerMessage::Endpoints(list.available_endpoints))
        }
        Value::Object(map) if map.contains_key("params") => {
            let node = NodeDescription::deserialize(Value::Object(map))
                .map_err(|err| ProtocolError::malformed("node description", err.to_string()))?;
            Ok(ServerMessage::NodeDescription(node))
        }
        other => Err(ProtocolError::UnknownShape(describe(&other))),
    }
}

fn decode_telemetry(items: Vec<Value>) -> Result<TelemetryUpdate, ProtocolError> {
    let mut items = items.into_iter();

    let scope_index = items
        .next()
        .as_ref()
        .and_then(as_index)
        .ok_or_else(|| ProtocolError::malformed("telemetry update", "scope index is not an unsigned integer"))?;

    let times = items
        .next()
        .ok_or_else(|| ProtocolError::malformed("telemetry update", "missing time axis"))
        .and_then(|value| samples(&value, "time axis"))?;

    let series = items
        .map(|value| samples(&value, "series"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TelemetryUpdate {
        scope_index,
        times,
        series,
    })
}

fn as_index(value: &Value) -> Option<usize> {
    if let Some(index) = value.as_u64() {
        return usize::try_from(index).ok();
    }
    // Some encoders send small integers as floats.
    value
        .as_f64()
        .filter(|index| *index >= 0.0 && index.fract() == 0.0)
        .map(|index| index as usize)
}

/// A telemetry column: an array of numbers, or a bare number for one sample.
fn samples(value: &Value, what: &str) -> Result<Vec<f64>, ProtocolError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .map(|sample| vec![sample])
            .ok_or_else(|| ProtocolError::malformed("telemetry update", format!("{what} is not finite"))),
        Value::Array(items) => items
            .iter()
            .map(Value::as_f64)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                ProtocolError::malformed("telemetry update", format!("{what} holds a non-number"))
            }),
        other => Err(ProtocolError::malformed(
            "telemetry update",
            format!("{what} is {}", describe(other)),
        )),
    }
}

fn decode_patches(items: Vec<Value>) -> Result<Vec<ParamPatch>, ProtocolError> {
    items
        .into_iter()
        .map(|item| {
            let fields = match item {
                Value::Object(fields) => fields,
                other => {
                    return Err(ProtocolError::malformed(
                        "parameter patch",
                        format!("expected a record, got {}", describe(&other)),
                    ));
                }
            };
            let id = fields
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| ProtocolError::malformed("parameter patch", "missing integer id"))?;
            Ok(ParamPatch { id, fields })
        })
        .collect()
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "a bool".to_string(),
        Value::Number(_) => "a number".to_string(),
        Value::String(_) => "a string".to_string(),
        Value::Array(items) => format!("an array of {} item(s)", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("a record with keys [{}]", keys.join(", "))
        }
    }
}
