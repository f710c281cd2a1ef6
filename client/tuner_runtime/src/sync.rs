//! Materialize a node description into containers, and route patches.
//!
//! The raw parameter tree is rewritten post-order: children first, each
//! wrapped in its own [`ParamCell`], then the parent group holding those
//! cells. The id-index is filled during the same walk. Nothing is published
//! until the whole tree is built, so a malformed description leaves the
//! previous snapshot in place.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::ProtocolError;
use crate::observable::Observable;
use crate::outbound::Outbound;
use crate::param::{Param, ParamCell, ParamId, ParamKind, ParamRecord};
use crate::protocol::{NodeDescription, ParamPatch};
use crate::telemetry::TelemetryScope;

#[derive(Debug)]
pub struct NodeSnapshot {
    /// The node's address, as listed in the endpoint list.
    pub address: String,
    pub start_time: Option<f64>,
    /// Top-level parameters in display order.
    pub params: Vec<ParamCell>,
    pub id2param: HashMap<ParamId, ParamCell>,
    pub video_streams: Vec<String>,
    pub scopes: Vec<TelemetryScope>,
}

impl NodeSnapshot {
    pub fn build(
        description: NodeDescription,
        outbound: &Outbound,
        default_keep_last_secs: f64,
    ) -> Result<Self, ProtocolError> {
        let mut id2param = HashMap::new();
        let params = description
            .params
            .iter()
            .map(|raw| materialize(raw, outbound, &mut id2param))
            .collect::<Result<Vec<_>, _>>()?;

        let scopes = description
            .signal_scopes
            .iter()
            .map(|scope| TelemetryScope::from_description(scope, default_keep_last_secs))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            address: description.ip,
            start_time: description.start_time,
            params,
            id2param,
            video_streams: description.video_streams,
            scopes,
        })
    }

    pub fn param(&self, id: ParamId) -> Option<&ParamCell> {
        self.id2param.get(&id)
    }

    pub fn scope(&self, name: &str) -> Option<&TelemetryScope> {
        self.scopes.iter().find(|scope| scope.name == name)
    }

    /// Apply a batch of server patches through the remote path, so no
    /// container sends anything back.
    ///
    /// Every patch is resolved and merged before any container changes; one
    /// bad patch rejects the whole batch.
    pub fn apply_patches(&self, patches: &[ParamPatch]) -> Result<usize, ProtocolError> {
        let merged = patches
            .iter()
            .map(|patch| {
                let cell = self
                    .id2param
                    .get(&patch.id)
                    .ok_or(ProtocolError::UnknownParamId(patch.id))?;
                let next = cell.with(|current| current.merged(&patch.fields))?;
                Ok::<_, ProtocolError>((cell, next))
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;

        let applied = merged.len();
        for (cell, next) in merged {
            debug!(id = next.id, name = %next.name, "applying remote patch");
            cell.apply_remote(next);
        }
        Ok(applied)
    }
}

/// Wrap one raw record (and, for groups, its whole subtree) in containers.
fn materialize(
    raw: &Value,
    outbound: &Outbound,
    id2param: &mut HashMap<ParamId, ParamCell>,
) -> Result<ParamCell, ProtocolError> {
    let mut record = ParamRecord::from_value(raw)?;

    let param = match record.params.take() {
        Some(children) => {
            let params = children
                .iter()
                .map(|(name, child)| {
                    Ok::<_, ProtocolError>((name.clone(), materialize(child, outbound, id2param)?))
                })
                .collect::<Result<Vec<_>, ProtocolError>>()?;
            Param {
                id: record.id,
                name: record.name,
                kind: ParamKind::Hyper {
                    params,
                    hidden: record.hidden,
                },
            }
        }
        None => record.classify_leaf()?,
    };

    let id = param.id;
    let cell = param_cell(param, outbound.clone());
    if id2param.insert(id, cell.clone()).is_some() {
        return Err(ProtocolError::DuplicateParamId(id));
    }
    Ok(cell)
}

/// A container whose local edits are sent to the server as `[id, value]`.
pub fn param_cell(param: Param, outbound: Outbound) -> ParamCell {
    Observable::with_persist(param, move |param: &Param| {
        if let Some(value) = param.value() {
            outbound.param_changed(param.id, value);
        }
    })
}
