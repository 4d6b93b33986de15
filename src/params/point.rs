//! A single point of the parameter space.

use std::collections::BTreeMap;

use crate::wms::Req;

/// Describes one parameter name emitted by a source.
///
/// Tracked names participate in the job-identity hash; untracked names are
/// informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterMetadata {
    pub name: String,
    pub untracked: bool,
}

impl ParameterMetadata {
    pub fn tracked(name: impl Into<String>) -> Self {
        ParameterMetadata {
            name: name.into(),
            untracked: false,
        }
    }

    pub fn untracked(name: impl Into<String>) -> Self {
        ParameterMetadata {
            name: name.into(),
            untracked: true,
        }
    }
}

/// A mapping from parameter name to value plus backend-visible extras,
/// assembled by a single `fill` pass over the source tree. Callers treat a
/// returned point as immutable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterPoint {
    values: BTreeMap<String, String>,
    reqs: Vec<Req>,
    active: bool,
}

impl ParameterPoint {
    pub fn new() -> Self {
        ParameterPoint {
            values: BTreeMap::new(),
            reqs: Vec::new(),
            active: true,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Attach a per-point resource requirement annotation.
    pub fn add_req(&mut self, req: Req) {
        self.reqs.push(req);
    }

    pub fn reqs(&self) -> &[Req] {
        &self.reqs
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Identity hash over the tracked subset of this point's values.
    ///
    /// A point keeps its job number across resyncs exactly as long as this
    /// digest is unchanged.
    pub fn tracked_hash(&self, metadata: &[ParameterMetadata]) -> String {
        let mut material = String::new();
        for meta in metadata {
            if meta.untracked {
                continue;
            }
            if let Some(value) = self.values.get(&meta.name) {
                material.push_str(&meta.name);
                material.push('\0');
                material.push_str(value);
                material.push('\0');
            }
        }
        format!("{:x}", md5::compute(material.as_bytes()))
    }
}
