//! Provenance manifests for compute and monitoring runs.
//!
//! A manifest is content addressed: `snapshot_id` hashes the manifest with
//! `created_at` and the volatile platform fields removed, so re-running the
//! same inputs on another day or another host produces the same id.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::Date;

use crate::canonical::{canonical_hash, canonical_json, sha256_hex};
use crate::{format_date, iso_date, PipelineError};

pub const MANIFEST_SCHEMA_VERSION: i64 = 1;

/// Build and host provenance captured at run time. `git_commit` and
/// `package_version` identify the code and survive into the snapshot hash;
/// `os` and `arch` are recorded for forensics only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeMetadata {
    pub git_commit: String,
    pub package_version: String,
    pub os: String,
    pub arch: String,
}

impl CodeMetadata {
    #[must_use]
    pub fn collect() -> Self {
        let git_commit = ["GIT_SHA", "GITHUB_SHA", "COMMIT_SHA"]
            .iter()
            .find_map(|name| std::env::var(name).ok())
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            git_commit,
            package_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "git_commit": self.git_commit,
            "package_version": self.package_version,
            "os": self.os,
            "arch": self.arch,
        })
    }
}

/// The five-part key that names one recommendation. Two computes with equal
/// identities are the same logical run and must produce byte-identical
/// payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeIdentity {
    pub boundary_id: String,
    pub herd_config_id: String,
    #[serde(with = "iso_date")]
    pub calculation_date: Date,
    pub logic_version: String,
    pub config_hash: String,
}

impl ComputeIdentity {
    /// # Errors
    /// Returns [`PipelineError::Validation`] when canonicalization fails.
    pub fn to_value(&self) -> Result<Value, PipelineError> {
        Ok(json!({
            "boundary_id": self.boundary_id,
            "herd_config_id": self.herd_config_id,
            "calculation_date": format_date(self.calculation_date)?,
            "logic_version": self.logic_version,
            "config_hash": self.config_hash,
        }))
    }

    /// Deterministic run id: first 32 hex chars of the canonical identity
    /// hash.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when canonicalization fails.
    pub fn run_id(&self) -> Result<String, PipelineError> {
        let digest = sha256_hex(&canonical_json(&self.to_value()?)?);
        Ok(digest[..32].to_string())
    }
}

/// Full provenance record written next to each compute run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunManifest {
    pub schema_version: i64,
    pub run_type: String,
    pub run_id: String,
    pub created_at: String,
    pub code: CodeMetadata,
    pub identity: Value,
    pub inputs: Value,
    pub dq_summary: Value,
    pub outputs: Value,
}

impl RunManifest {
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": self.schema_version,
            "run_type": self.run_type,
            "run_id": self.run_id,
            "created_at": self.created_at,
            "code": self.code.to_value(),
            "identity": self.identity,
            "inputs": self.inputs,
            "dq_summary": self.dq_summary,
            "outputs": self.outputs,
        })
    }

    /// The manifest with run-variant fields removed: `created_at` plus the
    /// host fields of `code`. This is the content that gets hashed.
    #[must_use]
    pub fn snapshot_material(&self) -> Value {
        let mut material = match self.to_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        material.remove("created_at");
        if let Some(Value::Object(code)) = material.get_mut("code") {
            code.remove("os");
            code.remove("arch");
        }
        Value::Object(material)
    }

    /// Content hash of [`Self::snapshot_material`].
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when canonicalization fails.
    pub fn snapshot_id(&self) -> Result<String, PipelineError> {
        canonical_hash(&self.snapshot_material())
    }

    /// Canonical bytes persisted to the manifest file.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when canonicalization fails.
    pub fn to_canonical_json(&self) -> Result<String, PipelineError> {
        canonical_json(&self.to_value())
    }
}
