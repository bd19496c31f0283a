//! Probes compiled into the binary.

pub mod config;

use anyhow::Result;

use crate::registry::{ProbeRegistry, ProbeSpec};

/// Every built-in probe.
pub fn builtin_specs() -> Vec<ProbeSpec> {
    vec![config::detection_spec(), config::contents_spec()]
}

/// Registry of the built-ins plus `extra` (e.g. catalog command probes).
pub fn registry_with(extra: Vec<ProbeSpec>) -> Result<ProbeRegistry> {
    let mut builder = ProbeRegistry::builder();
    for spec in builtin_specs().into_iter().chain(extra) {
        builder = builder.register(spec)?;
    }
    builder.build()
}
