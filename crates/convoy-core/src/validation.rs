// crates/convoy-core/src/validation.rs

//! Job document validation
//!
//! Submissions are checked in two passes: the schemars-generated JSON schema
//! catches missing/ill-typed fields with readable messages, then semantic
//! pipeline checks enforce the invariants the schema cannot express: unique
//! step ids, resolvable `dependsOn` references, and an acyclic graph. The
//! static cycle check here fails earlier and with a clearer message than the
//! scheduler's runtime deadlock detection.

use crate::error::{ConvoyError, Result};
use crate::types::{Job, Step};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

pub fn job_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Job)
}

/// Validate a raw submission document and deserialize it into a [`Job`].
pub fn validate_job(doc: &Value) -> Result<Job> {
    let schema = job_schema();
    let schema_value =
        serde_json::to_value(&schema).map_err(|e| ConvoyError::validation(e.to_string()))?;
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_value)
        .map_err(|e| ConvoyError::validation(format!("schema compilation failed: {}", e)))?;

    compiled.validate(doc).map_err(|errors| {
        ConvoyError::validation(
            errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;

    let job: Job = serde_json::from_value(doc.clone())?;
    validate_job_struct(&job)?;
    Ok(job)
}

/// Semantic checks on an already-deserialized job.
pub fn validate_job_struct(job: &Job) -> Result<()> {
    if job.job_type.is_empty() {
        return Err(ConvoyError::validation("'type' must not be empty"));
    }
    if !matches!(job.queue.as_str(), "default" | "cpu" | "gpu") {
        return Err(ConvoyError::validation(format!(
            "unknown queue lane '{}' (expected default, cpu or gpu)",
            job.queue
        )));
    }
    if let Some(retry) = &job.retry {
        if retry.attempts == 0 {
            return Err(ConvoyError::validation("retry.attempts must be >= 1"));
        }
    }
    if let Some(steps) = &job.steps {
        if steps.is_empty() {
            return Err(ConvoyError::validation("'steps' must not be empty when present"));
        }
        validate_pipeline(steps)?;
    }
    Ok(())
}

/// Validate pipeline structure: unique ids, resolvable dependencies, no cycles.
pub fn validate_pipeline(steps: &[Step]) -> Result<()> {
    let mut ids = HashSet::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        if step.task.is_empty() {
            return Err(ConvoyError::validation(format!(
                "step {} has an empty 'task'",
                index
            )));
        }
        if let Some(cap) = step.for_each_concurrency {
            if cap == 0 {
                return Err(ConvoyError::validation(format!(
                    "step '{}': forEachConcurrency must be >= 1",
                    step.effective_id(index)
                )));
            }
        }
        if let Some(retry) = &step.retry {
            if retry.attempts == 0 {
                return Err(ConvoyError::validation(format!(
                    "step '{}': retry.attempts must be >= 1",
                    step.effective_id(index)
                )));
            }
        }
        let id = step.effective_id(index);
        if !ids.insert(id.clone()) {
            return Err(ConvoyError::validation(format!(
                "duplicate step id '{}'",
                id
            )));
        }
    }

    for (index, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if !ids.contains(dep) {
                return Err(ConvoyError::validation(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.effective_id(index),
                    dep
                )));
            }
            if *dep == step.effective_id(index) {
                return Err(ConvoyError::validation(format!(
                    "step '{}' depends on itself",
                    dep
                )));
            }
        }
    }

    detect_cycles(steps)
}

/// Kahn's algorithm over effective ids; leftover nodes form a cycle.
fn detect_cycles(steps: &[Step]) -> Result<()> {
    let ids: Vec<String> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| s.effective_id(i))
        .collect();
    let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (index, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            *indegree.entry(ids[index].as_str()).or_default() += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(ids[index].as_str());
        }
    }

    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut resolved = 0usize;

    while let Some(id) = ready.pop_front() {
        resolved += 1;
        if let Some(next) = dependents.get(id) {
            for &dependent in next {
                let degree = indegree
                    .get_mut(dependent)
                    .ok_or_else(|| ConvoyError::validation("dependency graph inconsistent"))?;
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    if resolved != steps.len() {
        let mut cyclic: Vec<String> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        cyclic.sort();
        return Err(ConvoyError::validation(format!(
            "circular dependency among steps {:?}",
            cyclic
        )));
    }
    Ok(())
}
