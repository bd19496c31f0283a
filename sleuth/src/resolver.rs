//! Dependency resolution for a requested probe.
//!
//! The `requires` graph is walked from the target before anything runs. Each
//! probe is placed at a depth (one more than its deepest prerequisite), so a
//! level only contains probes with no edge between them. Levels execute in
//! order; probes inside a level may run concurrently but are always logged in
//! plan order.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cancel::CancellationToken;
use crate::core::session::InvestigationSession;
use crate::core::signature::{Canonical, canonicalize};
use crate::core::types::{ProbeError, ProbeErrorKind, ProbeInvocation, ProbeOutcome};
use crate::error::InvestigationError;
use crate::io::probe_executor::{ProbeRun, execute_probe};
use crate::registry::{ProbeArgs, ProbeContext, ProbeRegistry, ProbeSpec, apply_patch};

/// Probes to run for a target, grouped by dependency depth. The target is
/// alone in the last level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPlan {
    pub levels: Vec<Vec<String>>,
}

impl ResolutionPlan {
    /// Probe names from furthest ancestor to the target.
    pub fn order(&self) -> Vec<&str> {
        self.levels.iter().flatten().map(String::as_str).collect()
    }
}

/// Build the execution plan for `target`, failing on unknown names or cycles.
pub fn plan(registry: &ProbeRegistry, target: &str) -> Result<ResolutionPlan, InvestigationError> {
    let mut chain = Vec::new();
    let mut depths = BTreeMap::new();
    let mut order = Vec::new();
    visit(registry, target, &mut chain, &mut depths, &mut order)?;

    let mut levels: Vec<Vec<String>> = Vec::new();
    for name in order {
        let depth = depths[&name];
        if levels.len() <= depth {
            levels.resize_with(depth + 1, Vec::new);
        }
        levels[depth].push(name);
    }
    Ok(ResolutionPlan { levels })
}

fn visit(
    registry: &ProbeRegistry,
    name: &str,
    chain: &mut Vec<String>,
    depths: &mut BTreeMap<String, usize>,
    order: &mut Vec<String>,
) -> Result<usize, InvestigationError> {
    if let Some(pos) = chain.iter().position(|seen| seen == name) {
        let mut cycle: Vec<String> = chain[pos..].to_vec();
        cycle.push(name.to_string());
        return Err(InvestigationError::DependencyCycle { chain: cycle });
    }
    if let Some(depth) = depths.get(name) {
        return Ok(*depth);
    }
    let spec = registry.get(name)?;
    chain.push(name.to_string());
    let mut depth = 0;
    for dep in &spec.dependencies {
        let upstream = visit(registry, &dep.requires, chain, depths, order)?;
        depth = depth.max(upstream + 1);
    }
    chain.pop();
    depths.insert(name.to_string(), depth);
    order.push(name.to_string());
    Ok(depth)
}

/// Inputs for one resolution.
pub struct ResolveRequest<'a> {
    pub target: &'a ProbeSpec,
    /// Prepared planner arguments for the target.
    pub target_args: ProbeArgs,
    /// Identity of the target as requested by the planner.
    pub target_canonical: Canonical,
    pub session: &'a InvestigationSession,
    pub step: u32,
    pub context: &'a ProbeContext,
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// Invocations produced by a resolution, in log order.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub invocations: Vec<ProbeInvocation>,
    /// Ancestor whose failure stopped the chain before the target ran.
    pub halted_by: Option<String>,
}

pub struct Resolver<'a> {
    registry: &'a ProbeRegistry,
    max_parallel: usize,
}

/// A probe ready to run within its level.
struct Scheduled<'s> {
    spec: &'s ProbeSpec,
    canonical: Canonical,
    args: ProbeArgs,
}

enum Prepared<'s> {
    Run(Scheduled<'s>),
    Reused(Value),
    Failed(ProbeInvocation),
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a ProbeRegistry, max_parallel: usize) -> Self {
        Self {
            registry,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Execute or reuse every prerequisite of the target, then the target.
    ///
    /// Only cancellation and planning errors are returned as `Err`; probe
    /// failures are part of the returned invocations.
    #[instrument(skip_all, fields(target = %request.target.name, step = request.step))]
    pub fn resolve(&self, request: ResolveRequest<'_>) -> Result<Resolution, InvestigationError> {
        let plan = plan(self.registry, &request.target.name)?;
        debug!(order = ?plan.order(), "resolution plan");

        let mut payloads: BTreeMap<String, Value> = BTreeMap::new();
        let mut invocations = Vec::new();
        let last_level = plan.levels.len().saturating_sub(1);

        for (depth, level) in plan.levels.iter().enumerate() {
            let mut prepared = Vec::with_capacity(level.len());
            for name in level {
                let spec = self.registry.get(name)?;
                let is_target = depth == last_level;
                prepared.push((
                    name.as_str(),
                    self.prepare(spec, is_target, &request, &payloads),
                ));
            }

            let runnable: Vec<&Scheduled<'_>> = prepared
                .iter()
                .filter_map(|(_, prep)| match prep {
                    Prepared::Run(scheduled) => Some(scheduled),
                    _ => None,
                })
                .collect();
            let mut runs = self.run_level(&runnable, &request)?.into_iter();

            let mut halted_by = None;
            for (name, prep) in prepared {
                let invocation = match prep {
                    Prepared::Reused(payload) => {
                        debug!(probe = name, "reusing earlier result");
                        payloads.insert(name.to_string(), payload);
                        continue;
                    }
                    Prepared::Failed(invocation) => invocation,
                    Prepared::Run(scheduled) => {
                        let Some(run) = runs.next() else {
                            continue;
                        };
                        to_invocation(request.step, &scheduled, run)
                    }
                };
                match invocation.outcome.payload() {
                    Some(payload) => {
                        payloads.insert(name.to_string(), payload.clone());
                    }
                    None => {
                        if depth != last_level && halted_by.is_none() {
                            warn!(probe = name, "prerequisite failed, target will not run");
                            halted_by = Some(name.to_string());
                        }
                    }
                }
                invocations.push(invocation);
            }

            if halted_by.is_some() {
                return Ok(Resolution {
                    invocations,
                    halted_by,
                });
            }
        }

        Ok(Resolution {
            invocations,
            halted_by: None,
        })
    }

    fn prepare<'s>(
        &self,
        spec: &'s ProbeSpec,
        is_target: bool,
        request: &ResolveRequest<'_>,
        payloads: &BTreeMap<String, Value>,
    ) -> Prepared<'s> {
        let base = if is_target {
            request.target_args.clone()
        } else {
            spec.default_args.clone()
        };
        let args = match patched_args(spec, base, payloads) {
            Ok(args) => args,
            Err(message) => {
                let canonical = if is_target {
                    request.target_canonical.clone()
                } else {
                    canonicalize(&spec.name, &Value::Object(spec.default_args.clone()))
                };
                let now = Utc::now();
                return Prepared::Failed(ProbeInvocation {
                    step: request.step,
                    probe_name: spec.name.clone(),
                    canonical_args: canonical.args,
                    signature: canonical.signature,
                    started_at: now,
                    finished_at: now,
                    outcome: ProbeOutcome::Error {
                        error: ProbeError {
                            kind: ProbeErrorKind::Execution,
                            message,
                            details: None,
                        },
                    },
                    was_skipped_as_duplicate: false,
                    effective_args: None,
                });
            }
        };

        if is_target {
            return Prepared::Run(Scheduled {
                spec,
                canonical: request.target_canonical.clone(),
                args,
            });
        }

        let canonical = canonicalize(&spec.name, &Value::Object(args.clone()));
        if let Some(payload) = request
            .session
            .successful_invocation(&canonical.signature)
            .and_then(|idx| request.session.probe_log()[idx].outcome.payload())
        {
            return Prepared::Reused(payload.clone());
        }
        Prepared::Run(Scheduled {
            spec,
            canonical,
            args,
        })
    }

    /// Run a level in chunks of `max_parallel`, returning results in input order.
    fn run_level(
        &self,
        runnable: &[&Scheduled<'_>],
        request: &ResolveRequest<'_>,
    ) -> Result<Vec<ProbeRun>, InvestigationError> {
        let mut runs = Vec::with_capacity(runnable.len());
        for chunk in runnable.chunks(self.max_parallel) {
            let results: Vec<Result<ProbeRun, InvestigationError>> = if chunk.len() == 1 {
                chunk
                    .iter()
                    .map(|scheduled| execute_scheduled(scheduled, request))
                    .collect()
            } else {
                thread::scope(|scope| {
                    let handles: Vec<_> = chunk
                        .iter()
                        .map(|scheduled| scope.spawn(move || execute_scheduled(scheduled, request)))
                        .collect();
                    handles
                        .into_iter()
                        .map(|handle| {
                            handle.join().unwrap_or_else(|_| {
                                Err(InvestigationError::ProbeExecution {
                                    probe: "resolver".to_string(),
                                    message: "scheduler thread panicked".to_string(),
                                })
                            })
                        })
                        .collect()
                })
            };
            for result in results {
                match result {
                    Ok(run) => runs.push(run),
                    Err(InvestigationError::SessionAborted) => {
                        return Err(InvestigationError::SessionAborted);
                    }
                    Err(other) => {
                        let now = Utc::now();
                        runs.push(ProbeRun {
                            outcome: ProbeOutcome::Error {
                                error: ProbeError {
                                    kind: ProbeErrorKind::Execution,
                                    message: other.to_string(),
                                    details: None,
                                },
                            },
                            started_at: now,
                            finished_at: now,
                        });
                    }
                }
            }
        }
        Ok(runs)
    }
}

fn execute_scheduled(
    scheduled: &Scheduled<'_>,
    request: &ResolveRequest<'_>,
) -> Result<ProbeRun, InvestigationError> {
    execute_probe(
        scheduled.spec,
        scheduled.args.clone(),
        request.context.clone(),
        request.timeout,
        request.cancel,
    )
}

/// Apply each dependency transform, in declaration order, to `base`.
fn patched_args(
    spec: &ProbeSpec,
    mut args: ProbeArgs,
    payloads: &BTreeMap<String, Value>,
) -> Result<ProbeArgs, String> {
    for dep in &spec.dependencies {
        let Some(payload) = payloads.get(&dep.requires) else {
            return Err(format!("missing result of prerequisite `{}`", dep.requires));
        };
        let transform = dep.transform.clone();
        let patch = catch_unwind(AssertUnwindSafe(|| transform(payload)))
            .map_err(|_| format!("transform from `{}` panicked", dep.requires))?;
        apply_patch(&mut args, patch);
    }
    Ok(args)
}

fn to_invocation(step: u32, scheduled: &Scheduled<'_>, run: ProbeRun) -> ProbeInvocation {
    let effective = Value::Object(scheduled.args.clone());
    let effective_args = (effective != scheduled.canonical.args).then_some(effective);
    ProbeInvocation {
        step,
        probe_name: scheduled.spec.name.clone(),
        canonical_args: scheduled.canonical.args.clone(),
        signature: scheduled.canonical.signature.clone(),
        started_at: run.started_at,
        finished_at: run.finished_at,
        outcome: run.outcome,
        was_skipped_as_duplicate: false,
        effective_args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::registry::ProbeFault;

    fn ok_probe(name: &str, payload: Value) -> ProbeSpec {
        ProbeSpec::new(
            name,
            name,
            move |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
                Ok(payload.clone())
            },
        )
    }

    fn ctx() -> ProbeContext {
        ProbeContext {
            workspace: PathBuf::from("."),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 1000,
        }
    }

    fn registry(specs: Vec<ProbeSpec>) -> ProbeRegistry {
        let mut builder = ProbeRegistry::builder();
        for spec in specs {
            builder = builder.register(spec).expect("register");
        }
        builder.build().expect("build")
    }

    fn resolve(
        registry: &ProbeRegistry,
        session: &InvestigationSession,
        target: &str,
        args: Value,
    ) -> Result<Resolution, InvestigationError> {
        let spec = registry.get(target).expect("target");
        let target_args = args.as_object().cloned().expect("object");
        let context = ctx();
        let cancel = CancellationToken::new();
        Resolver::new(registry, 4).resolve(ResolveRequest {
            target: spec,
            target_canonical: canonicalize(target, &args),
            target_args,
            session,
            step: 1,
            context: &context,
            timeout: Duration::from_secs(2),
            cancel: &cancel,
        })
    }

    #[test]
    fn plan_orders_ancestors_first() {
        let registry = registry(vec![
            ok_probe("a", json!(1)),
            ok_probe("b", json!(2)).requires("a", |_| ProbeArgs::new()),
            ok_probe("c", json!(3)).requires("b", |_| ProbeArgs::new()),
        ]);
        let plan = plan(&registry, "c").expect("plan");
        assert_eq!(plan.order(), vec!["a", "b", "c"]);
        assert_eq!(plan.levels.len(), 3);
    }

    #[test]
    fn diamond_shares_ancestor_and_groups_independent_probes() {
        let registry = registry(vec![
            ok_probe("root", json!(0)),
            ok_probe("left", json!(1)).requires("root", |_| ProbeArgs::new()),
            ok_probe("right", json!(2)).requires("root", |_| ProbeArgs::new()),
            ok_probe("top", json!(3))
                .requires("left", |_| ProbeArgs::new())
                .requires("right", |_| ProbeArgs::new()),
        ]);
        let plan = plan(&registry, "top").expect("plan");
        assert_eq!(
            plan.levels,
            vec![
                vec!["root".to_string()],
                vec!["left".to_string(), "right".to_string()],
                vec!["top".to_string()],
            ]
        );
    }

    #[test]
    fn cycle_is_reported_with_chain() {
        let registry = registry(vec![
            ok_probe("a", json!(1)).requires("b", |_| ProbeArgs::new()),
            ok_probe("b", json!(2)).requires("a", |_| ProbeArgs::new()),
        ]);
        let err = plan(&registry, "a").unwrap_err();
        assert_eq!(
            err,
            InvestigationError::DependencyCycle {
                chain: vec!["a".to_string(), "b".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn transform_patches_dependent_arguments() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_by_probe = seen.clone();
        let registry = registry(vec![
            ok_probe("detect", json!({"found": ["/srv/.env"]})),
            ProbeSpec::new(
                "read",
                "read",
                move |args: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
                    if let Ok(mut slot) = seen_by_probe.lock() {
                        *slot = Some(args.clone());
                    }
                    Ok(json!("contents"))
                },
            )
            .requires("detect", |payload| {
                let mut patch = ProbeArgs::new();
                patch.insert("files".to_string(), payload["found"].clone());
                patch
            }),
        ]);
        let session = InvestigationSession::with_id("inv-1", "p", "/srv", 3);
        let resolution = resolve(&registry, &session, "read", json!({"max_bytes": 10})).expect("resolve");

        let names: Vec<&str> = resolution
            .invocations
            .iter()
            .map(|inv| inv.probe_name.as_str())
            .collect();
        assert_eq!(names, vec!["detect", "read"]);
        let target = &resolution.invocations[1];
        assert_eq!(target.canonical_args, json!({"max_bytes": 10}));
        assert_eq!(
            target.effective_args,
            Some(json!({"max_bytes": 10, "files": ["/srv/.env"]}))
        );
        let seen = seen.lock().expect("lock").clone().expect("probe ran");
        assert_eq!(seen["files"], json!(["/srv/.env"]));
    }

    #[test]
    fn successful_prerequisite_in_log_is_reused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = registry(vec![
            ProbeSpec::new(
                "detect",
                "detect",
                move |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"found": []}))
                },
            ),
            ok_probe("read", json!("ok")).requires("detect", |_| ProbeArgs::new()),
        ]);
        let mut session = InvestigationSession::with_id("inv-1", "p", "/srv", 3);
        let first = resolve(&registry, &session, "read", json!({"n": 1})).expect("resolve");
        let mut draft = session.begin_step();
        for inv in first.invocations {
            draft.push_invocation(inv);
        }
        session.commit_step(draft, true).expect("commit");

        let second = resolve(&registry, &session, "read", json!({"n": 2})).expect("resolve");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.invocations.len(), 1);
        assert_eq!(second.invocations[0].probe_name, "read");
    }

    #[test]
    fn failed_prerequisite_stops_the_chain() {
        let registry = registry(vec![
            ProbeSpec::new(
                "detect",
                "detect",
                |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
                    Err(ProbeFault::new("permission denied"))
                },
            ),
            ok_probe("read", json!("ok")).requires("detect", |_| ProbeArgs::new()),
        ]);
        let session = InvestigationSession::with_id("inv-1", "p", "/srv", 3);
        let resolution = resolve(&registry, &session, "read", json!({})).expect("resolve");
        assert_eq!(resolution.halted_by.as_deref(), Some("detect"));
        assert_eq!(resolution.invocations.len(), 1);
        assert!(!resolution.invocations[0].outcome.is_success());
    }

    #[test]
    fn concurrent_prerequisites_are_logged_in_plan_order() {
        let registry = registry(vec![
            ProbeSpec::new(
                "alpha",
                "slow",
                |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
                    thread::sleep(Duration::from_millis(150));
                    Ok(json!("alpha"))
                },
            ),
            ok_probe("beta", json!("beta")),
            ok_probe("gamma", json!("gamma"))
                .requires("alpha", |_| ProbeArgs::new())
                .requires("beta", |_| ProbeArgs::new()),
        ]);
        let session = InvestigationSession::with_id("inv-1", "p", "/srv", 3);
        let resolution = resolve(&registry, &session, "gamma", json!({})).expect("resolve");
        let names: Vec<&str> = resolution
            .invocations
            .iter()
            .map(|inv| inv.probe_name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        assert!(resolution.invocations[1].finished_at <= resolution.invocations[0].finished_at);
    }

    #[test]
    fn panicking_transform_fails_only_the_dependent() {
        let registry = registry(vec![
            ok_probe("detect", json!({})),
            ok_probe("read", json!("ok")).requires("detect", |_| panic!("bad transform")),
        ]);
        let session = InvestigationSession::with_id("inv-1", "p", "/srv", 3);
        let resolution = resolve(&registry, &session, "read", json!({})).expect("resolve");
        assert_eq!(resolution.invocations.len(), 2);
        match &resolution.invocations[1].outcome {
            ProbeOutcome::Error { error } => assert!(error.message.contains("panicked")),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
