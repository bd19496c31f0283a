//! Test-only helpers: a scripted reasoner and canned probe contracts.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::ReasoningCall;
use crate::reasoning::{
    DiagnoseRequest, DigestRequest, HypothesesRequest, PlanRequest, ReasoningPort, StopRequest,
};
use crate::registry::{ProbeArgs, ProbeContext, ProbeFault, ProbeRegistry, ProbeSpec};

/// One canned reasoning reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Value(Value),
    /// The adapter reports an error.
    Fail(String),
    /// The adapter panics.
    Panic(String),
    /// The adapter answers after a delay.
    Delayed(Duration, Value),
}

/// Reasoner replaying per-call queues of replies.
///
/// The last reply of a queue repeats once the queue is drained. Calls with
/// no script fall back to a benign default, except `plan_probe`, which fails
/// so that unscripted tests never execute probes by accident.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    scripts: Mutex<HashMap<ReasoningCall, VecDeque<ScriptedReply>>>,
    calls: Mutex<HashMap<ReasoningCall, usize>>,
    requests: Mutex<Vec<(ReasoningCall, Value)>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `call`.
    pub fn push(self, call: ReasoningCall, reply: ScriptedReply) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(call)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn hypotheses(self, reply: Value) -> Self {
        self.push(ReasoningCall::GenerateHypotheses, ScriptedReply::Value(reply))
    }

    pub fn plan(self, reply: Value) -> Self {
        self.push(ReasoningCall::PlanProbe, ScriptedReply::Value(reply))
    }

    pub fn digest(self, reply: Value) -> Self {
        self.push(ReasoningCall::DigestEvidence, ScriptedReply::Value(reply))
    }

    pub fn stop(self, reply: Value) -> Self {
        self.push(ReasoningCall::DecideStop, ScriptedReply::Value(reply))
    }

    pub fn diagnose(self, reply: Value) -> Self {
        self.push(ReasoningCall::Diagnose, ScriptedReply::Value(reply))
    }

    /// Number of times `call` was invoked.
    pub fn calls(&self, call: ReasoningCall) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(&call)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").values().sum()
    }

    /// Serialized requests received for `call`, oldest first.
    pub fn requests(&self, call: ReasoningCall) -> Vec<Value> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|(c, _)| *c == call)
            .map(|(_, request)| request.clone())
            .collect()
    }

    fn answer<T: Serialize>(&self, call: ReasoningCall, request: &T) -> Result<Value> {
        *self.calls.lock().expect("calls lock").entry(call).or_default() += 1;
        let request = serde_json::to_value(request)?;
        self.requests
            .lock()
            .expect("requests lock")
            .push((call, request));

        // Released before acting so a panicking reply cannot poison the lock.
        let reply = {
            let mut scripts = self.scripts.lock().expect("scripts lock");
            match scripts.get_mut(&call) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(ScriptedReply::Value(value)) => Ok(value),
            Some(ScriptedReply::Fail(message)) => Err(anyhow!(message)),
            Some(ScriptedReply::Panic(message)) => panic!("{message}"),
            Some(ScriptedReply::Delayed(delay, value)) => {
                thread::sleep(delay);
                Ok(value)
            }
            None => default_reply(call),
        }
    }
}

fn default_reply(call: ReasoningCall) -> Result<Value> {
    match call {
        ReasoningCall::GenerateHypotheses => Ok(json!({"hypotheses": []})),
        ReasoningCall::PlanProbe => Err(anyhow!("no plan scripted")),
        ReasoningCall::DigestEvidence => Ok(json!({"findings": [], "hypothesis_updates": []})),
        ReasoningCall::DecideStop => Ok(json!({"should_stop": false, "rationale": "keep going"})),
        ReasoningCall::Diagnose => Ok(json!({
            "description": "scripted diagnosis",
            "confidence": "low",
            "recommended_fixes": []
        })),
    }
}

impl ReasoningPort for ScriptedReasoner {
    fn generate_hypotheses(&self, request: &HypothesesRequest) -> Result<Value> {
        self.answer(ReasoningCall::GenerateHypotheses, request)
    }

    fn plan_probe(&self, request: &PlanRequest) -> Result<Value> {
        self.answer(ReasoningCall::PlanProbe, request)
    }

    fn digest_evidence(&self, request: &DigestRequest) -> Result<Value> {
        self.answer(ReasoningCall::DigestEvidence, request)
    }

    fn decide_stop(&self, request: &StopRequest) -> Result<Value> {
        self.answer(ReasoningCall::DecideStop, request)
    }

    fn diagnose(&self, request: &DiagnoseRequest) -> Result<Value> {
        self.answer(ReasoningCall::Diagnose, request)
    }
}

/// Probe that always returns `payload`.
pub fn static_probe(name: &str, payload: Value) -> ProbeSpec {
    ProbeSpec::new(
        name,
        format!("{name} (static)"),
        move |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
            Ok(payload.clone())
        },
    )
}

/// Probe that echoes its arguments and counts executions.
pub fn counting_probe(name: &str, counter: Arc<AtomicUsize>) -> ProbeSpec {
    ProbeSpec::new(
        name,
        format!("{name} (counting)"),
        move |args: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(args.clone()))
        },
    )
}

/// Probe that reports a structured failure.
pub fn failing_probe(name: &str, message: &str) -> ProbeSpec {
    let message = message.to_string();
    ProbeSpec::new(
        name,
        format!("{name} (failing)"),
        move |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
            Err(ProbeFault::new(message.clone()))
        },
    )
}

/// Probe that panics.
pub fn panicking_probe(name: &str) -> ProbeSpec {
    ProbeSpec::new(
        name,
        format!("{name} (panicking)"),
        |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
            panic!("probe exploded");
        },
    )
}

/// Probe that sleeps before answering.
pub fn slow_probe(name: &str, delay: Duration) -> ProbeSpec {
    ProbeSpec::new(
        name,
        format!("{name} (slow)"),
        move |_: &ProbeArgs, _: &ProbeContext| -> Result<Value, ProbeFault> {
            thread::sleep(delay);
            Ok(json!({"slept_ms": delay.as_millis() as u64}))
        },
    )
}

/// Build a registry, panicking on invalid specs.
pub fn registry_of(specs: Vec<ProbeSpec>) -> ProbeRegistry {
    let mut builder = ProbeRegistry::builder();
    for spec in specs {
        builder = builder.register(spec).expect("register probe");
    }
    builder.build().expect("build registry")
}

/// Write `contents` to `root/relative`, creating parents.
pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, contents).expect("write file");
}
