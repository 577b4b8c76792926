//! Shared test fixtures: a scripted primitive executor with per-primitive
//! outcome queues, dispatch recording, and optional completion delays.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use operon_core::error::Result;
use operon_core::traits::PrimitiveExecutor;
use operon_core::types::{Primitive, PrimitiveId, PrimitiveOutcome};
use operon_core::Evidence;

pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<PrimitiveOutcome>>>,
    delays: HashMap<String, u64>,
    dispatches: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delays: HashMap::new(),
            dispatches: Mutex::new(Vec::new()),
        }
    }

    /// Queue an explicit outcome for the next dispatch of `id`.
    pub fn push(&self, id: &str, outcome: PrimitiveOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(outcome);
    }

    pub fn succeed_with(&self, id: &str, output: serde_json::Value) {
        self.push(id, PrimitiveOutcome::success(PrimitiveId::new(id), output));
    }

    pub fn fail(&self, id: &str, times: usize) {
        for _ in 0..times {
            self.push(id, PrimitiveOutcome::failed(PrimitiveId::new(id), "scripted failure"));
        }
    }

    /// Success with evidence carrying a token count, for budget tests.
    pub fn succeed_with_tokens(&self, id: &str, tokens: u64) {
        let outcome = PrimitiveOutcome::success(PrimitiveId::new(id), serde_json::Value::Null)
            .with_evidence(vec![Evidence::new("llm_call", "scripted response")
                .with_metadata(serde_json::json!({"tokens": tokens}))]);
        self.push(id, outcome);
    }

    /// Delay completions of `id` by `ms` milliseconds.
    pub fn with_delay(mut self, id: &str, ms: u64) -> Self {
        self.delays.insert(id.to_string(), ms);
        self
    }

    pub fn dispatch_order(&self) -> Vec<String> {
        self.dispatches.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self, id: &str) -> usize {
        self.dispatches
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.as_str() == id)
            .count()
    }

    pub fn total_dispatches(&self) -> usize {
        self.dispatches.lock().unwrap().len()
    }
}

impl PrimitiveExecutor for ScriptedExecutor {
    fn execute(
        &self,
        primitive: Primitive,
        _input: serde_json::Value,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<PrimitiveOutcome>> {
        Box::pin(async move {
            let id = primitive.id.to_string();
            self.dispatches.lock().unwrap().push(id.clone());

            if let Some(ms) = self.delays.get(&id) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }

            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&id)
                .and_then(|queue| queue.pop_front());
            Ok(scripted.unwrap_or_else(|| {
                PrimitiveOutcome::success(
                    primitive.id.clone(),
                    serde_json::json!({ format!("{}_done", id): true }),
                )
            }))
        })
    }
}
