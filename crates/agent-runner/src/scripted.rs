//! Scripted runtime
//!
//! Deterministic stand-in for a real agent: plays a fixed plan of steps with
//! a configurable pause between them. Used by the demo server and tests.

use std::time::Duration;

use anyhow::bail;
use serde_json::{json, Value};
use tracing::debug;

use runwatch_core::StepKind;

use crate::runtime::{AgentRuntime, RunContext};

/// One scripted step
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub kind: StepKind,
    pub title: String,
    /// Tool calls made inside the step: (tool, input, output)
    pub tools: Vec<(String, Value, Value)>,
    /// Publish a non-fatal error instead of finishing the step cleanly
    pub fail_with: Option<String>,
}

impl ScriptStep {
    pub fn new(kind: StepKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            tools: Vec::new(),
            fail_with: None,
        }
    }

    pub fn tool(mut self, name: impl Into<String>, input: Value, output: Value) -> Self {
        self.tools.push((name.into(), input, output));
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedRuntime {
    steps: Vec<ScriptStep>,
    step_delay: Duration,
    answer: Option<String>,
}

impl ScriptedRuntime {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            step_delay: Duration::ZERO,
            answer: None,
        }
    }

    /// Search, reason, run code, answer.
    pub fn demo() -> Self {
        Self::new(vec![
            ScriptStep::new(StepKind::Tool, "Searching the web").tool(
                "web_search",
                json!({ "query": "{query}" }),
                json!({ "results": 5 }),
            ),
            ScriptStep::new(StepKind::Thinking, "Reading sources"),
            ScriptStep::new(StepKind::Coding, "Running analysis").tool(
                "python",
                json!({ "code": "summary = analyze(results)" }),
                json!({ "stdout": "ok" }),
            ),
            ScriptStep::new(StepKind::Thinking, "Drafting answer"),
        ])
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fixed answer; defaults to one derived from the query.
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    /// Turn step `index` into a failing step.
    pub fn with_failure_at(mut self, index: usize, message: impl Into<String>) -> Self {
        if let Some(step) = self.steps.get_mut(index) {
            step.fail_with = Some(message.into());
        }
        self
    }

    fn pause(&self, ctx: &RunContext) -> anyhow::Result<()> {
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        if ctx.is_cancelled() {
            bail!("run cancelled");
        }
        Ok(())
    }
}

impl AgentRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run(&self, ctx: &RunContext) -> anyhow::Result<String> {
        let publisher = &ctx.publisher;
        publisher.publish(
            runwatch_core::EventType::SessionState,
            json!({ "state": "running", "query": ctx.query }),
        )?;

        let plan: Vec<_> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s.title))
            .collect();
        publisher.planning(None, "Plan", &plan.join("\n"))?;

        for (index, step) in self.steps.iter().enumerate() {
            self.pause(ctx)?;
            let sequence = index as u32 + 1;
            debug!(session_id = %ctx.session_id, sequence, "Running scripted step");

            let scope = publisher.step(sequence, step.kind, json!({ "title": step.title }))?;
            for (tool, input, output) in &step.tools {
                let input = substitute_query(input, &ctx.query);
                scope.tool_execution(tool, input, output.clone())?;
            }

            match &step.fail_with {
                Some(message) => {
                    scope.error(message.as_str())?;
                }
                None => {
                    scope.finish(json!({ "title": step.title }))?;
                }
            }
        }

        self.pause(ctx)?;
        Ok(self
            .answer
            .clone()
            .unwrap_or_else(|| format!("Answer to: {}", ctx.query)))
    }
}

fn substitute_query(value: &Value, query: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace("{query}", query)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_query(v, query)))
                .collect(),
        ),
        other => other.clone(),
    }
}
