//! Closed-loop scenario execution.
//!
//! One virtual user walks a scenario's steps in declared order. For each
//! step the session store prepares the headers (cookies + preferred
//! credential), the engine executes the request, cookies and extraction
//! rules are applied, and response assertions run — so step *i*'s effects
//! are visible to step *i+1*. Assertion failures are reported, never
//! fatal; with `fail_fast` the walk stops at the first failed step.

use crate::assertions::run_response_assertions;
use crate::engine::Engine;
use crate::scenario::{Scenario, ScenarioStep};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Result of executing a single step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_name: String,

    /// Transport success AND no failed assertions.
    pub success: bool,

    /// 0 when the request never produced a response.
    pub status_code: u16,

    pub response_time_ms: u64,

    /// Transport or dispatch error, if any.
    pub error: Option<String>,

    pub assertions_passed: usize,
    pub assertions_failed: usize,

    /// Failure message of every failed assertion.
    pub assertion_failures: Vec<String>,
}

/// Result of executing an entire scenario for one virtual user.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub scenario_name: String,
    pub user_id: String,
    pub success: bool,
    pub steps: Vec<StepOutcome>,
    pub steps_completed: usize,
    pub total_time_ms: u64,
}

/// Executor walking scenarios against an engine.
pub struct ScenarioExecutor {
    engine: Arc<Engine>,
}

impl ScenarioExecutor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Execute `scenario` as virtual user `user_id`.
    pub async fn run(&self, scenario: &Scenario, user_id: &str) -> ScenarioOutcome {
        let started = Instant::now();
        let mut steps = Vec::with_capacity(scenario.steps.len());
        let mut all_success = true;

        info!(
            scenario = %scenario.name,
            user_id,
            step_count = scenario.steps.len(),
            "Starting scenario"
        );

        for step in &scenario.steps {
            let outcome = self.run_step(step, user_id).await;
            let step_failed = !outcome.success;
            steps.push(outcome);

            if step_failed {
                all_success = false;
                if scenario.fail_fast {
                    error!(
                        scenario = %scenario.name,
                        user_id,
                        step = %step.name,
                        "Step failed, stopping scenario"
                    );
                    break;
                }
            }

            if let Some(think_time) = &step.think_time {
                let delay = think_time.delay();
                debug!(step = %step.name, delay_ms = delay.as_millis() as u64, "Think time");
                sleep(delay).await;
            }
        }

        let outcome = ScenarioOutcome {
            scenario_name: scenario.name.clone(),
            user_id: user_id.to_string(),
            success: all_success,
            steps_completed: steps.len(),
            steps,
            total_time_ms: started.elapsed().as_millis() as u64,
        };

        if outcome.success {
            info!(
                scenario = %scenario.name,
                user_id,
                total_time_ms = outcome.total_time_ms,
                "Scenario completed"
            );
        } else {
            warn!(
                scenario = %scenario.name,
                user_id,
                steps_completed = outcome.steps_completed,
                "Scenario finished with failures"
            );
        }
        outcome
    }

    async fn run_step(&self, step: &ScenarioStep, user_id: &str) -> StepOutcome {
        let sessions = self.engine.sessions();
        let variables = sessions.variables_snapshot(user_id);

        // Substitute ${var} references, then let the session layer add
        // cookies and the preferred credential.
        let mut request = step.request.clone();
        request.url = substitute_variables(&request.url, &variables);
        request.body = substitute_variables(&request.body, &variables);
        let base_headers = substitute_variables(&request.headers, &variables);
        request.headers = sessions.prepare_request_headers(user_id, &base_headers);

        debug!(step = %step.name, user_id, url = %request.url, "Executing step");

        let record = match self.engine.execute(&request).await {
            Ok(record) => record,
            Err(e) => {
                error!(step = %step.name, user_id, error = %e, "Step dispatch failed");
                return StepOutcome {
                    step_name: step.name.clone(),
                    success: false,
                    status_code: 0,
                    response_time_ms: 0,
                    error: Some(e.to_string()),
                    assertions_passed: 0,
                    assertions_failed: 0,
                    assertion_failures: Vec::new(),
                };
            }
        };

        sessions.auto_handle_cookies(user_id, &record);
        sessions.auto_capture_bearer(user_id, &record);
        sessions.process_response(user_id, &record, &step.extract);

        let outcomes = run_response_assertions(&step.assertions, &record);
        let assertions_passed = outcomes.iter().filter(|o| o.passed).count();
        let assertion_failures: Vec<String> = outcomes
            .into_iter()
            .filter_map(|o| o.message)
            .collect();
        let assertions_failed = assertion_failures.len();

        for failure in &assertion_failures {
            warn!(step = %step.name, user_id, failure = %failure, "Assertion failed");
        }

        let success = record.success && assertions_failed == 0;
        let error = if record.success {
            None
        } else {
            Some(record.error_message.clone())
        };

        StepOutcome {
            step_name: step.name.clone(),
            success,
            status_code: record.status_code,
            response_time_ms: record.response_time_ms(),
            error,
            assertions_passed,
            assertions_failed,
            assertion_failures,
        }
    }
}

/// Replace `${name}` references with session-variable values.
fn substitute_variables(input: &str, variables: &HashMap<String, Value>) -> String {
    if !input.contains("${") {
        return input.to_string();
    }
    let mut result = input.to_string();
    for (name, value) in variables {
        let pattern = format!("${{{name}}}");
        if result.contains(&pattern) {
            result = result.replace(&pattern, &value_to_string(value));
        }
    }
    result
}

/// Render a JSON value the way it should appear inside a URL or body:
/// strings bare, everything else in JSON form.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
