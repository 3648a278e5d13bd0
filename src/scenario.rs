//! Scenario definitions.
//!
//! A scenario is an ordered list of request descriptors with optional
//! per-step assertions and extraction rules; a virtual user walks the
//! steps in declared order, its session store carrying state between them.

use crate::assertions::ResponseAssertion;
use crate::extractor::ExtractRule;
use crate::request::RequestDescriptor;
use rand::Rng;
use std::time::Duration;

/// Pause applied after a step completes, simulating user behaviour.
#[derive(Debug, Clone)]
pub enum ThinkTime {
    Fixed(Duration),
    /// Uniformly random delay in `[min, max]`.
    Random { min: Duration, max: Duration },
}

impl ThinkTime {
    pub fn delay(&self) -> Duration {
        match self {
            ThinkTime::Fixed(d) => *d,
            ThinkTime::Random { min, max } => {
                let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
                if hi <= lo {
                    return *min;
                }
                Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
            }
        }
    }
}

/// One step of a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioStep {
    /// Descriptive name (e.g. "Login", "Add to Cart").
    pub name: String,

    /// The request to execute. URL, headers and body may reference session
    /// variables with `${name}` syntax.
    pub request: RequestDescriptor,

    /// Response-level predicates checked against the step's response.
    pub assertions: Vec<ResponseAssertion>,

    /// Correlation rules binding response values into the session store.
    pub extract: Vec<ExtractRule>,

    /// Optional pause after the step.
    pub think_time: Option<ThinkTime>,
}

impl ScenarioStep {
    pub fn new(name: impl Into<String>, request: RequestDescriptor) -> Self {
        Self {
            name: name.into(),
            request,
            assertions: Vec::new(),
            extract: Vec::new(),
            think_time: None,
        }
    }

    pub fn with_assertions(mut self, assertions: Vec<ResponseAssertion>) -> Self {
        self.assertions = assertions;
        self
    }

    pub fn with_extract(mut self, extract: Vec<ExtractRule>) -> Self {
        self.extract = extract;
        self
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = Some(think_time);
        self
    }
}

/// An ordered user journey.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<ScenarioStep>,

    /// Stop at the first failed step instead of walking the full journey.
    /// Assertion failures are reported either way.
    pub fail_fast: bool,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            fail_fast: false,
        }
    }

    pub fn step(mut self, step: ScenarioStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_builder() {
        let scenario = Scenario::new("checkout")
            .step(ScenarioStep::new(
                "browse",
                RequestDescriptor::get("https://shop.local/products"),
            ))
            .step(
                ScenarioStep::new("login", RequestDescriptor::post("https://shop.local/login", "{}"))
                    .with_think_time(ThinkTime::Fixed(Duration::from_millis(200))),
            )
            .fail_fast(true);

        assert_eq!(scenario.name, "checkout");
        assert_eq!(scenario.steps.len(), 2);
        assert!(scenario.fail_fast);
        assert!(scenario.steps[1].think_time.is_some());
    }

    #[test]
    fn test_fixed_think_time() {
        let t = ThinkTime::Fixed(Duration::from_millis(50));
        assert_eq!(t.delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_random_think_time_within_bounds() {
        let t = ThinkTime::Random {
            min: Duration::from_millis(10),
            max: Duration::from_millis(20),
        };
        for _ in 0..32 {
            let d = t.delay();
            assert!(d >= Duration::from_millis(10));
            assert!(d <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_random_think_time_degenerate_range() {
        let t = ThinkTime::Random {
            min: Duration::from_millis(30),
            max: Duration::from_millis(30),
        };
        assert_eq!(t.delay(), Duration::from_millis(30));
    }
}
