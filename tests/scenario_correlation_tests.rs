//! Multi-step scenario execution with correlation across steps.

use serde_json::json;
use stampede::assertions::ResponseAssertion;
use stampede::engine::{Engine, EngineConfig};
use stampede::executor::ScenarioExecutor;
use stampede::extractor::{ExtractRule, ExtractSource};
use stampede::request::RequestDescriptor;
use stampede::scenario::{Scenario, ScenarioStep};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_engine() -> Arc<Engine> {
    Arc::new(Engine::new(EngineConfig::default()).expect("engine build"))
}

#[tokio::test]
async fn test_login_correlation_feeds_next_step() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "sid=abc")
                .set_body_json(json!({"access_token": "T", "user": {"id": 42}})),
        )
        .mount(&server)
        .await;

    // The profile endpoint only answers when the correlated token and
    // cookie arrive.
    Mock::given(method("GET"))
        .and(path("/profile/42"))
        .and(header("Authorization", "Bearer T"))
        .and(header("Cookie", "sid=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let scenario = Scenario::new("login-then-profile")
        .step(
            ScenarioStep::new(
                "login",
                RequestDescriptor::post(format!("{}/login", server.uri()), "{}"),
            )
            .with_assertions(vec![ResponseAssertion::StatusIs(200)])
            .with_extract(vec![
                ExtractRule {
                    source: ExtractSource::JsonPath,
                    key: "access_token".to_string(),
                    variable: "tok".to_string(),
                },
                ExtractRule {
                    source: ExtractSource::JsonPath,
                    key: "user.id".to_string(),
                    variable: "uid".to_string(),
                },
                ExtractRule {
                    source: ExtractSource::Cookie,
                    key: "sid".to_string(),
                    variable: "s".to_string(),
                },
            ]),
        )
        .step(
            ScenarioStep::new(
                "profile",
                RequestDescriptor::get(format!("{}/profile/${{uid}}", server.uri())),
            )
            .with_assertions(vec![ResponseAssertion::StatusIs(200)]),
        );

    let engine = test_engine();
    let executor = ScenarioExecutor::new(engine.clone());
    let outcome = executor.run(&scenario, "vu-1").await;

    assert!(outcome.success, "steps: {:?}", outcome.steps);
    assert_eq!(outcome.steps_completed, 2);

    // The extracted variables are bound in the session store.
    let sessions = engine.sessions();
    assert_eq!(sessions.get("vu-1", "tok"), Some(json!("T")));
    assert_eq!(sessions.get("vu-1", "uid"), Some(json!(42)));
    assert_eq!(sessions.get("vu-1", "s"), Some(json!("abc")));

    // And prepared headers carry the correlated credential + cookie.
    let headers = sessions.prepare_request_headers("vu-1", "");
    assert!(headers.contains("Authorization: Bearer T\n"), "{headers}");
    assert!(headers.contains("Cookie: sid=abc\n"), "{headers}");
}

#[tokio::test]
async fn test_session_isolation_between_virtual_users() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access_token": "T-alice"})),
        )
        .mount(&server)
        .await;

    let scenario = Scenario::new("login").step(ScenarioStep::new(
        "login",
        RequestDescriptor::post(format!("{}/login", server.uri()), "{}"),
    ));

    let engine = test_engine();
    let executor = ScenarioExecutor::new(engine.clone());
    executor.run(&scenario, "alice").await;

    // Writes under alice are never observable under bob.
    let headers = engine.sessions().prepare_request_headers("bob", "");
    assert!(!headers.contains("T-alice"));
    assert!(engine.sessions().get_token("bob", "bearer").is_none());
}

#[tokio::test]
async fn test_variable_substitution_in_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/seed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"order_id": "ord-9"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/confirm"))
        .and(body_string_contains("ord-9"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let scenario = Scenario::new("order-flow")
        .step(
            ScenarioStep::new(
                "seed",
                RequestDescriptor::post(format!("{}/seed", server.uri()), "{}"),
            )
            .with_extract(vec![ExtractRule {
                source: ExtractSource::JsonPath,
                key: "order_id".to_string(),
                variable: "order".to_string(),
            }]),
        )
        .step(ScenarioStep::new(
            "confirm",
            RequestDescriptor::post(
                format!("{}/confirm", server.uri()),
                r#"{"order": "${order}"}"#,
            ),
        ));

    let executor = ScenarioExecutor::new(test_engine());
    let outcome = executor.run(&scenario, "vu-1").await;
    assert!(outcome.success, "steps: {:?}", outcome.steps);
}

#[tokio::test]
async fn test_assertion_failures_are_reported_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
        .mount(&server)
        .await;

    let scenario = Scenario::new("soft-failures")
        .step(
            ScenarioStep::new("first", RequestDescriptor::get(server.uri())).with_assertions(
                vec![
                    ResponseAssertion::StatusIs(201),
                    ResponseAssertion::BodyContains {
                        needle: "fine".to_string(),
                        case_sensitive: true,
                    },
                ],
            ),
        )
        .step(ScenarioStep::new("second", RequestDescriptor::get(server.uri())));

    let executor = ScenarioExecutor::new(test_engine());
    let outcome = executor.run(&scenario, "vu-1").await;

    // The failed assertion marks the step, but the walk continues.
    assert!(!outcome.success);
    assert_eq!(outcome.steps_completed, 2);
    assert_eq!(outcome.steps[0].assertions_failed, 1);
    assert_eq!(outcome.steps[0].assertions_passed, 1);
    assert!(outcome.steps[0].assertion_failures[0].contains("expected 201, got 200"));
    assert!(outcome.steps[1].success);
}

#[tokio::test]
async fn test_fail_fast_stops_the_walk() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let scenario = Scenario::new("strict")
        .step(ScenarioStep::new(
            "bad",
            RequestDescriptor::get(format!("{}/bad", server.uri())),
        ))
        .step(ScenarioStep::new(
            "never-reached",
            RequestDescriptor::get(format!("{}/bad", server.uri())),
        ))
        .fail_fast(true);

    let engine = test_engine();
    let executor = ScenarioExecutor::new(engine.clone());
    let outcome = executor.run(&scenario, "vu-1").await;

    assert!(!outcome.success);
    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(engine.metrics_snapshot().total_requests, 1);
}

#[tokio::test]
async fn test_step_effects_ordered_within_user() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": "first"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": "second"})))
        .mount(&server)
        .await;

    let rule = |var: &str| ExtractRule {
        source: ExtractSource::JsonPath,
        key: "v".to_string(),
        variable: var.to_string(),
    };

    let scenario = Scenario::new("ordered")
        .step(
            ScenarioStep::new("a", RequestDescriptor::get(format!("{}/a", server.uri())))
                .with_extract(vec![rule("seen")]),
        )
        .step(
            ScenarioStep::new("b", RequestDescriptor::get(format!("{}/b", server.uri())))
                .with_extract(vec![rule("seen")]),
        );

    let engine = test_engine();
    let executor = ScenarioExecutor::new(engine.clone());
    let outcome = executor.run(&scenario, "vu-1").await;

    assert!(outcome.success);
    // Step 2's write lands after step 1's: the final value is "second".
    assert_eq!(engine.sessions().get("vu-1", "seen"), Some(json!("second")));
    assert_eq!(
        engine.metrics_snapshot().total_requests,
        2,
        "every step credits exactly once"
    );

    engine.sessions().remove_session("vu-1");
    assert_eq!(engine.sessions().get("vu-1", "seen"), None);
}

#[tokio::test]
async fn test_think_time_is_applied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let scenario = Scenario::new("paced").step(
        ScenarioStep::new("only", RequestDescriptor::get(server.uri())).with_think_time(
            stampede::scenario::ThinkTime::Fixed(Duration::from_millis(150)),
        ),
    );

    let executor = ScenarioExecutor::new(test_engine());
    let outcome = executor.run(&scenario, "vu-1").await;

    assert!(outcome.success);
    assert!(outcome.total_time_ms >= 150);
}
