use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use campus_agents::config::ServiceConfig;
use campus_agents::data::{Connections, InMemoryStore};
use campus_agents::provider::{LlmError, LlmGateway, PromptPayload};
use campus_agents::{Collaborators, ErrorKind, PipelineKind, PipelineRegistry, PipelineResponse};
use serde_json::{json, Map, Value};

/// Answers every prompt the same way, or fails every prompt.
struct FixedLlm {
    answer: Option<Value>,
    calls: AtomicUsize,
}

impl FixedLlm {
    fn answering(answer: Value) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer),
            calls: AtomicUsize::new(0),
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmGateway for FixedLlm {
    async fn invoke(&self, _prompt: &PromptPayload, _timeout: Duration) -> Result<Value, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .clone()
            .ok_or_else(|| LlmError::CallFailed("connection refused".into()))
    }
}

/// Never answers.
struct HangingLlm;

#[async_trait]
impl LlmGateway for HangingLlm {
    async fn invoke(&self, _prompt: &PromptPayload, _timeout: Duration) -> Result<Value, LlmError> {
        futures::future::pending::<()>().await;
        Ok(Value::Null)
    }
}

async fn campus() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    let profiles = [
        json!({"uid": "ana", "name": "Ana", "major": "CS", "year": 2,
               "interests": ["AI", "Robotics"], "campusId": "main",
               "locationLat": 40.0, "locationLng": -74.0}),
        json!({"uid": "ben", "name": "Ben", "major": "CS", "year": 2,
               "interests": ["AI", "Robotics"], "campusId": "main",
               "locationLat": 40.001, "locationLng": -74.0}),
        json!({"uid": "cy", "name": "Cy", "major": "Biology", "year": 4,
               "interests": ["Hiking"], "campusId": "main",
               "locationLat": 40.002, "locationLng": -74.0}),
        json!({"uid": "dee", "name": "Dee", "major": "CS", "year": 3,
               "interests": ["AI"], "campusId": "main",
               "locationLat": 40.0, "locationLng": -74.001}),
    ];
    for profile in profiles {
        store.insert_profile("t1", profile).await.unwrap();
    }
    store
        .set_connections(
            "ana",
            "t1",
            Connections {
                blocked: vec!["dee".into()],
                ..Connections::default()
            },
        )
        .await;
    store
}

fn registry(store: Arc<InMemoryStore>, llm: Arc<dyn LlmGateway>) -> PipelineRegistry {
    PipelineRegistry::build(Collaborators::new(store, llm, ServiceConfig::default())).unwrap()
}

fn input(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn matching_degrades_when_llm_is_down() {
    let llm = FixedLlm::down();
    let registry = registry(campus().await, llm.clone());

    let response = registry
        .invoke("matching", input(json!({"user_id": "ana", "tenant_id": "t1"})))
        .await;

    assert!(response.success);
    assert!(response.degraded);
    assert!(response.degraded_reason.is_some());
    let matches = response.result.unwrap()["matches"].clone();
    let ids: Vec<&str> = matches
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    // Blocked users never appear; the CS/AI peer outranks the biologist.
    assert_eq!(ids, vec!["ben", "cy"]);
    assert!(matches[0]["score"].as_f64().unwrap() > matches[1]["score"].as_f64().unwrap());
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn matching_uses_llm_reasoning_when_available() {
    let llm = FixedLlm::answering(json!({
        "why_compatible": "You both like robots",
        "conversation_starter": "Robotics club?"
    }));
    let registry = registry(campus().await, llm.clone());

    let response = registry
        .invoke("matching", input(json!({"user_id": "ana", "tenant_id": "t1"})))
        .await;

    assert!(response.success);
    assert!(!response.degraded);
    let result = response.result.unwrap();
    assert_eq!(result["matches"][0]["why_compatible"], json!("You both like robots"));
    assert_eq!(result["metadata"]["reasoning_applied"], json!(true));
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn unknown_pipeline_is_a_validation_error() {
    let registry = registry(campus().await, FixedLlm::down());
    let response = registry.invoke("horoscope", Map::new()).await;

    assert!(!response.success);
    assert_eq!(response.pipeline, "horoscope");
    assert_eq!(response.error_kind, Some(ErrorKind::ValidationError));
    assert!(response.result.is_none());
}

#[tokio::test]
async fn conclusive_safety_verdict_skips_the_llm() {
    let llm = FixedLlm::answering(json!({"action": "allow", "confidence": 0.99}));
    let registry = registry(Arc::new(InMemoryStore::new()), llm.clone());

    let response = registry
        .invoke(
            "safety",
            input(json!({"content": "Click here to verify your account now"})),
        )
        .await;

    assert!(response.success);
    let result = response.result.unwrap();
    assert_eq!(result["recommended_action"], json!("reject"));
    assert_eq!(result["safe"], json!(false));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn hanging_llm_times_out_within_budget() {
    let registry = registry(Arc::new(InMemoryStore::new()), Arc::new(HangingLlm));
    let budget = Duration::from_millis(200);
    let grace = registry.config().cancel_grace();

    let started = tokio::time::Instant::now();
    let outcome = registry
        .run_with_budget(
            PipelineKind::Safety,
            input(json!({"content": "anyone up for coffee after class?"})),
            budget,
        )
        .await;
    let elapsed = started.elapsed();

    let response = PipelineResponse::from_outcome(PipelineKind::Safety, &outcome);
    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
    assert!(response.result.is_none());
    assert!(elapsed <= budget + grace);
    // Rule-based flags committed before the deadline survive on the outcome.
    assert!(outcome.state().contains("max_confidence"));
}

#[tokio::test]
async fn concurrent_runs_do_not_share_state() {
    let store = campus().await;
    let registry = Arc::new(registry(store, FixedLlm::down()));

    let users = ["ana", "ben", "cy", "dee"];
    let runs = users.iter().map(|user| {
        let registry = Arc::clone(&registry);
        async move {
            registry
                .invoke("matching", input(json!({"user_id": user, "tenant_id": "t1"})))
                .await
        }
    });
    let responses = futures::future::join_all(runs).await;

    for (user, response) in users.iter().zip(&responses) {
        assert!(response.success, "run for {user} failed: {:?}", response.error);
        let matches = response.result.as_ref().unwrap()["matches"].as_array().unwrap().clone();
        assert!(matches.iter().all(|m| m["id"] != json!(user)));
    }
    let ana = &responses[0].result.as_ref().unwrap()["matches"];
    assert!(ana.as_array().unwrap().iter().all(|m| m["id"] != json!("dee")));
}
