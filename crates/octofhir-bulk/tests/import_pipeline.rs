//! End-to-end import jobs: NDJSON in the object store, resources into the
//! in-memory persistence, `OperationOutcome` logs back out.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use octofhir_bulk::object_storage::read_object;
use octofhir_bulk::{
    BulkConfig, BulkError, ImportInput, InMemoryCheckpointStore, InMemoryPersistence, JobPlan,
    JobRunner, JobStatus, ObjectStorage, ObjectStoreClient, PartitionPlanner, SessionStatus,
    StaticResourceTypes, parse_import_inputs,
};
use serde_json::{Value, json};

// =============================================================================
// Test Infrastructure
// =============================================================================

const BUCKET: &str = "fhir-bulk";

struct Harness {
    db: InMemoryPersistence,
    storage: Arc<ObjectStoreClient>,
    checkpoints: Arc<InMemoryCheckpointStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            db: InMemoryPersistence::new(),
            storage: Arc::new(ObjectStoreClient::in_memory()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
        }
    }

    async fn put(&self, key: &str, text: String) {
        self.storage.ensure_bucket(BUCKET).await.expect("bucket");
        self.storage
            .put_object(BUCKET, key, Bytes::from(text))
            .await
            .expect("put source");
    }

    fn runner(&self, config: BulkConfig) -> JobRunner {
        JobRunner::new(
            config,
            Arc::new(self.db.clone()),
            self.storage.clone(),
            self.checkpoints.clone(),
        )
    }

    async fn read_lines(&self, key: &str) -> Vec<Value> {
        let bytes = read_object(self.storage.as_ref(), BUCKET, key)
            .await
            .expect("read object");
        std::str::from_utf8(&bytes)
            .expect("utf-8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("ndjson line"))
            .collect()
    }
}

fn patients(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| json!({"resourceType": "Patient", "id": format!("p{i:03}")}).to_string())
        .collect()
}

fn config(batch_size: usize) -> BulkConfig {
    let mut config = BulkConfig::default();
    config.import.batch_size = batch_size;
    config.import.read_chunk_bytes = 256;
    config
}

fn plan(inputs: Vec<ImportInput>) -> JobPlan {
    PartitionPlanner::new(Arc::new(StaticResourceTypes::fhir_r4()), 4)
        .plan_import(inputs)
        .expect("plan")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_import_counts_malformed_lines() {
    let h = Harness::new();
    let mut lines = patients(100);
    lines[17] = "{\"resourceType\": \"Patient\", ".to_string();
    lines[64] = "not json at all".to_string();
    h.put("input/patients.ndjson", lines.join("\n")).await;

    let input = ImportInput::from_url("Patient", "s3://fhir-bulk/input/patients.ndjson").unwrap();
    let plan = plan(vec![input]);
    let run = h.runner(config(10)).run(&plan).await.expect("run");

    assert_eq!(run.status, JobStatus::Completed);
    let counts = run.summary.counts;
    assert_eq!(counts.processed, 100);
    assert_eq!(counts.imported, 98);
    assert_eq!(counts.parse_failures, 2);
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.skipped, 0);
    assert_eq!(h.db.count("Patient"), 98);
    assert!(h.db.get("Patient", "p017").is_none());
    assert!(h.db.get("Patient", "p099").is_some());

    let success_key = format!("import-outcomes/{}/Patient-0-success_1.ndjson", plan.job_id);
    let outcomes = h.read_lines(&success_key).await;
    assert_eq!(outcomes.len(), 98);
    assert_eq!(outcomes[0]["resourceType"], "OperationOutcome");
    assert_eq!(outcomes[0]["issue"][0]["severity"], "information");
    assert_eq!(
        outcomes[0]["issue"][0]["diagnostics"],
        "Patient/p000 imported from line 1"
    );

    let partition = &run.summary.partitions[0];
    assert_eq!(partition.errors[0].status, SessionStatus::Completed);
    assert!(partition.errors[0].parts.is_empty());

    let manifest = run.summary.manifest(Utc::now());
    let output = manifest["output"].as_array().expect("output");
    assert_eq!(output.len(), 1);
    assert_eq!(output[0]["type"], "OperationOutcome");
    assert_eq!(output[0]["count"], 98);
    assert!(manifest["error"].as_array().expect("error").is_empty());
}

#[tokio::test]
async fn test_import_records_rejected_writes() {
    let h = Harness::new();
    let mut lines = patients(10);
    lines[3] = json!({"resourceType": "Observation", "id": "o1"}).to_string();
    h.put("input/p.ndjson", lines.join("\n") + "\n").await;
    h.db.reject_id("p007");

    let input = ImportInput::from_url("Patient", "fhir-bulk/input/p.ndjson").unwrap();
    let plan = plan(vec![input]);
    let run = h.runner(config(4)).run(&plan).await.expect("run");

    let counts = run.summary.counts;
    assert_eq!(counts.processed, 10);
    assert_eq!(counts.imported, 8);
    assert_eq!(counts.skipped, 1);
    assert_eq!(counts.failed, 1);

    let failure_key = format!("import-outcomes/{}/Patient-0-failure_1.ndjson", plan.job_id);
    let failures = h.read_lines(&failure_key).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["issue"][0]["severity"], "error");
    let diagnostics = failures[0]["issue"][0]["diagnostics"].as_str().unwrap();
    assert!(diagnostics.starts_with("Line 8:"), "{diagnostics}");

    let manifest = run.summary.manifest(Utc::now());
    assert_eq!(manifest["error"].as_array().expect("error").len(), 1);
    assert_eq!(manifest["error"][0]["count"], 1);
}

#[tokio::test]
async fn test_import_parameters_with_several_sources() {
    let h = Harness::new();
    h.put("in/patients.ndjson", patients(3).join("\n")).await;
    let observations: Vec<String> = (0..4)
        .map(|i| json!({"resourceType": "Observation", "id": format!("o{i}")}).to_string())
        .collect();
    h.put("in/observations.ndjson", observations.join("\n")).await;

    let params = json!({
        "resourceType": "Parameters",
        "parameter": [
            {"name": "input", "part": [
                {"name": "type", "valueCode": "Patient"},
                {"name": "url", "valueUrl": "s3://fhir-bulk/in/patients.ndjson"}
            ]},
            {"name": "input", "part": [
                {"name": "type", "valueCode": "Observation"},
                {"name": "url", "valueUrl": "s3://fhir-bulk/in/observations.ndjson"}
            ]}
        ]
    });
    let inputs = parse_import_inputs(&params).expect("inputs");
    let plan = plan(inputs);
    assert_eq!(plan.partitions.len(), 2);

    let run = h.runner(config(2)).run(&plan).await.expect("run");
    assert_eq!(run.summary.resource_type_summary(), "Patient[3]:Observation[4]");
    assert_eq!(h.db.count("Patient"), 3);
    assert_eq!(h.db.count("Observation"), 4);
}

#[tokio::test]
async fn test_import_missing_source_fails_job() {
    let h = Harness::new();
    let input = ImportInput::from_url("Patient", "fhir-bulk/input/missing.ndjson").unwrap();
    let err = h
        .runner(config(10))
        .run(&plan(vec![input]))
        .await
        .unwrap_err();
    assert!(matches!(err, BulkError::ObjectStorage { .. }), "{err}");
}
