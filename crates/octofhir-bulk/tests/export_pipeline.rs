//! End-to-end export jobs over the in-memory persistence and object store.

use std::sync::Arc;

use chrono::Utc;
use octofhir_bulk::object_storage::read_object;
use octofhir_bulk::{
    BulkConfig, BulkError, InMemoryCheckpointStore, InMemoryPersistence, JobPlan, JobRunner,
    JobStatus, LayoutKind, MIB, ObjectStorage, ObjectStoreClient, PartitionPlanner,
    SessionStatus, StaticResourceTypes,
};
use serde_json::{Value, json};

// =============================================================================
// Test Infrastructure
// =============================================================================

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

    fn seed(&self, resource_type: &str, n: usize) {
        self.db
            .seed((0..n).map(|i| json!({"resourceType": resource_type, "id": format!("{i:03}")})))
            .expect("seed");
    }

    fn runner(&self, config: BulkConfig) -> JobRunner {
        JobRunner::new(
            config,
            Arc::new(self.db.clone()),
            self.storage.clone(),
            self.checkpoints.clone(),
        )
    }

    async fn read_lines(&self, bucket: &str, key: &str) -> Vec<Value> {
        let bytes = read_object(self.storage.as_ref(), bucket, key)
            .await
            .expect("read object");
        std::str::from_utf8(&bytes)
            .expect("utf-8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("ndjson line"))
            .collect()
    }
}

fn config(page_size: u32) -> BulkConfig {
    let mut config = BulkConfig::default();
    config.export.page_size = page_size;
    config
}

fn plan(types: &[&str], max_threads: usize) -> JobPlan {
    let registry = StaticResourceTypes::new(types.iter().copied());
    let requested: Vec<String> = types.iter().map(|t| t.to_string()).collect();
    PartitionPlanner::new(Arc::new(registry), max_threads)
        .plan_export(&requested)
        .expect("plan")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_export_three_types_with_empty_type() {
    let h = Harness::new();
    h.seed("TypeA", 5);
    h.seed("TypeB", 3);

    let plan = plan(&["TypeA", "TypeB", "TypeC"], 4);
    assert_eq!(plan.partitions.len(), 3);
    assert_eq!(plan.worker_threads, 3);

    let run = h.runner(config(2)).run(&plan).await.expect("run");
    assert_eq!(run.status, JobStatus::Completed);
    assert_eq!(run.summary.resource_type_summary(), "TypeA[5]:TypeB[3]:TypeC[0]");
    assert_eq!(run.summary.total_records, 8);
    assert_eq!(run.summary.counts.processed, 8);

    let key = format!("export/{}/TypeA_1.ndjson", plan.job_id);
    let lines = h.read_lines("fhir-bulk", &key).await;
    assert_eq!(lines.len(), 5);
    let ids: Vec<&str> = lines.iter().filter_map(|l| l["id"].as_str()).collect();
    assert_eq!(ids, ["000", "001", "002", "003", "004"]);

    let manifest = run.summary.manifest(Utc::now());
    let output = manifest["output"].as_array().expect("output");
    assert_eq!(output.len(), 2);
    assert_eq!(output[0]["type"], "TypeA");
    assert_eq!(output[0]["count"], 5);
    assert_eq!(output[1]["type"], "TypeB");
    assert_eq!(output[1]["url"], format!("fhir-bulk/export/{}/TypeB_1.ndjson", plan.job_id));
}

#[tokio::test]
async fn test_export_flushes_a_part_per_full_buffer() {
    let h = Harness::new();
    h.seed("TypeA", 5);

    let mut config = config(2);
    config.upload.part_size_threshold_bytes = 1;
    let plan = plan(&["TypeA"], 1);
    let run = h.runner(config).run(&plan).await.expect("run");

    assert_eq!(run.summary.resource_type_summary(), "TypeA[2,2,1]");
    let session = &run.summary.partitions[0].outputs[0];
    assert_eq!(session.status, SessionStatus::Completed);
    let numbers: Vec<u32> = session.parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, [1, 2, 3]);
    for part in &session.parts {
        let lines = h.read_lines("fhir-bulk", &part.key).await;
        assert_eq!(lines.len() as u64, part.records);
    }
}

#[tokio::test]
async fn test_export_skips_corrupt_resource() {
    let h = Harness::new();
    h.db
        .seed((0..9).map(|i| json!({"resourceType": "Patient", "id": format!("p{i}")})))
        .expect("seed");
    h.db.insert_raw("Patient", "p4-broken", "{\"resourceType\":\"Patient\",");

    let plan = plan(&["Patient"], 1);
    let run = h.runner(config(4)).run(&plan).await.expect("run");

    assert_eq!(run.status, JobStatus::Completed);
    assert_eq!(run.summary.counts.processed, 9);
    assert_eq!(run.summary.resource_type_summary(), "Patient[9]");
    let key = format!("export/{}/Patient_1.ndjson", plan.job_id);
    assert_eq!(h.read_lines("fhir-bulk", &key).await.len(), 9);
}

#[tokio::test]
async fn test_export_final_part_below_threshold_completes_shared_object() {
    let h = Harness::new();
    let filler = "x".repeat(100_000);
    h.db
        .seed((0..49).map(|i| {
            json!({"resourceType": "Patient", "id": format!("p{i:02}"), "text": {"div": filler}})
        }))
        .expect("seed");

    let mut config = config(10);
    config.export.layout = LayoutKind::SharedObject;
    config.export.object_name = Some("patients.ndjson".into());
    let plan = plan(&["Patient"], 1);
    let run = h.runner(config).run(&plan).await.expect("run");

    let session = &run.summary.partitions[0].outputs[0];
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.upload_id.is_some());
    assert_eq!(session.parts.len(), 1);
    let part = &session.parts[0];
    assert!(part.bytes < 5 * MIB as u64);
    assert!(part.bytes > 4 * MIB as u64);
    assert_eq!(part.records, 49);

    let key = format!("export/{}/patients.ndjson", plan.job_id);
    let size = h
        .storage
        .object_size("fhir-bulk", &key)
        .await
        .expect("object size");
    assert_eq!(size, part.bytes);

    let manifest = run.summary.manifest(Utc::now());
    let output = manifest["output"].as_array().expect("output");
    assert_eq!(output.len(), 1);
    assert_eq!(output[0]["count"], 49);
}

#[tokio::test]
async fn test_shared_layout_rejects_multiple_partitions() {
    let h = Harness::new();
    let mut config = config(10);
    config.export.layout = LayoutKind::SharedObject;
    config.export.object_name = Some("all.ndjson".into());

    let err = h
        .runner(config)
        .run(&plan(&["Patient", "Observation"], 2))
        .await
        .unwrap_err();
    assert!(matches!(err, BulkError::Configuration { .. }));
}

#[tokio::test]
async fn test_summary_independent_of_worker_count() {
    let h = Harness::new();
    h.seed("TypeA", 7);
    h.seed("TypeB", 2);
    h.seed("TypeC", 4);
    let types = ["TypeA", "TypeB", "TypeC"];

    let sequential = h
        .runner(config(3))
        .run(&plan(&types, 1))
        .await
        .expect("sequential run");
    let parallel = h
        .runner(config(3))
        .run(&plan(&types, 3))
        .await
        .expect("parallel run");

    assert_eq!(
        sequential.summary.resource_type_summary(),
        parallel.summary.resource_type_summary()
    );
    assert_eq!(sequential.summary.resource_type_summary(), "TypeA[7]:TypeB[2]:TypeC[4]");
    assert_eq!(sequential.summary.counts, parallel.summary.counts);
}
