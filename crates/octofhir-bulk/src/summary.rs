//! Job-level aggregation of partition terminal states.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::checkpoint::{CheckpointSnapshot, Counts, Timings, UploadSessionState};
use crate::error::BulkResult;

/// Terminal snapshot of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedPartition {
    pub index: usize,
    pub snapshot: CheckpointSnapshot,
}

/// Gathers terminal partition states from concurrent workers.
///
/// Appends and re-publishes the whole list inside one critical section.
/// Readers get an immutable published list and never hold the lock.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    published: Mutex<Arc<Vec<CollectedPartition>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&self, index: usize, snapshot: CheckpointSnapshot) {
        let mut published = self.published.lock();
        let mut next = Vec::with_capacity(published.len() + 1);
        next.extend(published.iter().cloned());
        next.push(CollectedPartition { index, snapshot });
        *published = Arc::new(next);
    }

    /// Current published list.
    pub fn collected(&self) -> Arc<Vec<CollectedPartition>> {
        self.published.lock().clone()
    }
}

/// Terminal figures of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub index: usize,
    pub partition: String,
    pub resource_type_summary: String,
    pub counts: Counts,
    pub timings: Timings,
    /// Export upload session, or the success outcome log on import.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<UploadSessionState>,
    /// Failure outcome log on import.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<UploadSessionState>,
}

/// Aggregate over every collected partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub partitions: Vec<PartitionSummary>,
    pub counts: Counts,
    pub timings: Timings,
    /// Job wall-clock time, summed across restarts.
    pub elapsed_ms: u64,
    pub total_records: u64,
    /// Records per second, with elapsed time floored at one second.
    pub throughput: f64,
}

impl JobSummary {
    /// Per-type summary strings of all partitions, in partition order.
    pub fn resource_type_summary(&self) -> String {
        self.partitions
            .iter()
            .map(|p| p.resource_type_summary.as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Bulk Data status manifest listing the objects written by the job.
    ///
    /// Import partitions list their outcome logs: successes under `output`,
    /// failures under `error`.
    pub fn manifest(&self, transaction_time: DateTime<Utc>) -> Value {
        let mut output = Vec::new();
        let mut error = Vec::new();
        for partition in &self.partitions {
            let is_import = !partition.errors.is_empty();
            let output_type = is_import.then_some(OUTCOME_TYPE);
            for session in &partition.outputs {
                output.extend(manifest_entries(session, output_type));
            }
            for session in &partition.errors {
                error.extend(manifest_entries(session, Some(OUTCOME_TYPE)));
            }
        }
        json!({
            "transactionTime": transaction_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            "requiresAccessToken": false,
            "output": output,
            "error": error,
        })
    }
}

const OUTCOME_TYPE: &str = "OperationOutcome";

/// One entry per object. `fixed_type` overrides the part stem as type.
fn manifest_entries(session: &UploadSessionState, fixed_type: Option<&str>) -> Vec<Value> {
    let entry = |stem: &str, key: &str, count: u64| {
        json!({
            "type": fixed_type.unwrap_or(stem),
            "url": format!("{}/{}", session.bucket, key),
            "count": count,
        })
    };
    if session.layout.is_shared() {
        session
            .parts
            .first()
            .map(|first| entry(&first.stem, &first.key, session.records_uploaded()))
            .into_iter()
            .collect()
    } else {
        session
            .parts
            .iter()
            .map(|part| entry(&part.stem, &part.key, part.records))
            .collect()
    }
}

/// Folds collected partitions into a [`JobSummary`].
pub struct MetricsAnalyzer;

impl MetricsAnalyzer {
    /// Independent of collection order: partitions are ordered by index and
    /// every figure is a sum.
    pub fn aggregate(
        job_id: &str,
        collected: &[CollectedPartition],
        elapsed: Duration,
    ) -> BulkResult<JobSummary> {
        let mut ordered: Vec<&CollectedPartition> = collected.iter().collect();
        ordered.sort_by_key(|c| c.index);

        let mut counts = Counts::default();
        let mut timings = Timings::default();
        let mut partitions = Vec::with_capacity(ordered.len());
        for collected in ordered {
            let state = collected.snapshot.state()?;
            counts.merge(&state.counts);
            timings.merge(&state.timings);

            let (outputs, errors) = match (state.upload_session, state.import_outcomes) {
                (Some(session), _) => (vec![session], Vec::new()),
                (None, Some(outcomes)) => (vec![outcomes.success], vec![outcomes.failure]),
                (None, None) => (Vec::new(), Vec::new()),
            };
            partitions.push(PartitionSummary {
                index: collected.index,
                partition: state.partition,
                resource_type_summary: state.resource_type_summary.to_string(),
                counts: state.counts,
                timings: state.timings,
                outputs,
                errors,
            });
        }

        let total_records = counts.processed;
        let seconds = elapsed.as_secs_f64().max(1.0);
        Ok(JobSummary {
            job_id: job_id.to_string(),
            partitions,
            counts,
            timings,
            elapsed_ms: elapsed.as_millis() as u64,
            total_records,
            throughput: total_records as f64 / seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointState, CompletedPart, SessionStatus};
    use crate::upload::ObjectLayout;

    fn terminal(index: usize, resource_type: &str, parts: &[u64]) -> CollectedPartition {
        let mut state = CheckpointState::new(format!("job-{index}"), 1);
        state.exhausted = true;
        state.counts.processed = parts.iter().sum();
        state.timings.read_ms = 10;
        state.resource_type_summary.begin_type(resource_type);
        let mut session = UploadSessionState::new(
            "bulk",
            ObjectLayout::PerPart {
                prefix: "export/job".into(),
            },
        );
        for (n, records) in parts.iter().enumerate() {
            state.resource_type_summary.record_part(*records);
            session.parts.push(CompletedPart {
                part_number: n as u32 + 1,
                tag: format!("t{n}"),
                key: format!("export/job/{resource_type}_{}.ndjson", n + 1),
                stem: resource_type.to_string(),
                records: *records,
                bytes: 100,
            });
        }
        session.status = SessionStatus::Completed;
        state.upload_session = Some(session);
        CollectedPartition {
            index,
            snapshot: state.snapshot().unwrap(),
        }
    }

    #[test]
    fn test_aggregate_concatenates_in_partition_order() {
        let collected = vec![
            terminal(2, "TypeC", &[]),
            terminal(0, "TypeA", &[5]),
            terminal(1, "TypeB", &[3]),
        ];
        let summary =
            MetricsAnalyzer::aggregate("job", &collected, Duration::from_secs(4)).unwrap();
        assert_eq!(summary.resource_type_summary(), "TypeA[5]:TypeB[3]:TypeC[0]");
        assert_eq!(summary.total_records, 8);
        assert_eq!(summary.timings.read_ms, 30);
        assert!((summary.throughput - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let a = terminal(0, "Patient", &[1000, 250]);
        let b = terminal(1, "Observation", &[7]);
        let c = terminal(2, "Condition", &[3, 3]);
        let elapsed = Duration::from_millis(1500);

        let forward =
            MetricsAnalyzer::aggregate("job", &[a.clone(), b.clone(), c.clone()], elapsed).unwrap();
        let backward = MetricsAnalyzer::aggregate("job", &[c, b, a], elapsed).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_throughput_floor() {
        let collected = vec![terminal(0, "Patient", &[50])];
        let summary =
            MetricsAnalyzer::aggregate("job", &collected, Duration::from_millis(20)).unwrap();
        assert!((summary.throughput - 50.0).abs() < f64::EPSILON);
        assert_eq!(summary.elapsed_ms, 20);

        let empty = MetricsAnalyzer::aggregate("job", &[], Duration::ZERO).unwrap();
        assert_eq!(empty.throughput, 0.0);
    }

    #[test]
    fn test_collector_republishes() {
        let collector = MetricsCollector::new();
        let before = collector.collected();
        collector.collect(0, terminal(0, "Patient", &[1]).snapshot);
        collector.collect(1, terminal(1, "Observation", &[1]).snapshot);
        assert!(before.is_empty());
        assert_eq!(collector.collected().len(), 2);
    }

    #[test]
    fn test_manifest() {
        let summary = MetricsAnalyzer::aggregate(
            "job",
            &[terminal(0, "Patient", &[2, 1])],
            Duration::from_secs(1),
        )
        .unwrap();
        let time = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let manifest = summary.manifest(time);
        assert_eq!(manifest["transactionTime"], "2024-01-02T03:04:05.000Z");
        let output = manifest["output"].as_array().unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output[0]["type"], "Patient");
        assert_eq!(output[0]["url"], "bulk/export/job/Patient_1.ndjson");
        assert_eq!(output[1]["count"], 1);
        assert!(manifest["error"].as_array().unwrap().is_empty());
    }
}
