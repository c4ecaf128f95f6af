//! Job planning: validates the requested scope and splits it into
//! partitions.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BulkError, BulkResult};
use crate::telemetry::Direction;

/// Vocabulary of resource types the persistence layer knows.
pub trait ResourceTypeRegistry: Send + Sync {
    fn is_known(&self, resource_type: &str) -> bool;
}

/// Resource types of FHIR R4.
const FHIR_R4_RESOURCE_TYPES: &[&str] = &[
    "Account", "ActivityDefinition", "AdverseEvent", "AllergyIntolerance", "Appointment",
    "AppointmentResponse", "AuditEvent", "Basic", "Binary", "BiologicallyDerivedProduct",
    "BodyStructure", "Bundle", "CapabilityStatement", "CarePlan", "CareTeam", "CatalogEntry",
    "ChargeItem", "ChargeItemDefinition", "Claim", "ClaimResponse", "ClinicalImpression",
    "CodeSystem", "Communication", "CommunicationRequest", "CompartmentDefinition",
    "Composition", "ConceptMap", "Condition", "Consent", "Contract", "Coverage",
    "CoverageEligibilityRequest", "CoverageEligibilityResponse", "DetectedIssue", "Device",
    "DeviceDefinition", "DeviceMetric", "DeviceRequest", "DeviceUseStatement",
    "DiagnosticReport", "DocumentManifest", "DocumentReference", "EffectEvidenceSynthesis",
    "Encounter", "Endpoint", "EnrollmentRequest", "EnrollmentResponse", "EpisodeOfCare",
    "EventDefinition", "Evidence", "EvidenceVariable", "ExampleScenario",
    "ExplanationOfBenefit", "FamilyMemberHistory", "Flag", "Goal", "GraphDefinition", "Group",
    "GuidanceResponse", "HealthcareService", "ImagingStudy", "Immunization",
    "ImmunizationEvaluation", "ImmunizationRecommendation", "ImplementationGuide",
    "InsurancePlan", "Invoice", "Library", "Linkage", "List", "Location", "Measure",
    "MeasureReport", "Media", "Medication", "MedicationAdministration", "MedicationDispense",
    "MedicationKnowledge", "MedicationRequest", "MedicationStatement", "MedicinalProduct",
    "MedicinalProductAuthorization", "MedicinalProductContraindication",
    "MedicinalProductIndication", "MedicinalProductIngredient", "MedicinalProductInteraction",
    "MedicinalProductManufactured", "MedicinalProductPackaged",
    "MedicinalProductPharmaceutical", "MedicinalProductUndesirableEffect", "MessageDefinition",
    "MessageHeader", "MolecularSequence", "NamingSystem", "NutritionOrder", "Observation",
    "ObservationDefinition", "OperationDefinition", "OperationOutcome", "Organization",
    "OrganizationAffiliation", "Parameters", "Patient", "PaymentNotice",
    "PaymentReconciliation", "Person", "PlanDefinition", "Practitioner", "PractitionerRole",
    "Procedure", "Provenance", "Questionnaire", "QuestionnaireResponse", "RelatedPerson",
    "RequestGroup", "ResearchDefinition", "ResearchElementDefinition", "ResearchStudy",
    "ResearchSubject", "RiskAssessment", "RiskEvidenceSynthesis", "Schedule",
    "SearchParameter", "ServiceRequest", "Slot", "Specimen", "SpecimenDefinition",
    "StructureDefinition", "StructureMap", "Subscription", "Substance",
    "SubstanceNucleicAcid", "SubstancePolymer", "SubstanceProtein",
    "SubstanceReferenceInformation", "SubstanceSourceMaterial", "SubstanceSpecification",
    "SupplyDelivery", "SupplyRequest", "Task", "TerminologyCapabilities", "TestReport",
    "TestScript", "ValueSet", "VerificationResult", "VisionPrescription",
];

/// Fixed resource-type vocabulary.
#[derive(Debug, Clone)]
pub struct StaticResourceTypes {
    types: HashSet<String>,
}

impl StaticResourceTypes {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fhir_r4() -> Self {
        Self::new(FHIR_R4_RESOURCE_TYPES.iter().copied())
    }
}

impl Default for StaticResourceTypes {
    fn default() -> Self {
        Self::fhir_r4()
    }
}

impl ResourceTypeRegistry for StaticResourceTypes {
    fn is_known(&self, resource_type: &str) -> bool {
        self.types.contains(resource_type)
    }
}

/// One declared import source: an NDJSON object holding one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportInput {
    pub resource_type: String,
    pub bucket: String,
    pub key: String,
}

impl ImportInput {
    /// Build from an object location `bucket/key`, optionally prefixed with
    /// `s3://`.
    pub fn from_url(resource_type: impl Into<String>, url: &str) -> BulkResult<Self> {
        let location = url.strip_prefix("s3://").unwrap_or(url);
        match location.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self {
                resource_type: resource_type.into(),
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            _ => Err(BulkError::invalid_request(format!(
                "input url '{url}' is not a bucket/key object location"
            ))),
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

/// Extract import inputs from a request body.
///
/// Accepts a FHIR `Parameters` resource (`parameter[name=input].part` with
/// `type` and `url` parts) or the simplified
/// `{"input": [{"type": ..., "url": ...}]}` shape.
pub fn parse_import_inputs(params: &Value) -> BulkResult<Vec<ImportInput>> {
    // Bodies wrapped as {"parameter": [{"name": "resource", "resource": {...}}]}
    let params = match params.get("parameter").and_then(Value::as_array) {
        Some(parameter)
            if parameter.len() == 1
                && parameter[0].get("name").and_then(Value::as_str) == Some("resource") =>
        {
            parameter[0].get("resource").unwrap_or(params)
        }
        _ => params,
    };

    let mut inputs = Vec::new();
    if let Some(parameter) = params.get("parameter").and_then(Value::as_array) {
        for param in parameter {
            if param.get("name").and_then(Value::as_str) != Some("input") {
                continue;
            }
            let Some(parts) = param.get("part").and_then(Value::as_array) else {
                continue;
            };
            let mut resource_type = None;
            let mut url = None;
            for part in parts {
                match part.get("name").and_then(Value::as_str) {
                    Some("type") => {
                        resource_type = part
                            .get("valueString")
                            .or_else(|| part.get("valueCode"))
                            .and_then(Value::as_str);
                    }
                    Some("url") => {
                        url = part
                            .get("valueUrl")
                            .or_else(|| part.get("valueString"))
                            .or_else(|| part.get("valueUri"))
                            .and_then(Value::as_str);
                    }
                    _ => {}
                }
            }
            match (resource_type, url) {
                (Some(rt), Some(url)) => inputs.push(ImportInput::from_url(rt, url)?),
                _ => {
                    return Err(BulkError::invalid_request(
                        "each input must have 'type' and 'url' parts",
                    ));
                }
            }
        }
    } else if let Some(input) = params.get("input").and_then(Value::as_array) {
        for item in input {
            let resource_type = item
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| BulkError::invalid_request("each input must have a 'type' field"))?;
            let url = item
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| BulkError::invalid_request("each input must have a 'url' field"))?;
            inputs.push(ImportInput::from_url(resource_type, url)?);
        }
    } else {
        return Err(BulkError::invalid_request(
            "request must contain 'parameter' (FHIR Parameters) or 'input' array",
        ));
    }

    if inputs.is_empty() {
        return Err(BulkError::invalid_request(
            "at least one input source is required",
        ));
    }
    Ok(inputs)
}

/// What one partition covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionScope {
    /// Resource types exported sequentially.
    Export { resource_types: Vec<String> },
    /// One input source.
    Import { input: ImportInput },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub index: usize,
    /// `{job_id}-{index}`; also the checkpoint name.
    pub name: String,
    pub scope: PartitionScope,
}

impl PartitionSpec {
    pub fn resource_types(&self) -> Vec<&str> {
        match &self.scope {
            PartitionScope::Export { resource_types } => {
                resource_types.iter().map(String::as_str).collect()
            }
            PartitionScope::Import { input } => vec![input.resource_type.as_str()],
        }
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.resource_types().join(","))
    }
}

/// Partitions of one job plus the worker bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPlan {
    pub job_id: String,
    pub direction: Direction,
    pub partitions: Vec<PartitionSpec>,
    /// `min(max_threads, partitions.len())`.
    pub worker_threads: usize,
}

impl JobPlan {
    /// Re-key the plan under an existing job id, e.g. to resume a job.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        for partition in &mut self.partitions {
            partition.name = partition_name(&self.job_id, partition.index);
        }
        self
    }
}

fn partition_name(job_id: &str, index: usize) -> String {
    format!("{job_id}-{index}")
}

/// Splits a job's scope into partitions.
#[derive(Clone)]
pub struct PartitionPlanner {
    registry: Arc<dyn ResourceTypeRegistry>,
    max_threads: usize,
}

impl PartitionPlanner {
    pub fn new(registry: Arc<dyn ResourceTypeRegistry>, max_threads: usize) -> Self {
        Self {
            registry,
            max_threads,
        }
    }

    /// One partition per valid requested type.
    pub fn plan_export(&self, requested: &[String]) -> BulkResult<JobPlan> {
        self.plan_export_groups(requested.iter().map(|rt| vec![rt.clone()]).collect())
    }

    /// One partition per group of types; a group's types are exported
    /// sequentially by the same worker.
    pub fn plan_export_groups(&self, groups: Vec<Vec<String>>) -> BulkResult<JobPlan> {
        let mut seen = HashSet::new();
        let mut scopes = Vec::new();
        for group in groups {
            let mut valid = Vec::new();
            for resource_type in group {
                if !self.registry.is_known(&resource_type) {
                    tracing::warn!(resource_type = %resource_type, "Unknown resource type, discarding");
                    continue;
                }
                if !seen.insert(resource_type.clone()) {
                    tracing::warn!(resource_type = %resource_type, "Duplicate resource type, discarding");
                    continue;
                }
                valid.push(resource_type);
            }
            if !valid.is_empty() {
                scopes.push(PartitionScope::Export {
                    resource_types: valid,
                });
            }
        }
        if scopes.is_empty() {
            return Err(BulkError::no_valid_partitions(
                "none of the requested resource types is known",
            ));
        }
        Ok(self.build(Direction::Export, scopes))
    }

    /// One partition per input whose type is known.
    pub fn plan_import(&self, inputs: Vec<ImportInput>) -> BulkResult<JobPlan> {
        let scopes: Vec<_> = inputs
            .into_iter()
            .filter(|input| {
                let known = self.registry.is_known(&input.resource_type);
                if !known {
                    tracing::warn!(
                        resource_type = %input.resource_type,
                        url = %input.url(),
                        "Unknown resource type, discarding input"
                    );
                }
                known
            })
            .map(|input| PartitionScope::Import { input })
            .collect();
        if scopes.is_empty() {
            return Err(BulkError::no_valid_partitions(
                "no import input has a known resource type",
            ));
        }
        Ok(self.build(Direction::Import, scopes))
    }

    fn build(&self, direction: Direction, scopes: Vec<PartitionScope>) -> JobPlan {
        let job_id = uuid::Uuid::new_v4().to_string();
        let partitions: Vec<_> = scopes
            .into_iter()
            .enumerate()
            .map(|(index, scope)| PartitionSpec {
                index,
                name: partition_name(&job_id, index),
                scope,
            })
            .collect();
        let worker_threads = self.max_threads.min(partitions.len()).max(1);
        tracing::info!(
            job_id = %job_id,
            direction = direction.as_str(),
            partitions = partitions.len(),
            worker_threads,
            "Job planned"
        );
        JobPlan {
            job_id,
            direction,
            partitions,
            worker_threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn planner(types: &[&str], max_threads: usize) -> PartitionPlanner {
        PartitionPlanner::new(
            Arc::new(StaticResourceTypes::new(types.iter().copied())),
            max_threads,
        )
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_export_one_partition_per_type() {
        let plan = planner(&["TypeA", "TypeB", "TypeC"], 8)
            .plan_export(&strings(&["TypeA", "TypeB", "TypeC"]))
            .unwrap();
        assert_eq!(plan.partitions.len(), 3);
        assert_eq!(plan.worker_threads, 3);
        assert_eq!(plan.direction, Direction::Export);
        assert_eq!(plan.partitions[1].name, format!("{}-1", plan.job_id));
        assert_eq!(plan.partitions[2].resource_types(), vec!["TypeC"]);
    }

    #[test]
    fn test_unknown_types_are_discarded() {
        let plan = planner(&["Patient"], 2)
            .plan_export(&strings(&["Patient", "Bogus", "Patient"]))
            .unwrap();
        assert_eq!(plan.partitions.len(), 1);
        assert_eq!(plan.worker_threads, 1);

        let err = planner(&["Patient"], 2)
            .plan_export(&strings(&["Bogus"]))
            .unwrap_err();
        assert!(matches!(err, BulkError::NoValidPartitions { .. }));
    }

    #[test]
    fn test_thread_bound() {
        let types: Vec<String> = (0..10).map(|i| format!("T{i}")).collect();
        let names: Vec<&str> = types.iter().map(String::as_str).collect();
        let plan = planner(&names, 4).plan_export(&types).unwrap();
        assert_eq!(plan.partitions.len(), 10);
        assert_eq!(plan.worker_threads, 4);
    }

    #[test]
    fn test_grouped_export() {
        let plan = planner(&["Patient", "Observation", "Condition"], 4)
            .plan_export_groups(vec![
                strings(&["Patient", "Observation"]),
                strings(&["Condition"]),
            ])
            .unwrap();
        assert_eq!(plan.partitions.len(), 2);
        assert_eq!(
            plan.partitions[0].resource_types(),
            vec!["Patient", "Observation"]
        );
    }

    #[test]
    fn test_plan_ids_are_per_job() {
        let planner = planner(&["Patient"], 1);
        let a = planner.plan_export(&strings(&["Patient"])).unwrap();
        let b = planner.plan_export(&strings(&["Patient"])).unwrap();
        assert_ne!(a.job_id, b.job_id);

        let resumed = b.with_job_id(a.job_id.clone());
        assert_eq!(resumed.partitions[0].name, a.partitions[0].name);
    }

    #[test]
    fn test_plan_import() {
        let inputs = vec![
            ImportInput::from_url("Patient", "s3://bulk/in/patients.ndjson").unwrap(),
            ImportInput::from_url("Bogus", "bulk/in/bogus.ndjson").unwrap(),
        ];
        let plan = planner(&["Patient"], 4).plan_import(inputs).unwrap();
        assert_eq!(plan.partitions.len(), 1);
        assert_eq!(plan.direction, Direction::Import);
        let PartitionScope::Import { input } = &plan.partitions[0].scope else {
            panic!("expected an import scope");
        };
        assert_eq!(input.bucket, "bulk");
        assert_eq!(input.key, "in/patients.ndjson");
    }

    #[test]
    fn test_parse_parameters_shape() {
        let body = json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "inputFormat", "valueString": "application/fhir+ndjson"},
                {"name": "input", "part": [
                    {"name": "type", "valueString": "Patient"},
                    {"name": "url", "valueUrl": "s3://bulk/patients.ndjson"}
                ]}
            ]
        });
        let inputs = parse_import_inputs(&body).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].url(), "bulk/patients.ndjson");
    }

    #[test]
    fn test_parse_simplified_and_wrapped_shapes() {
        let simplified = json!({"input": [{"type": "Observation", "url": "bulk/obs.ndjson"}]});
        assert_eq!(parse_import_inputs(&simplified).unwrap()[0].resource_type, "Observation");

        let wrapped = json!({"parameter": [{"name": "resource", "resource": simplified}]});
        assert_eq!(parse_import_inputs(&wrapped).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        assert!(parse_import_inputs(&json!({})).is_err());
        assert!(parse_import_inputs(&json!({"input": []})).is_err());
        assert!(parse_import_inputs(&json!({"input": [{"type": "Patient"}]})).is_err());
        assert!(parse_import_inputs(&json!({"input": [{"type": "Patient", "url": "nokey"}]})).is_err());
        let missing_url = json!({"parameter": [{"name": "input", "part": [{"name": "type", "valueString": "Patient"}]}]});
        assert!(matches!(
            parse_import_inputs(&missing_url),
            Err(BulkError::InvalidRequest { .. })
        ));
    }
}
