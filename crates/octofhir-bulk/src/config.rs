use serde::{Deserialize, Serialize};

use crate::upload::ObjectLayout;

/// One mebibyte.
pub const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BulkConfig {
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub import: ImportSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BulkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.export.page_size == 0 {
            return Err("export.page_size must be > 0".into());
        }
        if self.export.bucket.trim().is_empty() {
            return Err("export.bucket must not be empty".into());
        }
        if self.export.layout == LayoutKind::SharedObject
            && self.export.object_name.as_deref().unwrap_or("").is_empty()
        {
            return Err("export.layout=shared_object requires export.object_name".into());
        }
        if self.import.batch_size == 0 {
            return Err("import.batch_size must be > 0".into());
        }
        if self.import.read_chunk_bytes == 0 {
            return Err("import.read_chunk_bytes must be > 0".into());
        }
        if self.import.outcome_bucket.trim().is_empty() {
            return Err("import.outcome_bucket must not be empty".into());
        }
        if self.upload.part_size_threshold_bytes == 0 {
            return Err("upload.part_size_threshold_bytes must be > 0".into());
        }
        if self.workers.max_threads == 0 {
            return Err("workers.max_threads must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    /// Object layout for an export partition. `job_id` scopes the keys so
    /// concurrent jobs never collide.
    pub fn export_layout(&self, job_id: &str) -> ObjectLayout {
        match self.export.layout {
            LayoutKind::PerPart => ObjectLayout::PerPart {
                prefix: join_key(&self.export.prefix, job_id),
            },
            LayoutKind::SharedObject => ObjectLayout::SharedObject {
                key: join_key(
                    &join_key(&self.export.prefix, job_id),
                    self.export.object_name.as_deref().unwrap_or_default(),
                ),
            },
        }
    }

    /// Object layout for one of a partition's two outcome logs.
    pub fn outcome_layout(&self, job_id: &str, stem: &str) -> ObjectLayout {
        let prefix = join_key(&self.import.outcome_prefix, job_id);
        match self.import.outcome_layout {
            LayoutKind::PerPart => ObjectLayout::PerPart { prefix },
            LayoutKind::SharedObject => ObjectLayout::SharedObject {
                key: join_key(&prefix, &format!("{stem}.ndjson")),
            },
        }
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// How a partition's output is laid out in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Every flushed chunk becomes its own object.
    #[default]
    PerPart,
    /// One object assembled from multipart parts.
    SharedObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_export_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub layout: LayoutKind,
    /// Target object name, used by the shared-object layout only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
}

fn default_page_size() -> u32 {
    1000
}
fn default_bucket() -> String {
    "fhir-bulk".to_string()
}
fn default_export_prefix() -> String {
    "export".to_string()
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            bucket: default_bucket(),
            prefix: default_export_prefix(),
            layout: LayoutKind::default(),
            object_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Lines per persistence transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Initial size of a range read against the NDJSON source.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_bucket")]
    pub outcome_bucket: String,
    #[serde(default = "default_outcome_prefix")]
    pub outcome_prefix: String,
    #[serde(default)]
    pub outcome_layout: LayoutKind,
}

fn default_batch_size() -> usize {
    1000
}
fn default_read_chunk_bytes() -> usize {
    MIB
}
fn default_outcome_prefix() -> String {
    "import-outcomes".to_string()
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            read_chunk_bytes: default_read_chunk_bytes(),
            outcome_bucket: default_bucket(),
            outcome_prefix: default_outcome_prefix(),
            outcome_layout: LayoutKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Minimum part size accepted by the object store for non-final parts.
    #[serde(default = "default_part_size_threshold")]
    pub part_size_threshold_bytes: usize,
}

fn default_part_size_threshold() -> usize {
    5 * MIB
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            part_size_threshold_bytes: default_part_size_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
}

fn default_max_threads() -> usize {
    4
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::BulkConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<BulkConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("octofhir-bulk.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., OCTOFHIR_BULK__EXPORT__PAGE_SIZE=500
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_BULK")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: BulkConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
