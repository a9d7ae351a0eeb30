//! Run context, naming contracts and the stage model for the GIAS ingest pipeline.

use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gias-core";

/// Minimum number of tab-separated fields a geo dump row needs to be kept.
pub const MIN_GEO_FIELDS: usize = 5;

pub const REGIONS_HEADER: [&str; 5] = ["ogc_fid", "eer13cd", "eer13cdo", "eer13nm", "wkb_geometry"];

pub const DISTRICTS_HEADER: [&str; 7] = [
    "ogc_fid",
    "id",
    "lad13cd",
    "lad13cdo",
    "lad13nm",
    "lad13nmw",
    "wkb_geometry",
];

pub const SCHOOLS_RAW: &str = "schools_raw";
pub const EMAIL_ADDRESSES_RAW: &str = "email_addresses_raw";
pub const DEPRIVATION_PUPIL_PREMIUM_RAW: &str = "deprivation_pupil_premium_raw";
pub const ELECTORAL_REGIONS_RAW: &str = "electoral_regions_raw";
pub const LOCAL_AUTHORITY_DISTRICTS_RAW: &str = "local_authority_districts_raw";

/// Every transient table a run may create.
pub const STAGING_TABLES: [&str; 5] = [
    SCHOOLS_RAW,
    EMAIL_ADDRESSES_RAW,
    DEPRIVATION_PUPIL_PREMIUM_RAW,
    ELECTORAL_REGIONS_RAW,
    LOCAL_AUTHORITY_DISTRICTS_RAW,
];

/// Authoritative tables, in drop order.
pub const PRODUCTION_TABLES: [&str; 5] = [
    "schools",
    "deprivation_pupil_premium",
    "local_authorities",
    "regions",
    "trusts",
];

/// Tab-delimited geographic exports reshaped into CSV before staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoDump {
    ElectoralRegions,
    LocalAuthorityDistricts,
}

impl GeoDump {
    pub const ALL: [GeoDump; 2] = [GeoDump::ElectoralRegions, GeoDump::LocalAuthorityDistricts];

    /// Fixed header written ahead of the reshaped rows; never inferred from the dump.
    pub fn header(self) -> &'static [&'static str] {
        match self {
            GeoDump::ElectoralRegions => &REGIONS_HEADER,
            GeoDump::LocalAuthorityDistricts => &DISTRICTS_HEADER,
        }
    }

    pub fn staging_table(self) -> &'static str {
        match self {
            GeoDump::ElectoralRegions => ELECTORAL_REGIONS_RAW,
            GeoDump::LocalAuthorityDistricts => LOCAL_AUTHORITY_DISTRICTS_RAW,
        }
    }

    fn csv_name(self) -> &'static str {
        match self {
            GeoDump::ElectoralRegions => "regions.csv",
            GeoDump::LocalAuthorityDistricts => "districts.csv",
        }
    }
}

impl fmt::Display for GeoDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoDump::ElectoralRegions => f.write_str("electoral_regions"),
            GeoDump::LocalAuthorityDistricts => f.write_str("local_authority_districts"),
        }
    }
}

/// Local files shipped alongside the service rather than fetched per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceInputs {
    pub regions_dump: PathBuf,
    pub districts_dump: PathBuf,
    pub email_addresses: PathBuf,
    pub pupil_premium: PathBuf,
}

impl ReferenceInputs {
    pub fn dump_path(&self, dump: GeoDump) -> &PathBuf {
        match dump {
            GeoDump::ElectoralRegions => &self.regions_dump,
            GeoDump::LocalAuthorityDistricts => &self.districts_dump,
        }
    }
}

/// Everything a run needs to know about itself, computed once and passed to every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub namespace: String,
    pub source_base_url: String,
    pub source_basename: String,
    pub reference: ReferenceInputs,
}

impl RunContext {
    pub fn new(
        date: NaiveDate,
        namespace: impl Into<String>,
        source_base_url: impl Into<String>,
        source_basename: impl Into<String>,
        reference: ReferenceInputs,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            date,
            namespace: namespace.into(),
            source_base_url: source_base_url.into(),
            source_basename: source_basename.into(),
            reference,
        }
    }

    pub fn date_stamp(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }

    pub fn source_file_name(&self) -> String {
        format!("{}{}.csv", self.source_basename, self.date_stamp())
    }

    pub fn source_url(&self) -> String {
        format!(
            "{}/{}",
            self.source_base_url.trim_end_matches('/'),
            self.source_file_name()
        )
    }

    /// Blob key of the re-encoded export.
    pub fn normalized_key(&self) -> String {
        format!(
            "{}/{}{}-fixed.csv",
            self.namespace,
            self.source_basename,
            self.date_stamp()
        )
    }

    pub fn reshaped_key(&self, dump: GeoDump) -> String {
        format!("{}/{}", self.namespace, dump.csv_name())
    }

    pub fn report_key(&self) -> String {
        format!(
            "{}/reports/{}-{}.json",
            self.namespace,
            self.date_stamp(),
            self.run_id
        )
    }
}

/// Linear run state machine. `Failed` is carried by the error type, not by a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Fetching,
    Normalizing,
    StagingCreated,
    StagingLoaded,
    ProductionCreated,
    ProductionPopulated,
    StagingDropped,
    RelationshipsExtracted,
    ViewsCreated,
    ViewsRefreshed,
    Done,
}

impl PipelineStage {
    pub fn next(self) -> Option<PipelineStage> {
        use PipelineStage::*;
        Some(match self {
            Idle => Fetching,
            Fetching => Normalizing,
            Normalizing => StagingCreated,
            StagingCreated => StagingLoaded,
            StagingLoaded => ProductionCreated,
            ProductionCreated => ProductionPopulated,
            ProductionPopulated => StagingDropped,
            StagingDropped => RelationshipsExtracted,
            RelationshipsExtracted => ViewsCreated,
            ViewsCreated => ViewsRefreshed,
            ViewsRefreshed => Done,
            Done => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        use PipelineStage::*;
        match self {
            Idle => "idle",
            Fetching => "fetching",
            Normalizing => "normalizing",
            StagingCreated => "staging_created",
            StagingLoaded => "staging_loaded",
            ProductionCreated => "production_created",
            ProductionPopulated => "production_populated",
            StagingDropped => "staging_dropped",
            RelationshipsExtracted => "relationships_extracted",
            ViewsCreated => "views_created",
            ViewsRefreshed => "views_refreshed",
            Done => "done",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of one permissive (all-text) staging table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingTableDef {
    pub name: String,
    pub columns: Vec<String>,
}

impl StagingTableDef {
    pub fn new<S: AsRef<str>>(name: impl Into<String>, columns: &[S]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
        }
    }

    pub fn for_geo_dump(dump: GeoDump) -> Self {
        Self::new(dump.staging_table(), dump.header())
    }
}

/// One row of the derived trusts table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Trust {
    pub code: i32,
    pub name: String,
}
