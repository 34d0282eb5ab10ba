use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Spool record from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Spool {
    pub id: String,
    pub tag_id: Option<String>,
    pub material: String,
    pub subtype: Option<String>,
    pub color_name: Option<String>,
    pub rgba: Option<String>,
    pub brand: Option<String>,
    pub label_weight: Option<i32>,
    pub core_weight: Option<i32>,
    pub weight_current: Option<i32>,
    /// Slicer preset / filament id used as tray_info_idx fallback
    pub slicer_filament: Option<String>,
    pub nozzle_temp_min: Option<i32>,
    pub nozzle_temp_max: Option<i32>,
    pub note: Option<String>,
    pub tag_type: Option<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// Create/update spool request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolInput {
    pub tag_id: Option<String>,
    pub material: String,
    pub subtype: Option<String>,
    pub color_name: Option<String>,
    pub rgba: Option<String>,
    pub brand: Option<String>,
    pub label_weight: Option<i32>,
    pub core_weight: Option<i32>,
    pub weight_current: Option<i32>,
    pub slicer_filament: Option<String>,
    pub nozzle_temp_min: Option<i32>,
    pub nozzle_temp_max: Option<i32>,
    pub note: Option<String>,
    pub tag_type: Option<String>,
}

/// Printer record from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Printer {
    pub serial: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub ip_address: Option<String>,
    pub access_code: Option<String>,
    pub last_seen: Option<i64>,
    pub auto_connect: Option<bool>,
    pub dual_nozzle: Option<bool>,
    pub nozzle_diameter: Option<String>,
}

/// K-Profile record from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KProfileRow {
    pub id: i64,
    pub spool_id: Option<String>,
    pub printer_serial: Option<String>,
    pub extruder: Option<i32>,
    pub nozzle_diameter: Option<String>,
    pub filament_id: Option<String>,
    pub k_value: Option<String>,
    pub name: Option<String>,
    pub cali_idx: Option<i32>,
    pub setting_id: Option<String>,
    pub created_at: Option<i64>,
}

/// Pending slot assignment awaiting printer readiness
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StagedAssignment {
    pub printer_serial: String,
    pub ams_id: i64,
    pub tray_id: i64,
    pub spool_id: String,
    pub created_ts: i64,
    pub ttl_ms: i64,
}

impl StagedAssignment {
    pub fn expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.created_ts + self.ttl_ms
    }
}
