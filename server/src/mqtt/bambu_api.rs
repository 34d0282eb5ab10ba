//! Bambu Lab MQTT API message structures
//!
//! Report frames arrive on `device/{serial}/report` as JSON objects with one
//! top-level section (`print`, `info`, `cover`). Commands are published on
//! `device/{serial}/request` wrapped in their group key. Numbers frequently
//! travel as strings on this wire; the serde helpers at the bottom cover the
//! encodings observed across firmwares.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ==========================================================================
// Main Message Types
// ==========================================================================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    Print(Print),
    Info(Info),
    Cover(Cover),
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Print {
    pub print: PrintData,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintData {
    // Print state
    pub gcode_state: Option<GcodeState>,
    pub mc_percent: Option<i64>,
    pub mc_remaining_time: Option<i64>,
    pub layer_num: Option<i64>,
    pub total_layer_num: Option<i64>,
    /// Absent = retain, explicit null = clear, string = assign
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub subtask_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub gcode_file: Option<Option<String>>,
    /// Current stage code, decoded by the reducer into a display name
    pub stg_cur: Option<i32>,

    // AMS data
    pub ams: Option<PrintAms>,
    pub vt_tray: Option<PrintTray>,
    pub vir_slot: Option<Vec<PrintTray>>,

    // Extruder / nozzle info (dual-nozzle printers)
    pub device: Option<PrintDevice>,
    pub nozzle_diameter: Option<String>,

    // Command/response fields: the printer echoes the command name,
    // sequence id and a result inside the same section
    pub command: Option<String>,
    pub sequence_id: Option<String>,
    pub result: Option<String>,
    pub reason: Option<String>,

    // Echo fields on filament-setting responses
    pub ams_id: Option<i32>,
    pub tray_id: Option<i32>,
    pub slot_id: Option<i32>,
    pub tray_info_idx: Option<String>,
    pub tray_type: Option<String>,
    pub tray_color: Option<String>,
    pub nozzle_temp_min: Option<u32>,
    pub nozzle_temp_max: Option<u32>,
    pub cali_idx: Option<i32>,

    // Calibration catalog (extrusion_cali_get response)
    pub filament_id: Option<String>,
    pub filaments: Option<Vec<CaliFilament>>,
}

// ==========================================================================
// Calibration
// ==========================================================================

/// One entry of the printer's pressure-advance catalog.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaliFilament {
    pub filament_id: String,
    pub name: String,
    pub k_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting_id: Option<String>,
    pub cali_idx: i32,
    pub extruder_id: Option<i32>,
    pub nozzle_temp: Option<i32>,
}

// ==========================================================================
// Device Info (Nozzle, Extruder)
// ==========================================================================

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDevice {
    pub extruder: Option<PrintDeviceExtruder>,
    #[serde(default, deserialize_with = "ignore_errors")]
    pub nozzle: Option<PrintDeviceNozzle>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceExtruder {
    pub info: Vec<PrintDeviceExtruderInfo>,
    pub state: Option<i32>,
}

/// `snow`/`star`/`spre` are the per-extruder now/target/previous tray
/// selectors, encoded as `ams_id << 8 | tray`.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceExtruderInfo {
    pub id: i32,
    pub snow: i32,
    pub spre: i32,
    pub star: i32,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceNozzle {
    pub info: Vec<PrintDeviceNozzleInfo>,
    pub state: Option<i32>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintDeviceNozzleInfo {
    pub id: i32,
    pub diameter: f32,
    #[serde(rename = "type")]
    pub nozzle_type: String,
}

// ==========================================================================
// AMS (Automatic Material System)
// ==========================================================================

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintAms {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ams: Option<Vec<PrintAmsUnit>>,
    pub ams_exist_bits: Option<String>,
    pub tray_exist_bits: Option<String>,
    pub tray_read_done_bits: Option<String>,
    pub tray_reading_bits: Option<String>,
    #[serde(
        default,
        serialize_with = "option_as_str_se",
        deserialize_with = "option_as_str_de"
    )]
    pub tray_tar: Option<i32>,
    #[serde(
        default,
        serialize_with = "option_as_str_se",
        deserialize_with = "option_as_str_de"
    )]
    pub tray_now: Option<i32>,
    #[serde(
        default,
        serialize_with = "option_as_str_se",
        deserialize_with = "option_as_str_de"
    )]
    pub tray_pre: Option<i32>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintAmsUnit {
    #[serde(serialize_with = "u32_as_str_se", deserialize_with = "u32_as_str_de")]
    pub id: u32,
    pub humidity: Option<String>,
    /// Unit temperature in °C, sent as a decimal string ("26.4")
    pub temp: Option<String>,
    pub tray: Vec<PrintTray>,
    /// Bit 8..11 carry the extruder the unit feeds on dual-nozzle models
    #[serde(
        default,
        serialize_with = "option_u32_as_str_hex_se",
        deserialize_with = "option_u32_as_str_hex_de"
    )]
    pub info: Option<u32>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintTray {
    #[serde(
        default,
        serialize_with = "option_u32_as_str_se",
        deserialize_with = "option_u32_as_str_de"
    )]
    pub id: Option<u32>,
    #[serde(skip_serializing)]
    pub k: Option<f32>,
    #[serde(skip_serializing)]
    pub cali_idx: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tray_info_idx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tray_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tray_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(
        default,
        serialize_with = "option_u32_as_str_se",
        deserialize_with = "option_u32_as_str_de"
    )]
    pub nozzle_temp_max: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(
        default,
        serialize_with = "option_u32_as_str_se",
        deserialize_with = "option_u32_as_str_de"
    )]
    pub nozzle_temp_min: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remain: Option<i64>,
}

// ==========================================================================
// Gcode State
// ==========================================================================

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[allow(clippy::upper_case_acronyms)]
pub enum GcodeState {
    #[default]
    Unknown,
    IDLE,
    SLICING,
    PREPARE,
    RUNNING,
    FINISH,
    FAILED,
    PAUSE,
    #[serde(other)]
    Unsupported,
}

// Unknown and Unsupported both travel as "UNKNOWN", which a derived
// Serialize cannot express.
impl Serialize for GcodeState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl GcodeState {
    /// True while the printer must not be disturbed on its active slot.
    pub fn is_busy(&self) -> bool {
        matches!(self, GcodeState::RUNNING | GcodeState::PAUSE | GcodeState::PREPARE)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GcodeState::IDLE => "IDLE",
            GcodeState::SLICING => "SLICING",
            GcodeState::PREPARE => "PREPARE",
            GcodeState::RUNNING => "RUNNING",
            GcodeState::FINISH => "FINISH",
            GcodeState::FAILED => "FAILED",
            GcodeState::PAUSE => "PAUSE",
            GcodeState::Unknown | GcodeState::Unsupported => "UNKNOWN",
        }
    }
}

// ==========================================================================
// Info Section
// ==========================================================================

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub info: InfoData,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoData {
    pub command: String,
    pub sequence_id: String,
    #[serde(default)]
    pub module: Vec<InfoModule>,
    pub result: Option<String>,
    pub reason: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoModule {
    pub name: String,
    pub project_name: Option<String>,
    pub product_name: Option<String>,
    pub sw_ver: String,
    pub hw_ver: String,
    pub sn: String,
}

// ==========================================================================
// Cover Section
// ==========================================================================

/// Chunked base64 job-cover image. Chunks sharing an `id` belong to one
/// assembly; `end` marks the terminating chunk.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cover {
    pub cover: CoverChunk,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverChunk {
    pub id: String,
    pub data: String,
    #[serde(default)]
    pub end: bool,
}

// ==========================================================================
// Commands
// ==========================================================================

/// Push all state command
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAllCommand {
    pub pushing: PushAll,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAll {
    pub command: String,
    pub sequence_id: String,
}

impl PushAllCommand {
    pub fn new(sequence_id: &str) -> Self {
        Self {
            pushing: PushAll {
                command: String::from("pushall"),
                sequence_id: String::from(sequence_id),
            },
        }
    }
}

/// Get version command
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetVersionCommand {
    pub info: GetVersion,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetVersion {
    pub command: String,
    pub sequence_id: String,
}

impl GetVersionCommand {
    pub fn new(sequence_id: &str) -> Self {
        Self {
            info: GetVersion {
                command: String::from("get_version"),
                sequence_id: String::from(sequence_id),
            },
        }
    }
}

/// AMS filament setting command
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsFilamentSettingCommand {
    pub print: AmsFilamentSetting,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsFilamentSetting {
    pub command: String,
    pub ams_id: i32,
    pub tray_id: i32,
    pub slot_id: i32,
    pub tray_info_idx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting_id: Option<String>,
    /// 8-hex RGBA, alpha included ("FF0000FF")
    pub tray_color: String,
    pub nozzle_temp_min: u32,
    pub nozzle_temp_max: u32,
    pub tray_type: String,
    pub sequence_id: String,
}

impl AmsFilamentSettingCommand {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sequence_id: &str,
        ams_id: i32,
        tray_id: i32,
        tray_info_idx: &str,
        setting_id: Option<&str>,
        tray_type: &str,
        tray_color: &str,
        nozzle_temp_min: u32,
        nozzle_temp_max: u32,
    ) -> Self {
        Self {
            print: AmsFilamentSetting {
                command: String::from("ams_filament_setting"),
                ams_id,
                tray_id,
                slot_id: ams_id * 4 + tray_id,
                tray_info_idx: String::from(tray_info_idx),
                setting_id: setting_id.map(String::from),
                tray_color: String::from(tray_color),
                nozzle_temp_min,
                nozzle_temp_max,
                tray_type: String::from(tray_type),
                sequence_id: String::from(sequence_id),
            },
        }
    }
}

/// Extrusion calibration get command
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionCaliGetCommand {
    pub print: ExtrusionCaliGet,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionCaliGet {
    pub command: String,
    pub filament_id: String,
    pub nozzle_diameter: String,
    pub sequence_id: String,
}

impl ExtrusionCaliGetCommand {
    pub fn new(sequence_id: &str, nozzle_diameter: &str) -> Self {
        Self {
            print: ExtrusionCaliGet {
                command: String::from("extrusion_cali_get"),
                filament_id: String::new(),
                nozzle_diameter: String::from(nozzle_diameter),
                sequence_id: String::from(sequence_id),
            },
        }
    }
}

/// Extrusion calibration set command
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionCaliSetCommand {
    pub print: ExtrusionCaliSet,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionCaliSet {
    pub command: String,
    pub cali_idx: i32,
    pub filament_id: String,
    pub setting_id: String,
    pub nozzle_diameter: String,
    pub k_value: String,
    pub nozzle_temp: i32,
    pub ams_id: i32,
    pub tray_id: i32,
    pub sequence_id: String,
}

impl ExtrusionCaliSetCommand {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sequence_id: &str,
        cali_idx: i32,
        filament_id: &str,
        setting_id: &str,
        nozzle_diameter: &str,
        k_value: &str,
        nozzle_temp: i32,
        ams_id: i32,
        tray_id: i32,
    ) -> Self {
        Self {
            print: ExtrusionCaliSet {
                command: String::from("extrusion_cali_set"),
                cali_idx,
                filament_id: String::from(filament_id),
                setting_id: String::from(setting_id),
                nozzle_diameter: String::from(nozzle_diameter),
                k_value: String::from(k_value),
                nozzle_temp,
                ams_id,
                tray_id,
                sequence_id: String::from(sequence_id),
            },
        }
    }
}

/// Trigger an RFID re-read for a slot ("reset slot")
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsGetRfidCommand {
    pub print: AmsGetRfid,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsGetRfid {
    pub command: String,
    pub ams_id: i32,
    pub tray_id: i32,
    pub sequence_id: String,
}

impl AmsGetRfidCommand {
    pub fn new(sequence_id: &str, ams_id: i32, tray_id: i32) -> Self {
        Self {
            print: AmsGetRfid {
                command: String::from("ams_get_rfid"),
                ams_id,
                tray_id,
                sequence_id: String::from(sequence_id),
            },
        }
    }
}

// ==========================================================================
// Serde Helpers
// ==========================================================================

fn u32_as_str_se<S>(x: &u32, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&x.to_string())
}

fn u32_as_str_de<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(deserializer)?;
    s.parse::<u32>().map_err(serde::de::Error::custom)
}

fn option_u32_as_str_se<S>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(v) => u32_as_str_se(v, serializer),
        None => serializer.serialize_none(),
    }
}

fn option_u32_as_str_de<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let option: Option<String> = Option::deserialize(deserializer)?;
    option
        .as_deref()
        .map(|s| s.parse::<u32>().map_err(serde::de::Error::custom))
        .transpose()
}

fn option_as_str_se<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: std::fmt::Display,
{
    match value {
        Some(v) => serializer.serialize_str(&v.to_string()),
        None => serializer.serialize_none(),
    }
}

fn option_as_str_de<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    let option: Option<String> = Option::deserialize(deserializer)?;
    option
        .as_deref()
        .map(|s| s.parse::<T>().map_err(serde::de::Error::custom))
        .transpose()
}

fn option_u32_as_str_hex_se<S>(x: &Option<u32>, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match x {
        Some(v) => s.serialize_str(&format!("{:x}", v)),
        None => s.serialize_none(),
    }
}

fn option_u32_as_str_hex_de<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    opt.as_deref()
        .map(|s| u32::from_str_radix(s, 16).map_err(serde::de::Error::custom))
        .transpose()
}

fn ignore_errors<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(T::deserialize(deserializer).ok())
}

/// Distinguishes an absent field (outer None) from an explicit JSON null
/// (inner None). Serde collapses both to `None` on a plain `Option`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_all_command() {
        let cmd = PushAllCommand::new("42");
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("pushall"));
        assert!(json.contains("\"sequence_id\":\"42\""));
    }

    #[test]
    fn test_ams_filament_setting() {
        let cmd = AmsFilamentSettingCommand::new(
            "7", 0, 2, "GFL99", None, "PLA", "FF0000FF", 190, 230,
        );
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("ams_filament_setting"));
        assert!(json.contains("GFL99"));
        assert_eq!(cmd.print.slot_id, 2);
    }

    #[test]
    fn test_extrusion_cali_set() {
        let cmd = ExtrusionCaliSetCommand::new("9", 3, "GFA00", "", "0.4", "0.025", 220, 0, 0);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("extrusion_cali_set"));
        assert!(json.contains("0.025"));
    }

    #[test]
    fn test_parse_report_frame() {
        let frame = r#"{"print":{"gcode_state":"RUNNING","mc_percent":45,
            "subtask_name":"test.gcode","mc_remaining_time":30,
            "ams":{"ams":[{"id":"0","humidity":"4","temp":"26.4",
                "tray":[{"id":"0","tray_type":"PLA","tray_color":"FF0000FF",
                         "tray_info_idx":"GFL99","nozzle_temp_min":"190",
                         "nozzle_temp_max":"230","remain":85}]}],
                "tray_now":"0","tray_exist_bits":"1","tray_reading_bits":"0"}}}"#;
        let msg: Message = serde_json::from_str(frame).unwrap();
        let Message::Print(print) = msg else {
            panic!("expected print section");
        };
        let data = print.print;
        assert_eq!(data.gcode_state, Some(GcodeState::RUNNING));
        assert_eq!(data.mc_percent, Some(45));
        let ams = data.ams.unwrap();
        assert_eq!(ams.tray_now, Some(0));
        let unit = &ams.ams.unwrap()[0];
        assert_eq!(unit.id, 0);
        assert_eq!(unit.tray[0].nozzle_temp_min, Some(190));
        assert_eq!(unit.tray[0].remain, Some(85));
    }

    #[test]
    fn test_parse_command_echo() {
        let frame = r#"{"print":{"command":"ams_filament_setting",
            "sequence_id":"17","result":"success","ams_id":0,"tray_id":1}}"#;
        let msg: Message = serde_json::from_str(frame).unwrap();
        let Message::Print(print) = msg else {
            panic!("expected print section");
        };
        assert_eq!(print.print.sequence_id.as_deref(), Some("17"));
        assert_eq!(print.print.result.as_deref(), Some("success"));
    }

    #[test]
    fn test_unknown_gcode_state_tolerated() {
        let frame = r#"{"print":{"gcode_state":"SOMETHING_NEW"}}"#;
        let msg: Message = serde_json::from_str(frame).unwrap();
        let Message::Print(print) = msg else {
            panic!("expected print section");
        };
        assert_eq!(print.print.gcode_state, Some(GcodeState::Unsupported));
    }
}
