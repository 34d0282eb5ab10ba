//! Canonical in-memory printer state
//!
//! One `PrinterState` per connected printer, owned exclusively by its MQTT
//! session task. Everything outside the session sees snapshot clones taken
//! from a watch channel.

pub mod cover;
pub mod reducer;

use serde::{Deserialize, Serialize};

use crate::mqtt::bambu_api::GcodeState;

/// Canonical kind of an AMS unit, derived from its wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmsKind {
    /// Four-slot unit, wire ids 0-3
    Regular,
    /// Single-slot high-temperature unit, wire ids 128-135
    HighTemp,
    /// External spool holder, wire ids 254 (left) and 255 (right)
    External,
}

/// Maps a wire AMS id to its canonical kind, display label and tray count.
///
/// Returns `None` for ids no known printer emits.
pub fn canonicalize_ams_id(id: u32) -> Option<(AmsKind, String, usize)> {
    match id {
        0..=3 => {
            let label = format!("AMS-{}", (b'A' + id as u8) as char);
            Some((AmsKind::Regular, label, 4))
        }
        128..=135 => {
            let label = format!("HT-{}", (b'A' + (id - 128) as u8) as char);
            Some((AmsKind::HighTemp, label, 1))
        }
        254 => Some((AmsKind::External, "External L".into(), 1)),
        255 => Some((AmsKind::External, "External".into(), 1)),
        _ => None,
    }
}

/// Global tray bit index used by `tray_exist_bits` / `tray_reading_bits`.
///
/// Regular units occupy bits 0-15 (`ams_id * 4 + tray`), HT units bits
/// 16-23. External slots have no bit.
pub fn tray_bit_index(ams_id: u32, tray_id: u32) -> Option<u32> {
    match ams_id {
        0..=3 => Some(ams_id * 4 + tray_id),
        128..=135 => Some(16 + (ams_id - 128)),
        _ => None,
    }
}

/// One filament slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmsTray {
    pub id: u32,
    /// Material code ("PLA", "PETG", ...); empty string = empty slot
    pub tray_type: String,
    /// 8-hex RGBA; retained even when the slot empties
    pub tray_color: String,
    /// Filament id the printer uses for its built-in profile lookup
    pub tray_info_idx: String,
    pub k_value: Option<f32>,
    pub cali_idx: Option<i32>,
    pub nozzle_temp_min: Option<u32>,
    pub nozzle_temp_max: Option<u32>,
    /// Remaining filament percentage, when the printer reports it
    pub remain: Option<i64>,
}

impl AmsTray {
    pub fn empty(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// A slot is empty when both the material and the color are unset.
    /// A slot with only a historical color is not empty-reported colors
    /// persist until the printer clears them.
    pub fn is_empty(&self) -> bool {
        self.tray_type.is_empty() && is_zero_color(&self.tray_color)
    }
}

fn is_zero_color(color: &str) -> bool {
    color.is_empty() || color.chars().all(|c| c == '0')
}

/// One AMS unit with canonical identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsUnit {
    pub id: u32,
    pub kind: AmsKind,
    pub label: String,
    /// Humidity percentage 0-100, None when the unit doesn't report it
    pub humidity: Option<u8>,
    /// Unit temperature in tenths of °C
    pub temperature_c10: Option<i32>,
    /// 0 = right, 1 = left, -1 = unknown
    pub extruder: i8,
    pub trays: Vec<AmsTray>,
}

impl AmsUnit {
    pub fn new(id: u32) -> Option<Self> {
        let (kind, label, tray_count) = canonicalize_ams_id(id)?;
        Some(Self {
            id,
            kind,
            label,
            humidity: None,
            temperature_c10: None,
            extruder: -1,
            trays: (0..tray_count as u32).map(AmsTray::empty).collect(),
        })
    }
}

/// Pressure-advance calibration record from the printer's catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KProfile {
    pub cali_idx: i32,
    pub filament_id: String,
    pub setting_id: Option<String>,
    pub name: String,
    pub k_value: String,
    pub extruder_id: Option<i32>,
    pub nozzle_temp: Option<i32>,
    /// Nozzle diameter the catalog entry belongs to ("0.4")
    pub nozzle_diameter: String,
}

/// Firmware module versions from the `info` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareModule {
    pub name: String,
    pub sw_ver: String,
    pub hw_ver: String,
}

/// Canonical projection of one printer's live telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterState {
    pub connected: bool,
    /// Unix seconds of the last frame received
    pub last_seen_ts: Option<i64>,

    // Print job
    pub gcode_state: GcodeState,
    pub subtask_name: String,
    pub gcode_file: String,
    /// Clamped to 0-100
    pub print_progress: u8,
    pub layer_num: i64,
    pub total_layer_num: i64,
    pub mc_remaining_time: i64,
    pub stg_cur: i32,
    pub stg_cur_name: Option<String>,

    // AMS
    pub ams_units: Vec<AmsUnit>,
    pub tray_now: Option<i32>,
    pub tray_now_left: Option<i32>,
    pub tray_now_right: Option<i32>,
    pub active_extruder: Option<u8>,
    pub tray_reading_bits: u32,
    pub nozzle_count: u8,

    // Calibration catalog
    pub calibrations: Vec<KProfile>,

    // Firmware identity
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub modules: Vec<FirmwareModule>,

    /// Raw RGB565 cover image of the current job, not serialized to WS
    #[serde(skip)]
    pub cover: Option<Vec<u8>>,
}

impl Default for PrinterState {
    fn default() -> Self {
        Self {
            connected: false,
            last_seen_ts: None,
            gcode_state: GcodeState::Unknown,
            subtask_name: String::new(),
            gcode_file: String::new(),
            print_progress: 0,
            layer_num: 0,
            total_layer_num: 0,
            mc_remaining_time: 0,
            stg_cur: -1,
            stg_cur_name: None,
            ams_units: Vec::new(),
            tray_now: None,
            tray_now_left: None,
            tray_now_right: None,
            active_extruder: None,
            tray_reading_bits: 0,
            nozzle_count: 1,
            calibrations: Vec::new(),
            modules: Vec::new(),
            cover: None,
        }
    }
}

impl PrinterState {
    /// Offline printers keep their last telemetry but lose selector validity.
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
        self.tray_now = None;
        self.tray_now_left = None;
        self.tray_now_right = None;
        self.active_extruder = None;
    }

    pub fn unit(&self, ams_id: u32) -> Option<&AmsUnit> {
        self.ams_units.iter().find(|u| u.id == ams_id)
    }

    pub fn unit_mut(&mut self, ams_id: u32) -> &mut AmsUnit {
        if let Some(pos) = self.ams_units.iter().position(|u| u.id == ams_id) {
            return &mut self.ams_units[pos];
        }
        let unit = AmsUnit::new(ams_id).expect("caller validated ams id");
        self.ams_units.push(unit);
        self.ams_units.sort_by_key(|u| u.id);
        let pos = self
            .ams_units
            .iter()
            .position(|u| u.id == ams_id)
            .expect("just inserted");
        &mut self.ams_units[pos]
    }

    pub fn tray(&self, ams_id: u32, tray_id: u32) -> Option<&AmsTray> {
        self.unit(ams_id)?.trays.iter().find(|t| t.id == tray_id)
    }

    /// K-profile for a filament id, preferring the given nozzle diameter.
    pub fn k_profile_for(&self, filament_id: &str, nozzle_diameter: &str) -> Option<&KProfile> {
        self.calibrations
            .iter()
            .find(|c| c.filament_id == filament_id && c.nozzle_diameter == nozzle_diameter)
            .or_else(|| self.calibrations.iter().find(|c| c.filament_id == filament_id))
    }

    /// True when a job is actively using the given slot, meaning the slot
    /// must not be reconfigured.
    pub fn slot_in_active_use(&self, ams_id: u32, tray_id: u32) -> bool {
        if !self.gcode_state.is_busy() {
            return false;
        }
        let global = match canonicalize_ams_id(ams_id) {
            Some((AmsKind::External, _, _)) => ams_id as i32,
            Some(_) => match tray_bit_index(ams_id, tray_id) {
                Some(bit) => bit as i32,
                None => return false,
            },
            None => return false,
        };
        self.tray_now == Some(global)
            || self.tray_now_left == Some(global)
            || self.tray_now_right == Some(global)
    }
}

/// Printer stage codes from the `stg_cur` report field.
///
/// Values follow the Home Assistant Bambu Lab integration's stage table.
pub fn stage_name(code: i32) -> Option<&'static str> {
    Some(match code {
        1 => "Auto bed leveling",
        2 => "Heatbed preheating",
        3 => "Sweeping XY mech mode",
        4 => "Changing filament",
        5 => "M400 pause",
        6 => "Paused due to filament runout",
        7 => "Heating hotend",
        8 => "Calibrating extrusion",
        9 => "Scanning bed surface",
        10 => "Inspecting first layer",
        11 => "Identifying build plate type",
        12 => "Calibrating micro lidar",
        13 => "Homing toolhead",
        14 => "Cleaning nozzle tip",
        15 => "Checking extruder temperature",
        16 => "Paused by the user",
        17 => "Pause of front cover falling",
        18 => "Calibrating micro lidar",
        19 => "Calibrating extrusion flow",
        20 => "Paused due to nozzle temperature malfunction",
        21 => "Paused due to heat bed temperature malfunction",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ams_id_canonicalization() {
        let cases = [
            (0u32, "AMS-A", 4usize),
            (1, "AMS-B", 4),
            (2, "AMS-C", 4),
            (3, "AMS-D", 4),
            (128, "HT-A", 1),
            (129, "HT-B", 1),
            (254, "External L", 1),
            (255, "External", 1),
        ];
        for (id, label, trays) in cases {
            let (_, got_label, got_trays) = canonicalize_ams_id(id).unwrap();
            assert_eq!(got_label, label, "id {id}");
            assert_eq!(got_trays, trays, "id {id}");
        }
        assert!(canonicalize_ams_id(7).is_none());
        assert!(canonicalize_ams_id(200).is_none());
    }

    #[test]
    fn test_tray_bit_index() {
        assert_eq!(tray_bit_index(0, 0), Some(0));
        assert_eq!(tray_bit_index(1, 2), Some(6));
        assert_eq!(tray_bit_index(3, 3), Some(15));
        assert_eq!(tray_bit_index(128, 0), Some(16));
        assert_eq!(tray_bit_index(131, 0), Some(19));
        assert_eq!(tray_bit_index(254, 0), None);
        assert_eq!(tray_bit_index(255, 0), None);
    }

    #[test]
    fn test_empty_slot_rule() {
        let mut tray = AmsTray::empty(0);
        assert!(tray.is_empty());

        // A historical color alone does not make the slot occupied
        tray.tray_color = "FF0000FF".into();
        assert!(!tray.is_empty());

        tray.tray_color = "00000000".into();
        assert!(tray.is_empty());

        tray.tray_type = "PLA".into();
        assert!(!tray.is_empty());
    }

    #[test]
    fn test_mark_disconnected_preserves_telemetry() {
        let mut state = PrinterState {
            connected: true,
            print_progress: 80,
            subtask_name: "benchy.gcode".into(),
            tray_now: Some(2),
            active_extruder: Some(0),
            ..Default::default()
        };
        state.mark_disconnected();
        assert!(!state.connected);
        assert_eq!(state.print_progress, 80);
        assert_eq!(state.subtask_name, "benchy.gcode");
        assert_eq!(state.tray_now, None);
        assert_eq!(state.active_extruder, None);
    }

    #[test]
    fn test_slot_in_active_use() {
        let mut state = PrinterState {
            connected: true,
            gcode_state: GcodeState::RUNNING,
            tray_now: Some(0),
            ..Default::default()
        };
        assert!(state.slot_in_active_use(0, 0));
        assert!(!state.slot_in_active_use(0, 1));

        state.gcode_state = GcodeState::IDLE;
        assert!(!state.slot_in_active_use(0, 0));

        // External spool during a print
        state.gcode_state = GcodeState::PAUSE;
        state.tray_now = Some(255);
        assert!(state.slot_in_active_use(255, 0));
    }

    #[test]
    fn test_stage_name() {
        assert_eq!(stage_name(1), Some("Auto bed leveling"));
        assert_eq!(stage_name(14), Some("Cleaning nozzle tip"));
        assert_eq!(stage_name(0), None);
        assert_eq!(stage_name(-1), None);
    }
}
