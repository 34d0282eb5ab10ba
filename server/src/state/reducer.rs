//! Report parser & state reducer
//!
//! Folds raw report frames into the canonical `PrinterState` and computes
//! the delta list the hub fans out. Frames are partial: only fields present
//! in a frame are applied, absent fields keep their prior value, an
//! explicit JSON null clears. AMS units and trays merge per id; slots not
//! mentioned in a frame persist until a pushall snapshot or an explicit
//! clear.

use crate::events::{Event, StateDelta};
use crate::mqtt::bambu_api::{
    CaliFilament, InfoData, Message, PrintAms, PrintAmsUnit, PrintData, PrintTray,
};
use crate::state::cover::{CoverAssembler, CoverProgress};
use crate::state::{
    AmsTray, AmsUnit, KProfile, PrinterState, canonicalize_ams_id, stage_name,
};

/// Frames above this size are rejected before JSON parsing.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Correlated command acknowledgement extracted from a report frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEcho {
    pub sequence_id: u64,
    pub command: String,
    pub success: bool,
    pub reason: Option<String>,
}

/// Everything one frame produced.
#[derive(Default)]
pub struct ReduceOutcome {
    pub deltas: Vec<StateDelta>,
    pub events: Vec<Event>,
    pub echo: Option<CommandEcho>,
    /// True when the frame was a pushall response (full state dump)
    pub snapshot: bool,
}

/// Per-printer reducer. Owns the cover assembler; the `PrinterState` itself
/// is owned by the session task and passed in mutably.
pub struct Reducer {
    serial: String,
    cover: CoverAssembler,
}

impl Reducer {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            cover: CoverAssembler::new(),
        }
    }

    /// Applies one raw frame. Parse failures are reported as events, never
    /// as errors: the session continues on the next frame.
    pub fn apply(&mut self, state: &mut PrinterState, payload: &[u8], now_ts: i64) -> ReduceOutcome {
        let mut out = ReduceOutcome::default();

        if payload.len() > MAX_FRAME_BYTES {
            out.events.push(self.parse_error(format!(
                "frame of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_FRAME_BYTES
            )));
            return out;
        }

        let text = match std::str::from_utf8(payload) {
            Ok(t) => t,
            Err(_) => {
                out.events.push(self.parse_error("non-UTF8 payload".into()));
                return out;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                out.events.push(self.parse_error(format!("malformed JSON: {e}")));
                return out;
            }
        };

        let message: Message = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(_) => {
                // Valid JSON whose top-level section we don't recognize.
                tracing::debug!(serial = %self.serial, "ignoring unknown report section");
                return out;
            }
        };

        state.last_seen_ts = Some(now_ts);

        match message {
            Message::Print(print) => self.reduce_print(state, &print.print, &mut out),
            Message::Info(info) => self.reduce_info(state, &info.info, &mut out),
            Message::Cover(cover) => self.reduce_cover(state, &cover.cover, &mut out),
        }

        out
    }

    fn parse_error(&self, message: String) -> Event {
        Event::ParseError {
            serial: self.serial.clone(),
            message,
        }
    }

    fn parse_warning(&self, message: String) -> Event {
        Event::ParseWarning {
            serial: self.serial.clone(),
            message,
        }
    }

    // ----------------------------------------------------------------------
    // print section
    // ----------------------------------------------------------------------

    fn reduce_print(&mut self, state: &mut PrinterState, data: &PrintData, out: &mut ReduceOutcome) {
        let old = state.clone();

        // Command acknowledgements travel in the same section, echoing the
        // sequence id the dispatcher sent.
        if let (Some(command), Some(seq), Some(result)) =
            (&data.command, &data.sequence_id, &data.result)
        {
            if let Ok(sequence_id) = seq.parse::<u64>() {
                out.echo = Some(CommandEcho {
                    sequence_id,
                    command: command.clone(),
                    success: result == "success",
                    reason: data.reason.clone(),
                });
            }
        }

        let handled = match data.command.as_deref() {
            Some("ams_filament_setting") => {
                self.apply_filament_setting_echo(state, data);
                true
            }
            Some("extrusion_cali_get") => {
                self.apply_cali_catalog(state, data);
                true
            }
            Some("extrusion_cali_set") | Some("extrusion_cali_del") | Some("ams_get_rfid") => {
                // Catalog and reading bits arrive through regular frames.
                true
            }
            _ => false,
        };

        // A pushall response is the one frame carrying the complete AMS
        // picture: unit list plus external tray plus selectors.
        out.snapshot = data
            .ams
            .as_ref()
            .is_some_and(|a| a.ams.is_some() && a.tray_now.is_some())
            && (data.vt_tray.is_some() || data.vir_slot.is_some());

        if !handled {
            self.merge_print_fields(state, data, out.snapshot, out);
        }

        self.emit_job_events(&old, state, out);
        diff_states(&old, state, &mut out.deltas);
    }

    fn merge_print_fields(
        &mut self,
        state: &mut PrinterState,
        data: &PrintData,
        full_snapshot: bool,
        out: &mut ReduceOutcome,
    ) {
        if let Some(gcode_state) = data.gcode_state {
            state.gcode_state = gcode_state;
        }

        // Absent = retain, null = clear, string = assign.
        let job_before = state.subtask_name.clone();
        if let Some(subtask) = &data.subtask_name {
            state.subtask_name = subtask.clone().unwrap_or_default();
        }
        if let Some(gcode_file) = &data.gcode_file {
            state.gcode_file = gcode_file.clone().unwrap_or_default();
        }
        let job_changed = state.subtask_name != job_before;

        if let Some(percent) = data.mc_percent {
            let clamped = percent.clamp(0, 100) as u8;
            if !(0..=100).contains(&percent) {
                out.events.push(self.parse_warning(format!(
                    "print progress {percent} out of range, clamped to {clamped}"
                )));
            }
            // Progress is monotonic within one job; it resets with the job.
            if job_changed || clamped >= state.print_progress {
                state.print_progress = clamped;
            }
        }
        if job_changed && data.mc_percent.is_none() {
            state.print_progress = 0;
        }

        if let Some(layer) = data.layer_num {
            state.layer_num = layer;
        }
        if let Some(total) = data.total_layer_num {
            state.total_layer_num = total;
        }
        if let Some(remaining) = data.mc_remaining_time {
            state.mc_remaining_time = remaining;
        }
        if let Some(stage) = data.stg_cur {
            state.stg_cur = stage;
            state.stg_cur_name = stage_name(stage).map(String::from);
        }

        self.merge_selectors(state, data);

        if let Some(ams) = &data.ams {
            self.merge_ams(state, ams, full_snapshot, out);
        }
        if let Some(vt_tray) = &data.vt_tray {
            self.merge_external_tray(state, 255, vt_tray, out);
        }
        if let Some(vir_slot) = &data.vir_slot {
            for slot in vir_slot {
                if let Some(id @ (254 | 255)) = slot.id {
                    self.merge_external_tray(state, id, slot, out);
                }
            }
        }
    }

    /// Active-tray selectors. Dual-nozzle printers report them per extruder
    /// as `ams_id << 8 | tray`; single-nozzle printers use the flat
    /// `ams.tray_now` field where 255 means none and 254 the external slot.
    fn merge_selectors(&self, state: &mut PrinterState, data: &PrintData) {
        if let Some(extruder) = data.device.as_ref().and_then(|d| d.extruder.as_ref()) {
            if let Some(ext_state) = extruder.state {
                let nozzles = (ext_state & 0x0F) as u8;
                if nozzles > 0 {
                    state.nozzle_count = nozzles.min(2);
                }
                let active = ((ext_state >> 4) & 0x0F) as u8;
                state.active_extruder = (active <= 1).then_some(active);
            }
            for info in &extruder.info {
                match info.id {
                    0 => state.tray_now_right = normalize_dual_selector(info.snow, 0),
                    1 => state.tray_now_left = normalize_dual_selector(info.snow, 1),
                    _ => {}
                }
            }
            state.tray_now = match state.active_extruder {
                Some(0) => state.tray_now_right,
                Some(1) => state.tray_now_left,
                _ => None,
            };
        } else if let Some(tray_now) = data.ams.as_ref().and_then(|a| a.tray_now) {
            state.tray_now = normalize_flat_selector(tray_now);
        }
    }

    fn merge_ams(
        &mut self,
        state: &mut PrinterState,
        ams: &PrintAms,
        full_snapshot: bool,
        out: &mut ReduceOutcome,
    ) {
        // Reading bits are authoritative: applied whenever present, zeroed
        // only when the printer sends them zeroed.
        if let Some(bits) = &ams.tray_reading_bits {
            match u32::from_str_radix(bits, 16) {
                Ok(bits) => {
                    state.tray_reading_bits = bits;
                    for unit in 0..4u32 {
                        let nibble = (bits >> (unit * 4)) & 0x0F;
                        if nibble.count_ones() > 1 {
                            out.events.push(self.parse_warning(format!(
                                "multiple trays reading at once in AMS unit {unit} (bits {nibble:04b})"
                            )));
                        }
                    }
                }
                Err(_) => out
                    .events
                    .push(self.parse_warning(format!("unparseable tray_reading_bits {bits:?}"))),
            }
        }

        if let Some(units) = &ams.ams {
            for unit_frame in units {
                self.merge_unit(state, unit_frame, full_snapshot, out);
            }
        }
    }

    fn merge_unit(
        &mut self,
        state: &mut PrinterState,
        frame: &PrintAmsUnit,
        full_snapshot: bool,
        out: &mut ReduceOutcome,
    ) {
        let Some((_, _, tray_count)) = canonicalize_ams_id(frame.id) else {
            out.events
                .push(self.parse_warning(format!("unknown AMS id {}", frame.id)));
            return;
        };

        if full_snapshot {
            // Pushall replaces units present in the frame wholesale.
            let fresh = AmsUnit::new(frame.id).expect("id canonicalized above");
            if let Some(pos) = state.ams_units.iter().position(|u| u.id == frame.id) {
                state.ams_units[pos] = fresh;
            } else {
                state.ams_units.push(fresh);
                state.ams_units.sort_by_key(|u| u.id);
            }
        }

        let serial = self.serial.clone();
        let unit = state.unit_mut(frame.id);

        if let Some(humidity) = &frame.humidity {
            unit.humidity = humidity.parse::<u8>().ok().filter(|h| *h <= 100);
        }
        if let Some(temp) = &frame.temp {
            unit.temperature_c10 = temp.parse::<f32>().ok().map(|t| (t * 10.0).round() as i32);
        }
        if let Some(info) = frame.info {
            let extruder = ((info >> 8) & 0x0F) as i8;
            unit.extruder = if extruder <= 1 { extruder } else { -1 };
        }

        for tray_frame in &frame.tray {
            let Some(tray_id) = tray_frame.id else {
                continue;
            };
            if tray_id as usize >= tray_count {
                out.events.push(Event::ParseWarning {
                    serial: serial.clone(),
                    message: format!("tray {} out of range for AMS {}", tray_id, frame.id),
                });
                continue;
            }
            merge_tray(&mut unit.trays[tray_id as usize], tray_frame);
        }
    }

    fn merge_external_tray(
        &mut self,
        state: &mut PrinterState,
        ams_id: u32,
        frame: &PrintTray,
        _out: &mut ReduceOutcome,
    ) {
        let unit = state.unit_mut(ams_id);
        merge_tray(&mut unit.trays[0], frame);
        unit.trays[0].id = 0;
    }

    /// `ams_filament_setting` acks echo the values just written; folding
    /// them in immediately keeps the UI ahead of the next periodic push.
    fn apply_filament_setting_echo(&self, state: &mut PrinterState, data: &PrintData) {
        let Some(ams_id) = data.ams_id else { return };
        let tray_id = data.tray_id.unwrap_or(0);
        if ams_id < 0 || tray_id < 0 {
            return;
        }
        let Some((_, _, tray_count)) = canonicalize_ams_id(ams_id as u32) else {
            return;
        };
        if tray_id as usize >= tray_count {
            return;
        }
        let unit = state.unit_mut(ams_id as u32);
        let tray = &mut unit.trays[tray_id as usize];
        tray.tray_info_idx = data.tray_info_idx.clone().unwrap_or_default();
        tray.tray_type = data.tray_type.clone().unwrap_or_default();
        if let Some(color) = &data.tray_color {
            tray.tray_color = color.clone();
        }
        tray.nozzle_temp_min = data.nozzle_temp_min;
        tray.nozzle_temp_max = data.nozzle_temp_max;
        // An explicit filament write invalidates the tag-derived K value.
        tray.k_value = None;
    }

    /// `extrusion_cali_get` responses replace the catalog for one diameter.
    fn apply_cali_catalog(&self, state: &mut PrinterState, data: &PrintData) {
        let Some(diameter) = &data.nozzle_diameter else {
            return;
        };
        if data.filament_id.as_deref() != Some("") {
            return;
        }
        let Some(filaments) = &data.filaments else {
            return;
        };
        state.calibrations.retain(|c| &c.nozzle_diameter != diameter);
        for filament in filaments {
            state.calibrations.push(k_profile_from(filament, diameter));
        }
        state.calibrations.sort_by_key(|c| c.cali_idx);
    }

    fn emit_job_events(&self, old: &PrinterState, new: &PrinterState, out: &mut ReduceOutcome) {
        let before = old.subtask_name.as_str();
        let after = new.subtask_name.as_str();
        if before == after {
            return;
        }
        let event = match (before.is_empty(), after.is_empty()) {
            (true, false) => Event::JobStarted {
                serial: self.serial.clone(),
                subtask_name: after.to_string(),
            },
            (false, true) => Event::JobEnded {
                serial: self.serial.clone(),
            },
            (false, false) => Event::JobChanged {
                serial: self.serial.clone(),
                subtask_name: after.to_string(),
            },
            (true, true) => unreachable!("subtask compared equal above"),
        };
        out.events.push(event);
    }

    // ----------------------------------------------------------------------
    // info section
    // ----------------------------------------------------------------------

    fn reduce_info(&mut self, state: &mut PrinterState, info: &InfoData, out: &mut ReduceOutcome) {
        if info.command != "get_version" || info.module.is_empty() {
            return;
        }
        let old = state.clone();
        state.modules = info
            .module
            .iter()
            .map(|m| crate::state::FirmwareModule {
                name: m.name.clone(),
                sw_ver: m.sw_ver.clone(),
                hw_ver: m.hw_ver.clone(),
            })
            .collect();
        diff_states(&old, state, &mut out.deltas);
    }

    // ----------------------------------------------------------------------
    // cover section
    // ----------------------------------------------------------------------

    fn reduce_cover(
        &mut self,
        state: &mut PrinterState,
        chunk: &crate::mqtt::bambu_api::CoverChunk,
        out: &mut ReduceOutcome,
    ) {
        match self.cover.push(chunk) {
            CoverProgress::Partial => {}
            CoverProgress::Complete(image) => {
                let old_len = state.cover.as_ref().map(|c| c.len()).unwrap_or(0);
                let new_len = image.len();
                state.cover = Some(image);
                out.deltas.push(StateDelta {
                    path: "cover".into(),
                    old: serde_json::json!(old_len),
                    new: serde_json::json!(new_len),
                });
            }
            CoverProgress::Discarded(reason) => {
                out.events.push(self.parse_warning(reason));
            }
        }
    }
}

/// One tray frame is a complete description when it names a material; a
/// frame without filament fields only refreshes the metrics it carries.
fn merge_tray(tray: &mut AmsTray, frame: &PrintTray) {
    if let Some(tray_type) = &frame.tray_type {
        tray.tray_type = tray_type.clone();
        tray.tray_info_idx = frame.tray_info_idx.clone().unwrap_or_default();
        if let Some(color) = &frame.tray_color {
            tray.tray_color = color.clone();
        }
        tray.nozzle_temp_min = frame.nozzle_temp_min;
        tray.nozzle_temp_max = frame.nozzle_temp_max;
    }
    if frame.k.is_some() {
        tray.k_value = frame.k;
    }
    if frame.cali_idx.is_some() {
        tray.cali_idx = frame.cali_idx.filter(|c| *c > 0);
    }
    if frame.remain.is_some() {
        tray.remain = frame.remain;
    }
}

fn k_profile_from(filament: &CaliFilament, diameter: &str) -> KProfile {
    KProfile {
        cali_idx: filament.cali_idx,
        filament_id: filament.filament_id.clone(),
        setting_id: filament.setting_id.clone(),
        name: filament.name.clone(),
        k_value: filament.k_value.clone(),
        extruder_id: filament.extruder_id,
        nozzle_temp: filament.nozzle_temp,
        nozzle_diameter: diameter.to_string(),
    }
}

/// Dual-nozzle selector encoding: `ams_id << 8 | tray`. 0xFF in the tray
/// byte under an external ams id means nothing loaded.
fn normalize_dual_selector(value: i32, extruder: u8) -> Option<i32> {
    let ams_id = value >> 8;
    let tray = value & 0xFF;
    match ams_id {
        0..=3 => Some(ams_id * 4 + (tray & 0x03)),
        128..=135 => Some(16 + (ams_id - 128)),
        254 | 255 => {
            if tray == 0xFF {
                None
            } else if extruder == 0 {
                Some(255)
            } else {
                Some(254)
            }
        }
        _ => None,
    }
}

/// Single-nozzle flat selector: 0-15 AMS slots, 254 external, 255 none.
fn normalize_flat_selector(value: i32) -> Option<i32> {
    match value {
        255 => None,
        v => Some(v),
    }
}

// --------------------------------------------------------------------------
// Delta computation
// --------------------------------------------------------------------------

macro_rules! diff_field {
    ($old:expr, $new:expr, $deltas:expr, $field:ident) => {
        if $old.$field != $new.$field {
            $deltas.push(StateDelta {
                path: stringify!($field).to_string(),
                old: serde_json::to_value(&$old.$field).unwrap_or_default(),
                new: serde_json::to_value(&$new.$field).unwrap_or_default(),
            });
        }
    };
}

/// Diffs two snapshots into path-addressed deltas. Scalar paths use the
/// field name; units diff as `ams.{id}` and trays as `ams.{id}.tray.{tid}`.
pub fn diff_states(old: &PrinterState, new: &PrinterState, deltas: &mut Vec<StateDelta>) {
    diff_field!(old, new, deltas, connected);
    diff_field!(old, new, deltas, gcode_state);
    diff_field!(old, new, deltas, subtask_name);
    diff_field!(old, new, deltas, gcode_file);
    diff_field!(old, new, deltas, print_progress);
    diff_field!(old, new, deltas, layer_num);
    diff_field!(old, new, deltas, total_layer_num);
    diff_field!(old, new, deltas, mc_remaining_time);
    diff_field!(old, new, deltas, stg_cur);
    diff_field!(old, new, deltas, stg_cur_name);
    diff_field!(old, new, deltas, tray_now);
    diff_field!(old, new, deltas, tray_now_left);
    diff_field!(old, new, deltas, tray_now_right);
    diff_field!(old, new, deltas, active_extruder);
    diff_field!(old, new, deltas, tray_reading_bits);
    diff_field!(old, new, deltas, nozzle_count);
    diff_field!(old, new, deltas, calibrations);
    diff_field!(old, new, deltas, modules);

    for new_unit in &new.ams_units {
        match old.ams_units.iter().find(|u| u.id == new_unit.id) {
            None => deltas.push(StateDelta {
                path: format!("ams.{}", new_unit.id),
                old: serde_json::Value::Null,
                new: serde_json::to_value(new_unit).unwrap_or_default(),
            }),
            Some(old_unit) => diff_units(old_unit, new_unit, deltas),
        }
    }
    for old_unit in &old.ams_units {
        if !new.ams_units.iter().any(|u| u.id == old_unit.id) {
            deltas.push(StateDelta {
                path: format!("ams.{}", old_unit.id),
                old: serde_json::to_value(old_unit).unwrap_or_default(),
                new: serde_json::Value::Null,
            });
        }
    }
}

fn diff_units(old: &AmsUnit, new: &AmsUnit, deltas: &mut Vec<StateDelta>) {
    if old.humidity != new.humidity
        || old.temperature_c10 != new.temperature_c10
        || old.extruder != new.extruder
    {
        let strip = |unit: &AmsUnit| {
            let mut v = serde_json::to_value(unit).unwrap_or_default();
            if let Some(map) = v.as_object_mut() {
                map.remove("trays");
            }
            v
        };
        deltas.push(StateDelta {
            path: format!("ams.{}", new.id),
            old: strip(old),
            new: strip(new),
        });
    }
    for (old_tray, new_tray) in old.trays.iter().zip(&new.trays) {
        if old_tray != new_tray {
            deltas.push(StateDelta {
                path: format!("ams.{}.tray.{}", new.id, new_tray.id),
                old: serde_json::to_value(old_tray).unwrap_or_default(),
                new: serde_json::to_value(new_tray).unwrap_or_default(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(reducer: &mut Reducer, state: &mut PrinterState, json: &str) -> ReduceOutcome {
        reducer.apply(state, json.as_bytes(), 1_700_000_000)
    }

    fn pushall_frame() -> &'static str {
        r#"{"print":{"gcode_state":"IDLE","mc_percent":0,
            "ams":{"ams":[
                {"id":"0","humidity":"5","temp":"24.0",
                 "tray":[
                    {"id":"0","tray_type":"PLA","tray_color":"FF0000FF","tray_info_idx":"GFL99","nozzle_temp_min":"190","nozzle_temp_max":"230"},
                    {"id":"1","tray_type":"","tray_color":"00000000"},
                    {"id":"2","tray_type":"PETG","tray_color":"00FF00FF","tray_info_idx":"GFG00","nozzle_temp_min":"220","nozzle_temp_max":"270"},
                    {"id":"3","tray_type":"","tray_color":"00000000"}]}],
                "tray_now":"255","tray_exist_bits":"5","tray_reading_bits":"0"},
            "vt_tray":{"id":"254","tray_type":"","tray_color":"00000000"}}}"#
    }

    #[test]
    fn test_pushall_is_detected_as_snapshot() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        let out = apply(&mut reducer, &mut state, pushall_frame());
        assert!(out.snapshot);
        assert_eq!(state.ams_units.len(), 2); // AMS-A + External
        let unit = state.unit(0).unwrap();
        assert_eq!(unit.label, "AMS-A");
        assert_eq!(unit.humidity, Some(5));
        assert_eq!(unit.temperature_c10, Some(240));
        assert_eq!(unit.trays[0].tray_type, "PLA");
        assert!(unit.trays[1].is_empty());
    }

    #[test]
    fn test_partial_frame_retains_absent_slots() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        apply(&mut reducer, &mut state, pushall_frame());

        // A later frame mentioning only tray 2 must not clear tray 0.
        let partial = r#"{"print":{"ams":{"ams":[{"id":"0",
            "tray":[{"id":"2","tray_type":"PETG","tray_color":"0000FFFF","tray_info_idx":"GFG00","nozzle_temp_min":"220","nozzle_temp_max":"270"}]}]}}}"#;
        apply(&mut reducer, &mut state, partial);

        let unit = state.unit(0).unwrap();
        assert_eq!(unit.trays[0].tray_type, "PLA");
        assert_eq!(unit.trays[2].tray_color, "0000FFFF");
    }

    #[test]
    fn test_used_color_persists_when_slot_empties() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        apply(&mut reducer, &mut state, pushall_frame());

        let emptied = r#"{"print":{"ams":{"ams":[{"id":"0",
            "tray":[{"id":"0","tray_type":"","tray_color":"FF0000FF"}]}]}}}"#;
        apply(&mut reducer, &mut state, emptied);

        let tray = state.tray(0, 0).unwrap();
        assert_eq!(tray.tray_type, "");
        assert_eq!(tray.tray_color, "FF0000FF");
        // Color alone does not mark the slot occupied
        assert!(!tray.is_empty());
    }

    #[test]
    fn test_progress_clamped_with_warning() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        let out = apply(
            &mut reducer,
            &mut state,
            r#"{"print":{"mc_percent":140,"subtask_name":"x.gcode"}}"#,
        );
        assert_eq!(state.print_progress, 100);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, Event::ParseWarning { .. })));
    }

    #[test]
    fn test_progress_monotonic_within_job() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        apply(&mut reducer, &mut state, r#"{"print":{"subtask_name":"a.gcode","mc_percent":50}}"#);
        apply(&mut reducer, &mut state, r#"{"print":{"mc_percent":40}}"#);
        assert_eq!(state.print_progress, 50);

        // A new job resets the baseline
        apply(&mut reducer, &mut state, r#"{"print":{"subtask_name":"b.gcode","mc_percent":5}}"#);
        assert_eq!(state.print_progress, 5);
    }

    #[test]
    fn test_job_transition_events() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();

        let out = apply(&mut reducer, &mut state, r#"{"print":{"subtask_name":"a.gcode"}}"#);
        assert!(matches!(out.events[0], Event::JobStarted { .. }));

        let out = apply(&mut reducer, &mut state, r#"{"print":{"subtask_name":"b.gcode"}}"#);
        assert!(matches!(out.events[0], Event::JobChanged { .. }));

        let out = apply(&mut reducer, &mut state, r#"{"print":{"subtask_name":null}}"#);
        assert!(matches!(out.events[0], Event::JobEnded { .. }));
        assert_eq!(state.subtask_name, "");

        // Absent field is not a transition
        let out = apply(&mut reducer, &mut state, r#"{"print":{"mc_percent":1}}"#);
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_reading_bits_authoritative() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        apply(&mut reducer, &mut state, r#"{"print":{"ams":{"tray_reading_bits":"4"}}}"#);
        assert_eq!(state.tray_reading_bits, 0b100);

        // Frames without the field leave the bits untouched
        apply(&mut reducer, &mut state, r#"{"print":{"mc_percent":10,"subtask_name":"j"}}"#);
        assert_eq!(state.tray_reading_bits, 0b100);

        apply(&mut reducer, &mut state, r#"{"print":{"ams":{"tray_reading_bits":"0"}}}"#);
        assert_eq!(state.tray_reading_bits, 0);
    }

    #[test]
    fn test_multiple_reading_bits_per_unit_warns() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        let out = apply(&mut reducer, &mut state, r#"{"print":{"ams":{"tray_reading_bits":"3"}}}"#);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, Event::ParseWarning { .. })));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        let out = apply(&mut reducer, &mut state, "{not json");
        assert!(matches!(out.events[0], Event::ParseError { .. }));
    }

    #[test]
    fn test_unknown_section_ignored() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        let out = apply(&mut reducer, &mut state, r#"{"system":{"command":"ledctrl"}}"#);
        assert!(out.events.is_empty());
        assert!(out.deltas.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        let huge = vec![b' '; MAX_FRAME_BYTES + 1];
        let out = reducer.apply(&mut state, &huge, 0);
        assert!(matches!(out.events[0], Event::ParseError { .. }));
    }

    #[test]
    fn test_ht_unit_canonicalized() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        apply(
            &mut reducer,
            &mut state,
            r#"{"print":{"ams":{"ams":[{"id":"128","humidity":"10",
                "tray":[{"id":"0","tray_type":"PA","tray_color":"112233FF","tray_info_idx":"GFN04","nozzle_temp_min":"260","nozzle_temp_max":"300"}]}]}}}"#,
        );
        let unit = state.unit(128).unwrap();
        assert_eq!(unit.label, "HT-A");
        assert_eq!(unit.trays.len(), 1);
        assert_eq!(unit.trays[0].tray_type, "PA");
    }

    #[test]
    fn test_command_echo_extracted() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        let out = apply(
            &mut reducer,
            &mut state,
            r#"{"print":{"command":"ams_filament_setting","sequence_id":"33","result":"success",
                "ams_id":0,"tray_id":1,"tray_info_idx":"GFL99","tray_type":"PLA",
                "tray_color":"FF0000FF","nozzle_temp_min":190,"nozzle_temp_max":230}}"#,
        );
        let echo = out.echo.unwrap();
        assert_eq!(echo.sequence_id, 33);
        assert!(echo.success);
        // The echo also lands in the tray model
        assert_eq!(state.tray(0, 1).unwrap().tray_type, "PLA");
    }

    #[test]
    fn test_cali_catalog_replaced_per_diameter() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        state.calibrations.push(KProfile {
            cali_idx: 1,
            filament_id: "GFL99".into(),
            nozzle_diameter: "0.4".into(),
            ..Default::default()
        });
        state.calibrations.push(KProfile {
            cali_idx: 2,
            filament_id: "GFL99".into(),
            nozzle_diameter: "0.6".into(),
            ..Default::default()
        });

        apply(
            &mut reducer,
            &mut state,
            r#"{"print":{"command":"extrusion_cali_get","sequence_id":"5","result":"success",
                "nozzle_diameter":"0.4","filament_id":"",
                "filaments":[{"filament_id":"GFG00","name":"PETG Basic","k_value":"0.032","cali_idx":7}]}}"#,
        );

        assert_eq!(state.calibrations.len(), 2);
        assert!(state.calibrations.iter().any(|c| c.nozzle_diameter == "0.6"));
        assert!(state
            .calibrations
            .iter()
            .any(|c| c.filament_id == "GFG00" && c.cali_idx == 7));
    }

    #[test]
    fn test_dual_selector_normalization() {
        assert_eq!(normalize_dual_selector(0x0002, 0), Some(2));
        assert_eq!(normalize_dual_selector(0x0103, 0), Some(7));
        assert_eq!(normalize_dual_selector(0x8000, 0), Some(16));
        assert_eq!(normalize_dual_selector(0xFEFF, 1), None);
        assert_eq!(normalize_dual_selector(0xFE00, 1), Some(254));
        assert_eq!(normalize_dual_selector(0xFF00, 0), Some(255));
    }

    #[test]
    fn test_deltas_for_scalar_and_tray_change() {
        let mut reducer = Reducer::new("P1");
        let mut state = PrinterState::default();
        apply(&mut reducer, &mut state, pushall_frame());

        let out = apply(
            &mut reducer,
            &mut state,
            r#"{"print":{"gcode_state":"RUNNING","ams":{"ams":[{"id":"0",
                "tray":[{"id":"1","tray_type":"TPU","tray_color":"FFFFFFFF","tray_info_idx":"GFU01","nozzle_temp_min":"200","nozzle_temp_max":"250"}]}]}}}"#,
        );

        assert!(out.deltas.iter().any(|d| d.path == "gcode_state"));
        assert!(out.deltas.iter().any(|d| d.path == "ams.0.tray.1"));
        assert!(!out.deltas.iter().any(|d| d.path == "ams.0.tray.0"));
    }

    #[test]
    fn test_reconnect_rebuild_equals_uninterrupted_state() {
        // Feeding the same terminal frame sequence with a disconnect in the
        // middle must converge to the state of an uninterrupted session.
        let frames = [
            pushall_frame().to_string(),
            r#"{"print":{"gcode_state":"RUNNING","subtask_name":"benchy.gcode","mc_percent":12}}"#.to_string(),
            pushall_frame().to_string(),
        ];

        let mut continuous = PrinterState::default();
        let mut r1 = Reducer::new("P1");
        for frame in &frames {
            r1.apply(&mut continuous, frame.as_bytes(), 0);
        }

        let mut interrupted = PrinterState::default();
        let mut r2 = Reducer::new("P1");
        r2.apply(&mut interrupted, frames[0].as_bytes(), 0);
        r2.apply(&mut interrupted, frames[1].as_bytes(), 0);
        interrupted.mark_disconnected();
        interrupted.connected = true; // session reconnects
        r2.apply(&mut interrupted, frames[2].as_bytes(), 0);

        continuous.connected = true;
        assert_eq!(continuous, interrupted);
    }
}
