// Copyright 2021-2022 Jacob Alexander
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Kiibohd .h/.c file emitter.
//!
//! Converts the analyzed model into the C tables consumed by the Kiibohd
//! firmware plus a json report. Errors accumulate while emitting so a
//! single run can surface every problem; `check()` fails if any were seen.

use crate::emitters::{EmitError, Emitter, EmitterOptions, JsonEmitter, TextEmitter};
use crate::expression::{DataAssociation, Expression, MapExpression, PixelChanTarget};
use crate::stages::{AnimationSetting, ControlStage};
use crate::types::{
    AddrVal, AnimationModArg, AnimationModifierList, CapArg, CapId, HidClass, Identifier,
    ParamState, PixelId, ScheduleParam,
};
use log::{error, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;

/// Firmware capability each identifier class maps onto
fn required_capability(tag: &str) -> Option<&'static str> {
    match tag {
        "A" => Some("animationIndex"),
        "CONS" => Some("consCtrlOut"),
        "NONE" => Some("noneOut"),
        "SYS" => Some("sysCtrlOut"),
        "USB" => Some("usbKeyOut"),
        "Layer" | "LayerShift" => Some("layerShift"),
        "LayerLatch" => Some("layerLatch"),
        "LayerLock" => Some("layerLock"),
        _ => None,
    }
}

/// Capabilities that may be missing without failing emission
const OPTIONAL_REQUIRED: &[&str] = &["A"];

/// Optional capabilities; failing only if actually used
fn optional_capability(kind: &str) -> Option<&'static str> {
    match kind {
        "UTF8State" => Some("unicode_state"),
        "UTF8Text" => Some("unicode_text"),
        _ => None,
    }
}

/// Capabilities that are safe to run outside the interrupt handler
const SAFE_CAPABILITIES: &[&str] = &[
    // PartialMap
    "layerState",
    "layerLatch",
    "layerLock",
    "layerShift",
    "layerRotate",
    "testThreadSafe",
    // USB
    "consCtrlOut",
    "noneOut",
    "sysCtrlOut",
    "usbKeyOut",
    "mouseOut",
    "mouseWheelOut",
    "flashMode",
];

pub struct Kiibohd {
    opts: EmitterOptions,
    text: TextEmitter,
    json: JsonEmitter,
    error_exit: bool,
    use_pixel_map: bool,
    /// kll capability name -> stable index
    capabilities_index: BTreeMap<String, usize>,
    /// kll capability name -> definition
    capability_defs: BTreeMap<String, CapId>,
}

impl Kiibohd {
    pub fn new(opts: EmitterOptions) -> Self {
        Self {
            opts,
            text: TextEmitter::default(),
            json: JsonEmitter::default(),
            error_exit: false,
            use_pixel_map: false,
            capabilities_index: BTreeMap::new(),
            capability_defs: BTreeMap::new(),
        }
    }

    fn fill(&mut self, tag: &str, value: String) {
        self.text.fill_dict.insert(tag.to_string(), value);
    }

    /// Split an integer into little-endian byte-sized decimal strings;
    /// negative values take the signed two's complement form
    fn byte_split(number: i64, total_bytes: usize) -> Vec<String> {
        (0..total_bytes)
            .map(|index| format!("{}", (number >> (8 * index)) as u8))
            .collect()
    }

    /// C define name for a HID usage, mirroring the usb_hid.h output
    fn c_define(class: HidClass, name: &str) -> String {
        let prefix = match class {
            HidClass::Keyboard => "KEY",
            HidClass::Indicator => "LED",
            HidClass::System => "SYS",
            HidClass::Consumer => "CONS",
        };
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", prefix, sanitized)
    }

    fn schedule_index(control: &ControlStage, identifier: &Identifier) -> usize {
        control
            .analysis
            .schedule_index(&identifier.str_schedule())
            .unwrap_or(0)
    }

    /// Default (unspecified) schedule index
    fn default_schedule(control: &ControlStage) -> usize {
        control.analysis.schedule_index("").unwrap_or(0)
    }

    /// Convert a result combo to the C array string format:
    /// <len>, (<cap index>, <schedule>, <args...>)*
    fn result_combo_conversion(
        &mut self,
        control: &ControlStage,
        combo: Option<&[Identifier]>,
    ) -> Result<String, EmitError> {
        let usb_cap = self.capabilities_index.get("usbKeyOut").copied().unwrap_or(0);

        // A None combo is the 0-length USB release separating sequence
        // elements (needed for USB repeat behaviour)
        let Some(combo) = combo else {
            return Ok(format!("1, {}, {}, 0x00", usb_cap, Self::default_schedule(control)));
        };

        let mut output = format!("{}", combo.len());
        for identifier in combo {
            let schedule = Self::schedule_index(control, identifier);
            let cap = match identifier {
                Identifier::Hid(hid) => {
                    if !hid.known {
                        self.error_exit = true;
                        format!("/* XXX INVALID {} */", identifier)
                    } else if required_capability(hid.class.tag()).is_none() {
                        error!("Unknown identifier -> {}", identifier);
                        self.error_exit = true;
                        format!("/* XXX INVALID {} */", identifier)
                    } else {
                        let cap_index = self
                            .capabilities_index
                            .get(required_capability(hid.class.tag()).unwrap())
                            .copied()
                            .unwrap_or(0);
                        let cap_arg = if hid.width() > 1 {
                            Self::byte_split(hid.uid as i64, hid.width()).join(", ")
                        } else if hid.class == HidClass::Keyboard && hid.uid >= 0xF0 {
                            error!(
                                "'{}' Invalid USB HID code, missing FuncMap layout (e.g. stdFuncMap, lcdFuncMap)",
                                identifier
                            );
                            self.error_exit = true;
                            format!("/* XXX INVALID {} */", identifier)
                        } else {
                            match control.layouts.default_layout().name(hid.class, hid.uid) {
                                Some(name) => Self::c_define(hid.class, name),
                                None => format!("0x{:02X}", hid.uid),
                            }
                        };
                        format!("{}, {}, {}", cap_index, schedule, cap_arg)
                    }
                }
                Identifier::None => {
                    return Ok(format!("1, {}, {}, 0x00", usb_cap, schedule));
                }
                Identifier::Capability(cap) => {
                    let Some(definition) = self.capability_defs.get(&cap.name) else {
                        error!("Unknown capability '{}'", cap.name);
                        self.error_exit = true;
                        output += &format!(", /* XXX INVALID {} */", cap.name);
                        continue;
                    };
                    let values = cap.arg_values();
                    // A shape mismatch is fatal at emit time
                    if values.len() != definition.args.len() {
                        return Err(EmitError::Message(format!(
                            "incorrect number of arguments for {}. Expected {} Got {}",
                            cap,
                            definition.args.len(),
                            values.len()
                        )));
                    }
                    let mut out = format!(
                        "{}, {}",
                        self.capabilities_index.get(&cap.name).copied().unwrap_or(0),
                        schedule
                    );
                    for (value, def) in values.iter().zip(&definition.args) {
                        let width = match def {
                            CapArg::Def { width, .. } => width.unwrap_or(1),
                            CapArg::Value(_) => 1,
                        };
                        out += ", ";
                        out += &Self::byte_split(*value, width).join(", ");
                    }
                    out
                }
                Identifier::Animation(anim) => {
                    let cap_index = self
                        .capabilities_index
                        .get("animationIndex")
                        .copied()
                        .unwrap_or(0);
                    let lookup_id = format!("{}", anim);
                    let settings_index = match control
                        .analysis
                        .animation_settings_list
                        .iter()
                        .position(|s| s == &lookup_id)
                    {
                        Some(index) => index,
                        None => {
                            error!("Unknown animation '{}'", lookup_id);
                            self.error_exit = true;
                            0
                        }
                    };
                    format!(
                        "{}, {}, {}",
                        cap_index,
                        schedule,
                        Self::byte_split(settings_index as i64, anim.width()).join(", ")
                    )
                }
                Identifier::Layer(layer) => {
                    let cap_index = self
                        .capabilities_index
                        .get(required_capability(&layer.kind.to_string()).unwrap())
                        .copied()
                        .unwrap_or(0);
                    format!(
                        "{}, {}, {}",
                        cap_index,
                        schedule,
                        Self::byte_split(layer.uid as i64, layer.width()).join(", ")
                    )
                }
                Identifier::Utf8(utf8) => {
                    let cap_name = optional_capability("UTF8Text").unwrap();
                    let Some(cap_index) = self.capabilities_index.get(cap_name) else {
                        error!(
                            "Optional capability '{}' for 'UTF8Text' was used and is missing!",
                            cap_name
                        );
                        self.error_exit = true;
                        continue;
                    };
                    let string_number =
                        control.analysis.utf8_index(&utf8.text).unwrap_or(0);
                    format!(
                        "{}, {}, {}",
                        cap_index,
                        schedule,
                        Self::byte_split(string_number as i64, utf8.width()).join(", ")
                    )
                }
                other => {
                    error!("Unknown identifier -> {}", other);
                    self.error_exit = true;
                    format!("/* XXX INVALID {} */", other)
                }
            };
            output += &format!(", {}", cap);
        }
        Ok(output)
    }

    /// Convert a trigger combo to the C array string format:
    /// <len>, (<type>, <state>, <uid>)*
    fn trigger_combo_conversion(&mut self, control: &ControlStage, combo: &[Identifier]) -> String {
        let mut output = format!("{}", combo.len());
        for identifier in combo {
            let state = Self::schedule_index(control, identifier);
            let bucket = |uid: u16, names: [&'static str; 4]| -> Option<(&'static str, u16)> {
                match uid {
                    0..=255 => Some((names[0], uid)),
                    256..=511 => Some((names[1], uid - 256)),
                    512..=767 => Some((names[2], uid - 512)),
                    768..=1023 => Some((names[3], uid - 768)),
                    _ => None,
                }
            };

            let converted: Option<(String, u16)> = match identifier {
                Identifier::ScanCode(sc) => bucket(
                    sc.get_uid(),
                    [
                        "TriggerType_Switch1",
                        "TriggerType_Switch2",
                        "TriggerType_Switch3",
                        "TriggerType_Switch4",
                    ],
                )
                .map(|(t, u)| (t.to_string(), u)),
                Identifier::Layer(layer) => bucket(
                    layer.uid,
                    [
                        "TriggerType_Layer1",
                        "TriggerType_Layer2",
                        "TriggerType_Layer3",
                        "TriggerType_Layer4",
                    ],
                )
                .map(|(t, u)| (t.to_string(), u)),
                Identifier::Animation(anim) => control
                    .analysis
                    .animation_uid_lookup
                    .get(&anim.name)
                    .and_then(|uid| {
                        bucket(
                            *uid,
                            [
                                "TriggerType_Animation1",
                                "TriggerType_Animation2",
                                "TriggerType_Animation3",
                                "TriggerType_Animation4",
                            ],
                        )
                    })
                    .map(|(t, u)| (t.to_string(), u)),
                Identifier::Hid(hid) if hid.class == HidClass::Indicator => {
                    (hid.uid < 256).then(|| ("TriggerType_LED1".to_string(), hid.uid))
                }
                Identifier::Generic(trigger) => {
                    let type_name = match trigger.type_name() {
                        Some(name) => name.to_string(),
                        None => format!("{}", trigger.idcode),
                    };
                    Some((type_name, trigger.uid))
                }
                _ => None,
            };

            match converted {
                Some((trigger_type, uid)) => {
                    output += &format!(", {}, {}, 0x{:02X}", trigger_type, state, uid);
                }
                None => {
                    error!("Unknown identifier -> {}", identifier);
                    self.error_exit = true;
                    output += ", /* XXX INVALID XXX */";
                }
            }
        }
        output
    }

    /// `.state = ...`/`.analog = ...` rendering for one schedule param
    fn schedule_param_entry(
        param: &ScheduleParam,
        freq: u64,
        layer_suffix: &str,
    ) -> String {
        let mut output = String::new();
        match (&param.state, param.is_analog(), param.is_index()) {
            (Some(ParamState::Number(n)), true, _) => {
                output += &format!(".analog = {}, ", n);
            }
            (Some(ParamState::Number(n)), _, true) => {
                output += &format!(".index = {}, ", n);
            }
            (Some(_), _, _) => {
                let short = param
                    .schedule_lookup()
                    .map(|(_, short)| short)
                    .unwrap_or("Gen");
                output += &format!(".state = ScheduleType_{}{}, ", short, layer_suffix);
            }
            (None, _, _) => {
                output += &format!(".state = ScheduleType_Gen{}, ", layer_suffix);
            }
        }
        if let Some(timing) = &param.timing {
            let (ms, ticks) = timing.to_ms_ticks(freq);
            output += &format!(".time = {{ {}, {} }}, ", ms, ticks);
        }
        output
    }

    /// Layer stack name, skipping the infrastructure files
    fn stack_name(files: &[String]) -> String {
        let mut name = String::new();
        for file in files {
            if file != "capabilities.kll" && file != "scancode_map.kll" {
                name += &format!("{} + ", file);
            }
        }
        if name.is_empty() {
            "StandardLayer".to_string()
        } else {
            name.trim_end_matches(" + ").to_string()
        }
    }

    /// Pixel channel maps ordered by pixel index
    fn channel_maps(control: &ControlStage) -> Vec<(String, MapExpression)> {
        let mut maps: Vec<(String, MapExpression)> = control
            .full_context
            .organization
            .pixel_channel_data
            .data
            .iter()
            .filter_map(|(key, expr)| match expr {
                Expression::Map(map) => Some((key.clone(), map.clone())),
                _ => None,
            })
            .collect();
        maps.sort_by_key(|(_, map)| map.pixel.as_ref().and_then(|p| p.index()).unwrap_or(0));
        maps
    }

    fn animation_modifier_number(modifiers: &AnimationModifierList, name: &str) -> i64 {
        match modifiers.get_modifier(name) {
            Some(AnimationModArg::Number(n)) => *n,
            _ => 0,
        }
    }

    /// Build one Pixel_AnimationSettings[] entry
    fn animation_settings_entry(
        setting: &AnimationSetting,
        animation_name: &str,
        count: usize,
        additional: bool,
    ) -> String {
        let modifiers = &setting.modifiers;
        let has = |name: &str| modifiers.get_modifier(name).is_some();

        let a_pos = Self::animation_modifier_number(modifiers, "pos");
        let mut a_loops = Self::animation_modifier_number(modifiers, "loops");
        if has("loop") {
            a_loops = 0;
        }
        let a_framedelay = Self::animation_modifier_number(modifiers, "framedelay");

        let a_ffunc = 0;
        let a_pfunc = match modifiers.get_modifier("pfunc") {
            Some(AnimationModArg::Name(arg)) if arg == "interp" => 1,
            Some(AnimationModArg::None) | None => 0,
            Some(other) => {
                warn!("'pfunc:{}' is unsupported", other);
                0
            }
        };
        let a_replace = match modifiers.get_modifier("replace") {
            Some(AnimationModArg::Name(arg)) => match arg.as_str() {
                "stack" => 0,
                "basic" => 1,
                "all" => 2,
                "state" => 3,
                "clear" => 4,
                "clearactive" => 5,
                other => {
                    warn!("'replace:{}' is unsupported", other);
                    0
                }
            },
            _ => 0,
        };

        let mut a_frameoption = "PixelFrameOption_None".to_string();
        if has("framestretch") {
            a_frameoption = "PixelFrameOption_FrameStretch".to_string();
        }

        // Play state defaults to Paused when nothing was requested
        let mut a_state = if has("pause") {
            "AnimationPlayState_Pause".to_string()
        } else if has("stop") {
            "AnimationPlayState_Stop".to_string()
        } else if has("single") {
            "AnimationPlayState_Single".to_string()
        } else if has("start") {
            "AnimationPlayState_Start".to_string()
        } else {
            "AnimationPlayState_Pause".to_string()
        };

        let a_initial = if additional { 0 } else { 1 };
        if a_initial == 1 && has("start") {
            a_state += " | AnimationPlayState_AutoStart";
        }

        format!(
            "\n\t{{ (TriggerMacro*){}, {}, /*{} {}({})*/\n\t\t{}, {}, {}, {}, {}, {}, {}, {}, {}}},",
            a_initial,
            animation_name,
            count,
            setting.name,
            modifiers,
            a_pos,
            0, // subpos
            a_loops,
            a_framedelay,
            a_frameoption,
            a_ffunc,
            a_pfunc,
            a_replace,
            a_state,
        )
    }

    /// 8-bit gamma correction table
    fn generate_gamma_table(gamma: f64) -> Vec<u8> {
        (0..=255u32)
            .map(|i| ((i as f64 / 255.0).powf(gamma) * 255.0).round() as u8)
            .collect()
    }

    fn check_file(&self, path: &std::path::Path) {
        if !path.is_file() {
            error!("Did not generate: {}", path.display());
        }
    }
}

impl Emitter for Kiibohd {
    fn process(&mut self, control: &ControlStage) -> Result<(), EmitError> {
        let analysis = &control.analysis;

        // -- Capability table, sorted by target C function name --
        let mut capabilities_json = serde_json::Map::new();
        let mut capability_items: Vec<(String, CapId)> = control
            .full_context
            .organization
            .capability_data
            .data
            .iter()
            .filter_map(|(key, expr)| match expr {
                Expression::NameAssociation(assoc) => assoc
                    .capability()
                    .map(|cap| (key.clone(), cap.clone())),
                _ => None,
            })
            .collect();
        capability_items.sort_by(|a, b| a.1.name.cmp(&b.1.name));

        let mut capabilities_list = "const Capability CapabilitiesList[] = {\n".to_string();
        let mut capabilities_decl = String::new();
        let mut capabilities_indices = "typedef enum CapabilityIndex {\n".to_string();
        for (count, (key, cap)) in capability_items.iter().enumerate() {
            let func_name = &cap.name;
            let features = if SAFE_CAPABILITIES.contains(&key.as_str()) {
                "CapabilityFeature_Safe"
            } else {
                "CapabilityFeature_None"
            };
            capabilities_list += &format!(
                "\t/* {} {} */\n\t{{ {}, {}, {} }},\n",
                count,
                key,
                func_name,
                cap.declared_arg_bytes(),
                features
            );
            capabilities_decl += &format!(
                "void {}( TriggerMacro *trigger, uint8_t state, uint8_t stateType, uint8_t *args );\n",
                func_name
            );
            capabilities_indices += &format!("\t{}_index,\n", func_name);

            let args: Vec<serde_json::Value> = cap
                .args
                .iter()
                .filter_map(|arg| match arg {
                    CapArg::Def { name, width } => {
                        Some(json!({ "name": name, "width": width }))
                    }
                    CapArg::Value(_) => None,
                })
                .collect();
            capabilities_json.insert(
                key.clone(),
                json!({
                    "name": func_name,
                    "index": count,
                    "args_count": args.len(),
                    "args": args,
                    "features": features,
                }),
            );

            self.capabilities_index.insert(key.clone(), count);
            self.capability_defs.insert(key.clone(), cap.clone());
        }
        capabilities_list += "};";
        capabilities_indices += "} CapabilityIndex;";
        self.fill("CapabilitiesList", capabilities_list);
        self.fill("CapabilitiesFuncDecl", capabilities_decl);
        self.fill("CapabilitiesIndices", capabilities_indices);

        // Validate the required capability set
        for tag in [
            "A", "CONS", "NONE", "SYS", "USB", "Layer", "LayerShift", "LayerLatch", "LayerLock",
        ] {
            let name = required_capability(tag).unwrap();
            if !self.capabilities_index.contains_key(name) && !OPTIONAL_REQUIRED.contains(&tag) {
                error!("Required capability '{}' for '{}' is missing!", name, tag);
                self.error_exit = true;
            }
        }

        // -- Information banner --
        let mut information =
            "// This file was generated by the kll compiler, DO NOT EDIT.\n".to_string();
        information += &format!("// KLL Emitter:        {}\n", control.opts.emitter);
        information += &format!("// KLL Version:        {}\n", control.version);
        for (role, heading) in [
            ("ConfigurationContext", "- Configuration File -"),
            ("GenericContext", "- Generic Files -"),
            ("BaseMapContext", "- Base Layer -"),
            ("DefaultMapContext", "- Default Layer -"),
        ] {
            information += &format!("// {}\n", heading);
            if let Some(context) = control.organized.get(role) {
                for file in context.files() {
                    information += &format!("//    {}\n", file);
                }
            }
        }
        information += "// - Partial Layers -\n";
        for (name, context) in &control.organized {
            if name.starts_with("PartialMapContext") {
                information += &format!("//    Layer {}\n", context.layer.unwrap_or(0) + 1);
                for file in context.files() {
                    information += &format!("//     {}\n", file);
                }
            }
        }
        self.fill("Information", information);

        // -- Defines --
        let mut defines = String::new();
        let mut defines_json = serde_json::Map::new();
        for (dkey, expr) in &control.full_context.organization.define_data.data {
            let Expression::NameAssociation(assoc) = expr else { continue };
            let crate::expression::NameAssoc::Define(c_name) = &assoc.association else {
                continue;
            };
            match control.variable_str(dkey) {
                Some(value) => {
                    let value = value.replace('\n', " \\\n");
                    defines += &format!("\n#define {} {}", c_name, value);
                    defines_json.insert(dkey.clone(), json!({ "name": c_name, "value": value }));
                }
                None => warn!("'{}' not defined...", dkey),
            }
        }
        self.fill("Defines", defines);

        // -- Schedules --
        let cpu_freq = control
            .variable_str("CPU_Frequency")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or_else(|| {
                warn!("'CPU_Frequency' should be set, and should be the same value as F_CPU");
                0
            });

        let mut schedule_params = String::new();
        let mut schedules = "const ScheduleLookup ScheduleLookupTable = {\n".to_string();
        schedules += &format!("\t.count = {},\n", analysis.schedule_list.len());
        schedules += "\t.schedule = {\n";
        for (index, (key, entry)) in analysis.schedule_list.iter().enumerate() {
            let layer_suffix = entry
                .layer_kind
                .map(|kind| kind.schedule_type())
                .unwrap_or("");
            schedule_params += &format!("const ScheduleParam schedule{}_elems[] = {{ ", index);
            let count = match &entry.params {
                Some(params) => {
                    for param in params {
                        schedule_params += &format!(
                            "{{ {}}}, ",
                            Self::schedule_param_entry(param, cpu_freq, layer_suffix)
                        );
                    }
                    params.len()
                }
                None => {
                    schedule_params +=
                        &format!("{{ .state = ScheduleType_Gen{}, }}, ", layer_suffix);
                    1
                }
            };
            schedule_params += "};\n";
            schedules += &format!(
                "\t\t{{ (ScheduleParam*)schedule{}_elems, {} }}, // {}\n",
                index,
                count,
                if key.is_empty() { "Generic" } else { key }
            );
        }
        schedules += "\t}\n};";
        self.fill("StateScheduleParams", schedule_params);
        self.fill("StateSchedules", schedules);

        // -- Result macros --
        let mut result_macros = String::new();
        for (index, result) in analysis.result_index.iter().enumerate() {
            result_macros += &format!("Guide_RM( {} ) = {{ ", index);
            for (seq_index, sequence) in result.results.iter().enumerate() {
                // Spacer between sequences, needed for USB behaviour,
                // otherwise repeated keys will not work
                if seq_index > 0 {
                    result_macros +=
                        &format!("{}, ", self.result_combo_conversion(control, None)?);
                }
                for combo in sequence {
                    result_macros += &format!(
                        "{}, ",
                        self.result_combo_conversion(control, Some(combo))?
                    );
                }
            }
            // Bare sequences terminate with a USB release pseudo-combo
            if result.results.first().map(|s| s.len()).unwrap_or(0) > 1 {
                result_macros += &format!("{}, ", self.result_combo_conversion(control, None)?);
            }
            result_macros += &format!("0 }}; // {}\n", result.result_str());
        }
        self.fill("ResultMacros", result_macros.trim_end().to_string());

        let mut result_macro_list = "const ResultMacro ResultMacroList[] = {\n".to_string();
        for (index, result) in analysis.result_index.iter().enumerate() {
            result_macro_list +=
                &format!("\tDefine_RM( {} ), // {}\n", index, result.result_str());
        }
        result_macro_list += "};";
        self.fill("ResultMacroList", result_macro_list);

        // -- Trigger macros --
        let mut trigger_macros = String::new();
        for (index, trigger) in analysis.trigger_index_reduced.iter().enumerate() {
            trigger_macros += &format!("Guide_TM( {} ) = {{ ", index);
            for sequence in &trigger.triggers {
                for combo in sequence {
                    trigger_macros +=
                        &format!("{}, ", self.trigger_combo_conversion(control, combo));
                }
            }
            trigger_macros += &format!("0 }}; // {}\n", trigger.trigger_str());
        }
        self.fill("TriggerMacros", trigger_macros.trim_end().to_string());

        let mut trigger_macro_list = "const TriggerMacro TriggerMacroList[] = {\n".to_string();
        for (index, trigger) in analysis.trigger_index.iter().enumerate() {
            let macro_type = if trigger.is_isolated() {
                "TriggerMacroType_Isolated"
            } else {
                "TriggerMacroType_Default"
            };
            let reduced_index = analysis
                .trigger_index_reduced_lookup
                .get(&trigger.sort_trigger())
                .copied()
                .unwrap_or(0);
            let result_index = analysis
                .result_index_lookup
                .get(&trigger.sort_result())
                .copied()
                .unwrap_or(0);
            trigger_macro_list += &format!(
                "\t/* {} */ Define_TM( {}, {}, {} ), // {}\n",
                index, reduced_index, result_index, macro_type, trigger
            );
        }
        trigger_macro_list += "};";
        self.fill("TriggerMacroList", trigger_macro_list);
        self.fill(
            "TriggerMacroRecord",
            "TriggerMacroRecord TriggerMacroRecordList[ TriggerMacroNum ];".to_string(),
        );

        // -- Scan code bounds and interconnect offsets --
        let overall_max = analysis.max_scan_code.iter().copied().max().unwrap_or(0);
        self.fill("MaxScanCode", format!("#define MaxScanCode 0x{:X}", overall_max));

        let mut offsets = "const uint8_t InterconnectOffsetList[] = {\n".to_string();
        for offset in &control.interconnect_scancode_offsets {
            offsets += &format!("\t0x{:02X},\n", offset);
        }
        offsets += "};";
        self.fill("ScanCodeInterconnectOffsetList", offsets);
        self.fill(
            "InterconnectNodeMax",
            format!(
                "#define InterconnectNodeMax 0x{:X}\n",
                control.interconnect_scancode_offsets.len()
            ),
        );

        // -- Default layer trigger lists and scan map --
        let mut default_trigger_list = String::new();
        let mut default_scan_map = "const nat_ptr_t *default_scanMap[] = { \n".to_string();
        if let Some(layer0) = analysis.trigger_lists.first() {
            let min0 = analysis.min_scan_code.first().copied().unwrap_or(0) as usize;
            for (index, trigger_list) in layer0.iter().skip(min0).enumerate() {
                let len = trigger_list.as_ref().map(|l| l.len()).unwrap_or(0);
                default_trigger_list +=
                    &format!("Define_TL( default, 0x{:02X} ) = {{ {}", index, len);
                default_scan_map += &format!("default_tl_0x{:02X}, ", index);
                if let Some(list) = trigger_list {
                    for trigger_code in list {
                        default_trigger_list += &format!(", {}", trigger_code);
                    }
                }
                default_trigger_list += " };\n";
            }
        }
        self.fill(
            "DefaultLayerTriggerList",
            default_trigger_list.trim_end().to_string(),
        );
        let default_scan_map = default_scan_map.trim_end_matches(", ").to_string();
        self.fill("DefaultLayerScanMap", default_scan_map + "\n};");

        // -- Partial layer trigger lists and scan maps --
        let mut partial_trigger_lists = String::new();
        let mut partial_scan_maps = String::new();
        for (lay_index, layer) in analysis.trigger_lists.iter().enumerate().skip(1) {
            partial_scan_maps += &format!("// Partial Layer {}\n", lay_index);
            partial_scan_maps += &format!("const nat_ptr_t *layer{}_scanMap[] = {{ \n", lay_index);
            partial_trigger_lists += &format!("// Partial Layer {}\n", lay_index);

            let min = analysis.min_scan_code[lay_index] as usize;
            let max = analysis.max_scan_code[lay_index] as usize;
            for (trig_index, trigger_list) in
                layer.iter().take(max + 1).skip(min).enumerate()
            {
                partial_trigger_lists +=
                    &format!("Define_TL( layer{}, 0x{:02X} ) = {{", lay_index, trig_index);
                match trigger_list {
                    Some(list) => {
                        partial_trigger_lists += &format!(" {}", list.len());
                        for trigger_code in list {
                            partial_trigger_lists += &format!(", {}", trigger_code);
                        }
                    }
                    None => partial_trigger_lists += " 0",
                }
                partial_trigger_lists += " };\n";
                partial_scan_maps += &format!("layer{}_tl_0x{:02X}, ", lay_index, trig_index);
            }
            partial_trigger_lists += "\n";
            partial_scan_maps = partial_scan_maps.trim_end_matches(", ").to_string();
            partial_scan_maps += "\n};\n\n";
        }
        self.fill(
            "PartialLayerTriggerLists",
            partial_trigger_lists.trim_end().to_string(),
        );
        self.fill(
            "PartialLayerScanMaps",
            partial_scan_maps.trim_end().to_string(),
        );

        // -- Layer index --
        let mut layer_index = "const Layer LayerIndex[] = {\n".to_string();
        for (layer, context) in analysis.reduced_contexts.iter().enumerate() {
            let stack_name = Self::stack_name(context.files());
            if layer == 0 {
                layer_index += &format!(
                    "\tLayer_IN( default_scanMap, \"D: {}\", 0x{:02X} ),\n",
                    stack_name, analysis.min_scan_code[layer]
                );
            } else {
                layer_index += &format!(
                    "\tLayer_IN( layer{}_scanMap, \"{}: {}\", 0x{:02X} ),\n",
                    layer, layer, stack_name, analysis.min_scan_code[layer]
                );
            }
        }
        layer_index += "};";
        self.fill("LayerIndexList", layer_index);
        self.fill(
            "LayerState",
            "LayerStateType LayerState[ LayerNum ];".to_string(),
        );

        // -- Rotation parameters --
        let max_rotations = analysis.rotation_map.keys().copied().max().unwrap_or(0);
        let mut rotations = "const uint8_t Rotation_MaxParameter[] = {\n".to_string();
        let mut cur_rotation = 0;
        for (key, entry) in &analysis.rotation_map {
            while cur_rotation != *key {
                rotations += &format!("\t{}, // {}\n", 0, cur_rotation);
                cur_rotation += 1;
            }
            rotations += &format!("\t{}, // {}\n", entry, key);
            cur_rotation += 1;
        }
        rotations += "};";
        self.fill("RotationParameters", rotations);

        // -- Key physical positions --
        let mut key_positions = "const Position Key_Positions[] = {\n".to_string();
        for expr in control
            .full_context
            .organization
            .scan_code_position_data
            .data
            .values()
        {
            let Expression::DataAssociation(data) = expr else { continue };
            let DataAssociation::ScanCodePosition { scancodes } = &data.association else {
                continue;
            };
            for scancode in scancodes {
                let pos = &scancode.position;
                key_positions += &format!(
                    "\tPositionEntry( {}, {}, {}, {}, {}, {} ), // {}\n",
                    pos.x.unwrap_or(0.0),
                    pos.y.unwrap_or(0.0),
                    pos.z.unwrap_or(0.0),
                    pos.rx.unwrap_or(0.0),
                    pos.ry.unwrap_or(0.0),
                    pos.rz.unwrap_or(0.0),
                    scancode,
                );
            }
        }
        key_positions += "};";
        self.fill("KeyPositions", key_positions);

        // -- UTF-8 strings --
        let mut utf8_data = "const char* UTF8_Strings[] = {\n".to_string();
        for text in &analysis.utf8_strings {
            utf8_data += &format!("\t\"{}\",\n", text.escape_default());
        }
        utf8_data += "};";
        self.fill("UTF8Data", utf8_data);

        // -- Pixel buffers, maps and animations --
        let defines_store = &control.full_context.organization.define_data.data;
        self.use_pixel_map = defines_store.contains_key("Pixel_Buffer_Size");
        let mut animation_list = String::new();
        let mut animation_id_json = serde_json::Map::new();
        let mut animation_settings_json = serde_json::Map::new();
        let mut animation_settings_index_json: Vec<serde_json::Value> = vec![];
        let mut pixel_id_json: BTreeMap<usize, serde_json::Map<String, serde_json::Value>> =
            BTreeMap::new();
        let mut scancode_json: BTreeMap<u16, serde_json::Map<String, serde_json::Value>> =
            BTreeMap::new();

        for (uid, entry) in &analysis.pixel_positions {
            let mut object = serde_json::Map::new();
            object.insert("x".to_string(), json!(entry.x));
            object.insert("y".to_string(), json!(entry.y));
            object.insert("z".to_string(), json!(entry.z));
            if let Some(scancode) = entry.scancode {
                object.insert("ScanCode".to_string(), json!(scancode));
            }
            pixel_id_json.insert(*uid, object);
        }
        for (uid, entry) in &analysis.scancode_positions {
            let mut object = serde_json::Map::new();
            object.insert("x".to_string(), json!(entry.x));
            object.insert("y".to_string(), json!(entry.y));
            object.insert("z".to_string(), json!(entry.z));
            if let Some(pixel) = entry.pixel {
                object.insert("PixelId".to_string(), json!(pixel));
            }
            scancode_json.insert(*uid, object);
        }

        let mut bufsize = 0;
        let mut totalchannels = String::new();
        let mut totalpixels = 0;
        let mut max_pixel_to_scancode = 0;
        if self.use_pixel_map {
            // Pixel buffers
            let buffer_length = control.variable_list("Pixel_Buffer_Length").unwrap_or_default();
            let buffer_width = control.variable_list("Pixel_Buffer_Width").unwrap_or_default();
            let buffer_size = control.variable_list("Pixel_Buffer_Size").unwrap_or_default();
            let buffer_buffer = control.variable_list("Pixel_Buffer_Buffer").unwrap_or_default();
            bufsize = buffer_size.len();

            let mut buffer_setup = "PixelBuf Pixel_Buffers[] = {\n".to_string();
            for index in 0..bufsize {
                buffer_setup += &format!(
                    "\tPixelBufElem( {}, {}, {}, {} ),\n",
                    buffer_length.get(index).cloned().unwrap_or_default(),
                    buffer_width.get(index).cloned().unwrap_or_default(),
                    buffer_size.get(index).cloned().unwrap_or_default(),
                    buffer_buffer.get(index).cloned().unwrap_or_default(),
                );
            }
            buffer_setup += "};";
            if bufsize > 0 {
                totalchannels = format!(
                    "{} + {}",
                    buffer_length[bufsize - 1],
                    buffer_size[bufsize - 1]
                );
            }

            // LED buffers and fade profiles
            let mut fade_config = String::new();
            if let Some(led_size) = control.variable_list("LED_Buffer_Size") {
                let led_length = control.variable_list("LED_Buffer_Length").unwrap_or_default();
                let led_width = control.variable_list("LED_Buffer_Width").unwrap_or_default();
                let led_buffer = control.variable_list("LED_Buffer_Buffer").unwrap_or_default();
                buffer_setup += "\nPixelBuf LED_Buffers[] = {\n";
                for index in 0..led_size.len() {
                    buffer_setup += &format!(
                        "\tPixelBufElem( {}, {}, {}, {} ),\n",
                        led_length.get(index).cloned().unwrap_or_default(),
                        led_width.get(index).cloned().unwrap_or_default(),
                        led_size.get(index).cloned().unwrap_or_default(),
                        led_buffer.get(index).cloned().unwrap_or_default(),
                    );
                }
                buffer_setup += "};";
                totalchannels = format!(
                    "{} + {}",
                    led_length.last().cloned().unwrap_or_default(),
                    led_size.last().cloned().unwrap_or_default()
                );

                // Fade groups
                let fade_groups = control.variable_list("KLL_LED_FadeGroup").unwrap_or_default();
                for (index, data) in fade_groups.iter().enumerate() {
                    fade_config += &format!(
                        "const uint16_t Pixel_LED_DefaultFadeGroup{}[] = {{\n",
                        index
                    );
                    if !data.is_empty() {
                        fade_config += &format!("\t{}\n", data);
                    }
                    fade_config += "};\n";
                }
                fade_config += "const PixelLEDGroupEntry Pixel_LED_DefaultFadeGroups[] = {\n";
                for (index, data) in fade_groups.iter().enumerate() {
                    let count = if data.is_empty() {
                        0
                    } else {
                        data.split(',').count()
                    };
                    fade_config += &format!(
                        "\t{{ {}, Pixel_LED_DefaultFadeGroup{} }},\n",
                        count, index
                    );
                }
                fade_config += "};\n";

                // Fade periods
                fade_config += "const PixelPeriodConfig Pixel_LED_FadePeriods[16] = {\n";
                for (index, period) in control
                    .variable_list("KLL_LED_FadePeriod")
                    .unwrap_or_default()
                    .iter()
                    .enumerate()
                {
                    fade_config += &format!("\t{}, // {}\n", period, index);
                }
                fade_config += "};\n";

                // Profile brightnesses
                fade_config += "const uint8_t Pixel_LED_FadeBrightness[4] = {\n";
                for (index, brightness) in control
                    .variable_list("KLL_LED_FadeBrightness")
                    .unwrap_or_default()
                    .iter()
                    .enumerate()
                {
                    fade_config += &format!("\t{}, // {}\n", brightness, index);
                }
                fade_config += "};\n";

                fade_config += "const uint8_t Pixel_LED_FadePeriod_Defaults[4][4] = {\n";
                for name in [
                    "KLL_LED_FadeDefaultConfig0",
                    "KLL_LED_FadeDefaultConfig1",
                    "KLL_LED_FadeDefaultConfig2",
                    "KLL_LED_FadeDefaultConfig3",
                ] {
                    fade_config += "\t{ ";
                    for value in control.variable_list(name).unwrap_or_default() {
                        fade_config += &format!("{}, ", value);
                    }
                    fade_config += &format!("}}, // {}\n", name);
                }
                fade_config += "};";
            }
            self.fill("PixelBufferSetup", buffer_setup);
            self.fill("PixelFadeConfig", fade_config);

            // Pixel mapping, indexed by pixel uid with blanks for holes
            let channel_maps = Self::channel_maps(control);
            let mut pixel_mapping = "const PixelElement Pixel_Mapping[] = {\n".to_string();
            let mut last_uid = 0;
            for (key, map) in &channel_maps {
                let Some(pixel) = &map.pixel else { continue };
                let Some(index) = pixel.index() else { continue };
                last_uid += 1;
                while last_uid != index {
                    pixel_mapping += &format!("\tPixel_Blank(), // {}\n", last_uid);
                    last_uid += 1;
                }
                let width = pixel.channels.channels.first().map(|c| c.width).unwrap_or(0);
                let channels = pixel.channels.channels.len();
                pixel_mapping += &format!("\t{{ {}, {}, {{", width, channels);
                for (ch, channel) in pixel.channels.channels.iter().enumerate() {
                    if ch != 0 {
                        pixel_mapping += ",";
                    }
                    pixel_mapping += &format!("{}", channel.uid);
                }
                pixel_mapping += &format!("}} }}, // {}\n", key);
            }
            totalpixels = last_uid;
            pixel_mapping += "};";
            self.fill("PixelMapping", pixel_mapping);

            // Scan code to pixel / display cell
            let columns = analysis.pixel_display_params.columns;
            let mut scancode_maps: Vec<(u16, usize, &String)> = channel_maps
                .iter()
                .filter_map(|(key, map)| match (&map.pixel, &map.pixel_target) {
                    (Some(pixel), Some(PixelChanTarget::Scan(sc))) => {
                        pixel.index().map(|index| (sc.uid, index, key))
                    }
                    _ => None,
                })
                .collect();
            scancode_maps.sort_by_key(|(scancode, _, _)| *scancode);

            let mut to_pixel = "const uint16_t Pixel_ScanCodeToPixel[] = {\n".to_string();
            let mut to_display = "const uint16_t Pixel_ScanCodeToDisplay[] = {\n".to_string();
            let mut last_scancode = 0;
            for (scancode, pixel_index, key) in scancode_maps {
                last_scancode += 1;
                while scancode != last_scancode && scancode >= last_scancode {
                    to_pixel += &format!("\t/*{}*/ 0,\n", last_scancode);
                    to_display += &format!("\t/*__,__ {}*/ 0,\n", last_scancode);
                    last_scancode += 1;
                }
                to_pixel += &format!("\t/*{}*/ {}, // {}\n", last_scancode, pixel_index, key);

                // Display grid offset of this pixel
                let mut offset = 0;
                let mut offset_row = 0;
                let mut offset_col = 0;
                'search: for (row, row_list) in
                    analysis.pixel_display_mapping.iter().enumerate()
                {
                    for (col, cell) in row_list.iter().enumerate() {
                        if *cell == pixel_index {
                            offset = row * columns + col;
                            offset_row = row;
                            offset_col = col;
                            break 'search;
                        }
                    }
                }
                to_display += &format!(
                    "\t/*{: >2},{: >2} {}*/ {}, // {}\n",
                    offset_col, offset_row, last_scancode, offset, key
                );

                // Mirror row/col into the json report
                if let Some(object) = pixel_id_json.get_mut(&pixel_index) {
                    object.insert("Row".to_string(), json!(offset_row));
                    object.insert("Col".to_string(), json!(offset_col));
                }
                if let Some(object) = scancode_json.get_mut(&scancode) {
                    object.insert("Row".to_string(), json!(offset_row));
                    object.insert("Col".to_string(), json!(offset_col));
                }
            }
            max_pixel_to_scancode = last_scancode;
            to_pixel += "};";
            to_display += "};";
            self.fill("ScanCodeToPixelMapping", to_pixel);
            self.fill("ScanCodeToDisplayMapping", to_display);

            // Display grid, flattened row-major
            let mut display_mapping = "const uint16_t Pixel_DisplayMapping[] = {\n".to_string();
            for row in &analysis.pixel_display_mapping {
                display_mapping += &row
                    .iter()
                    .map(|cell| format!("{: >3}", cell))
                    .collect::<Vec<_>>()
                    .join(",");
                display_mapping += ",\n";
            }
            display_mapping += "};";
            self.fill("PixelDisplayMapping", display_mapping);

            // Gamma correction
            let gamma = control
                .variable_str("LEDGamma")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .unwrap_or(1.0);
            let gamma_table = Self::generate_gamma_table(gamma)
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.fill(
                "GammaTable",
                format!("const uint8_t gamma_table[] = {{\n{}\n}};", gamma_table),
            );

            // Animations
            let mut animations = "const uint8_t **Pixel_Animations[] = {".to_string();
            let mut animation_settings =
                "const AnimationStackElement Pixel_AnimationSettings[] = {".to_string();
            let mut count = 0;
            for (key, expr) in &control.full_context.organization.animation_data.data {
                let Expression::DataAssociation(data) = expr else { continue };
                let DataAssociation::Animation {
                    animation,
                    modifiers,
                } = &data.association
                else {
                    continue;
                };
                let uid = analysis
                    .animation_uid_lookup
                    .get(&animation.name)
                    .copied()
                    .unwrap_or(0);
                animations += &format!("\n\t/*{}*/ {}_frames,", uid, animation.name);
                let animation_name = format!("Animation__{}", animation.name);
                animation_list += &format!("\n#define {} {}", animation_name, uid);
                animation_id_json.insert(animation.name.clone(), json!(uid));
                animation_settings_index_json.push(json!({
                    "name": animation.name,
                    "modifiers": format!("{}", modifiers),
                    "setting": key,
                }));
                animation_settings += &Self::animation_settings_entry(
                    &AnimationSetting {
                        name: animation.name.clone(),
                        modifiers: modifiers.clone(),
                    },
                    &animation_name,
                    uid as usize,
                    false,
                );
                count += 1;
            }
            animations += "\n};";

            // Per-reference setting variants
            animation_settings += "\n\n\t/* Additional Settings */\n";
            while count < analysis.animation_settings_list.len() {
                let str_name = &analysis.animation_settings_list[count];
                let Some(setting) = analysis.animation_settings.get(str_name) else {
                    count += 1;
                    continue;
                };
                let animation_name = format!("Animation__{}", setting.name);
                if let Some(orig) = analysis.animation_settings_orig.get(str_name) {
                    animation_settings_json.insert(orig.clone(), json!(count));
                }
                animation_settings_index_json.push(json!({
                    "name": setting.name,
                    "modifiers": format!("{}", setting.modifiers),
                    "setting": str_name,
                }));
                animation_settings += &Self::animation_settings_entry(
                    setting,
                    &animation_name,
                    count,
                    true,
                );
                count += 1;
            }
            animation_settings += "\n};";
            self.fill("Animations", animations);
            self.fill("AnimationSettings", animation_settings);

            // Animation frames
            let mut frames = String::new();
            let mut frame_items: Vec<(String, usize, Vec<PixelId>, String)> = vec![];
            for expr in control
                .full_context
                .organization
                .animation_frame_data
                .data
                .values()
            {
                let Expression::DataAssociation(data) = expr else { continue };
                let DataAssociation::AnimationFrame {
                    frames: frame_ids,
                    pixels,
                } = &data.association
                else {
                    continue;
                };
                for frame in frame_ids {
                    frame_items.push((
                        frame.name.clone(),
                        frame.index,
                        pixels.clone(),
                        format!("{}", data),
                    ));
                }
            }
            frame_items.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));

            let columns = analysis.pixel_display_params.columns;
            let rows = analysis.pixel_display_params.rows;
            let mut prev_name = String::new();
            let mut prev_frame = 0usize;
            for (name, index, pixels, comment) in &frame_items {
                // Close the previous frame set
                if !prev_name.is_empty() && *name != prev_name {
                    frames += &Self::frameset(&prev_name, prev_frame);
                    prev_frame = 0;
                }
                // Stub out missing frame indices
                while *index > prev_frame + 1 {
                    prev_frame += 1;
                    frames += &format!(
                        "const uint8_t {}_frame{}[] = {{ PixelAddressType_End }};\n\n",
                        name, prev_frame
                    );
                }
                prev_name = name.clone();

                frames += &format!("// {}", comment);
                frames += &format!("\nconst uint8_t {}_frame{}[] = {{", name, index);
                for pixel in pixels {
                    frames += &format!("\n\t{},", pixel.address_type().c_name());

                    let channels = match &pixel.uid {
                        crate::types::PixelUid::Address(addr) => addr.uid_set(),
                        crate::types::PixelUid::Scan(sc) => {
                            vec![Some(AddrVal::Num(sc.get_uid() as i32))]
                        }
                        crate::types::PixelUid::Hid(hid) => {
                            vec![Some(AddrVal::Num(hid.uid as i32))]
                        }
                    };
                    if channels.len() == 1 {
                        let value = match channels[0] {
                            Some(AddrVal::Num(n)) => n as i64,
                            Some(AddrVal::Percent(_)) | None => 0,
                        };
                        frames += &format!(
                            " /*{}*/{},",
                            value,
                            Self::byte_split(value, 4).join(",")
                        );
                    } else {
                        for (ch_index, channel) in channels.iter().enumerate() {
                            let value = match channel {
                                // Percentages scale into the display grid
                                Some(AddrVal::Percent(p)) => {
                                    let limit = if ch_index == 0 {
                                        columns.saturating_sub(1)
                                    } else {
                                        rows.saturating_sub(1)
                                    };
                                    (limit as f32 * p).round() as i64
                                }
                                Some(AddrVal::Num(n)) => *n as i64,
                                None => 0,
                            };
                            frames += &format!(
                                " /*{}*/{},",
                                value,
                                Self::byte_split(value, 2).join(",")
                            );
                        }
                    }

                    for modifier in &pixel.modifiers.modifiers {
                        frames += &format!(
                            " PixelChange_{}, {},",
                            modifier.operator_type(),
                            modifier.value
                        );
                    }
                }
                frames += "\n\tPixelAddressType_End\n};\n\n";
                prev_frame = *index;
            }
            if !prev_name.is_empty() {
                frames += &Self::frameset(&prev_name, prev_frame);
            }
            self.fill("AnimationFrames", frames);
        }
        self.fill("AnimationList", animation_list);

        // LED buffer struct passthrough
        self.fill(
            "LEDBufferStruct",
            control.variable_str("LED_BufferStruct").unwrap_or_default(),
        );

        // -- KLL defines --
        let mut kll_defines = String::new();
        kll_defines += &format!(
            "#define CapabilitiesNum_KLL {}\n",
            self.capabilities_index.len()
        );
        kll_defines += &format!("#define LayerNum_KLL {}\n", analysis.reduced_contexts.len());
        kll_defines += &format!("#define ResultMacroNum_KLL {}\n", analysis.result_index.len());
        kll_defines += &format!(
            "#define TriggerMacroNum_KLL {}\n",
            analysis.trigger_index.len()
        );
        kll_defines += &format!("#define MaxScanCode_KLL {}\n", overall_max);
        let max_rotation_num = if analysis.rotation_map.is_empty() {
            0
        } else {
            max_rotations
        };
        kll_defines += &format!("#define RotationNum_KLL {}\n", max_rotation_num);
        kll_defines += &format!(
            "#define UTF8StringsNum_KLL {}\n",
            analysis.utf8_strings.len()
        );
        kll_defines += &format!("#define ScheduleNum_KLL {}\n", analysis.schedule_list.len());
        if self.use_pixel_map {
            kll_defines += &format!("#define Pixel_BuffersLen_KLL {}\n", bufsize);
            kll_defines += &format!("#define Pixel_TotalChannels_KLL {}\n", totalchannels);
            kll_defines += &format!("#define Pixel_TotalPixels_KLL {}\n", totalpixels);
            kll_defines += &format!(
                "#define Pixel_DisplayMapping_Cols_KLL {}\n",
                analysis.pixel_display_params.columns
            );
            kll_defines += &format!(
                "#define Pixel_DisplayMapping_Rows_KLL {}\n",
                analysis.pixel_display_params.rows
            );
            kll_defines += &format!(
                "#define Pixel_AnimationSettingsNum_KLL {}\n",
                analysis.animation_settings_list.len()
            );
            kll_defines += &format!(
                "#define AnimationNum_KLL {}\n",
                analysis.animation_uid_lookup.len()
            );
            kll_defines += &format!("#define MaxPixelToScanCode_KLL {}\n", max_pixel_to_scancode);
        } else {
            kll_defines += "#define AnimationNum_KLL 0\n";
        }
        self.fill("KLLDefines", kll_defines);

        // The state word bounds the trigger index only
        if let Some(word_size) = control
            .variable_str("stateWordSize")
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            let limit = 2usize.pow(word_size);
            if analysis.trigger_index.len() > limit {
                error!(
                    "'stateWordSize = {}' is not large enough! {} > {}",
                    word_size,
                    analysis.trigger_index.len(),
                    limit
                );
                self.error_exit = true;
            }
        }

        // -- USB HID lookup defines --
        let layout = control.layouts.default_layout();
        for (tag, class) in [
            ("USBCDefineKeyboardMapping", HidClass::Keyboard),
            ("USBCDefineLEDMapping", HidClass::Indicator),
            ("USBCDefineSystemControlMapping", HidClass::System),
            ("USBCDefineConsumerControlMapping", HidClass::Consumer),
        ] {
            let mut out = String::new();
            for (uid, name) in layout.reverse_table(class) {
                out += &format!("#define {} 0x{:02X}\n", Self::c_define(class, name), uid);
            }
            self.fill(tag, out);
        }

        // -- Layers json --
        let mut layers_json = serde_json::Map::new();
        for (layer, context) in analysis.reduced_contexts.iter().enumerate() {
            let mut layer_info = serde_json::Map::new();
            for (key, exprs) in &context.organization.mapping_data.data {
                if let Some(first) = exprs.first() {
                    layer_info.insert(
                        key.clone(),
                        json!({
                            "trigger": first.trigger_str(),
                            "result": first.result_str(),
                            "kll": first.kllify(),
                        }),
                    );
                }
            }
            layers_json.insert(layer.to_string(), serde_json::Value::Object(layer_info));
        }

        // -- Assemble the json report --
        let code_lookup = json!({
            "Animation": "animationIndex",
            "Capability": null,
            "ConsCode": "consCtrlOut",
            "Layer": "layerShift",
            "LayerShift": "layerShift",
            "LayerLatch": "layerLatch",
            "LayerLock": "layerLock",
            "None": "none",
            "ScanCode": null,
            "SysCode": "sysCtrlOut",
            "USBCode": "usbKeyOut",
        });
        self.json.json_dict.insert(
            "AnimationIds".to_string(),
            serde_json::Value::Object(animation_id_json),
        );
        self.json.json_dict.insert(
            "AnimationSettings".to_string(),
            serde_json::Value::Object(animation_settings_json),
        );
        self.json.json_dict.insert(
            "AnimationSettingsIndex".to_string(),
            serde_json::Value::Array(animation_settings_index_json),
        );
        self.json.json_dict.insert(
            "PixelIds".to_string(),
            json!(pixel_id_json
                .into_iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::Object(v)))
                .collect::<serde_json::Map<String, serde_json::Value>>()),
        );
        self.json.json_dict.insert(
            "ScanCodes".to_string(),
            json!(scancode_json
                .into_iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::Object(v)))
                .collect::<serde_json::Map<String, serde_json::Value>>()),
        );
        self.json.json_dict.insert(
            "Capabilities".to_string(),
            serde_json::Value::Object(capabilities_json),
        );
        self.json.json_dict.insert(
            "Defines".to_string(),
            serde_json::Value::Object(defines_json),
        );
        self.json
            .json_dict
            .insert("Layers".to_string(), serde_json::Value::Object(layers_json));
        self.json
            .json_dict
            .insert("CodeLookup".to_string(), code_lookup);

        Ok(())
    }

    fn output(&mut self) -> Result<(), EmitError> {
        if self.opts.kiibohd_debug {
            log::debug!("-- Generating --");
            log::debug!("{}", self.opts.def_output.display());
            log::debug!("{}", self.opts.map_output.display());
            log::debug!("{}", self.opts.hid_output.display());
            if self.use_pixel_map {
                log::debug!("{}", self.opts.pixel_output.display());
            }
            log::debug!("{}", self.opts.json_output.display());
        }

        self.text.load_template(&self.opts.def_template)?;
        self.text.generate(&self.opts.def_output)?;

        self.text.load_template(&self.opts.map_template)?;
        self.text.generate(&self.opts.map_output)?;

        self.text.load_template(&self.opts.hid_template)?;
        self.text.generate(&self.opts.hid_output)?;

        if self.use_pixel_map {
            self.text.load_template(&self.opts.pixel_template)?;
            self.text.generate(&self.opts.pixel_output)?;
        } else {
            // Keep the build happy with an empty file
            fs::write(&self.opts.pixel_output, "")?;
        }

        self.json.generate_json(&self.opts.json_output)?;

        self.check_file(&self.opts.def_output);
        self.check_file(&self.opts.map_output);
        if self.use_pixel_map {
            self.check_file(&self.opts.pixel_output);
        }
        self.check_file(&self.opts.json_output);
        Ok(())
    }

    fn check(&self) -> bool {
        !self.error_exit
    }
}

impl Kiibohd {
    /// Frame-set array naming every frame of an animation
    fn frameset(name: &str, max_frame: usize) -> String {
        let mut out = format!("//// {} Animation Frame Set ////\n", name);
        out += &format!("const uint8_t *{}_frames[] = {{", name);
        for index in 1..=max_frame {
            out += &format!("\n\t{}_frame{},", name, index);
        }
        out += "\n\t0\n};\n\n\n";
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{CompilerOptions, ControlStage};
    use std::fs;
    use std::path::{Path, PathBuf};

    const CAPABILITIES: &str = concat!(
        "usbKeyOut => usbKeyOut(usbCode:1);\n",
        "sysCtrlOut => sysCtrlOut(sysCode:1);\n",
        "consCtrlOut => consCtrlOut(consCode:2);\n",
        "noneOut => noneOut();\n",
        "layerShift => layerShift(layer:2);\n",
        "layerLatch => layerLatch(layer:2);\n",
        "layerLock => layerLock(layer:2);\n",
        "animationIndex => animationIndex(settingindex:2);\n",
    );

    fn write_kll(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn emit(dir: &Path, opts_mut: impl FnOnce(&mut CompilerOptions)) -> (i32, PathBuf) {
        let _ = flexi_logger::Logger::with_env_or_str("warn").start();
        let out = dir.join("out");
        fs::create_dir_all(&out).unwrap();
        let mut opts = CompilerOptions {
            preprocessor_tmp_path: dir.join("kll-scratch"),
            ..CompilerOptions::default()
        };
        opts.emitter_opts.def_output = out.join("kll_defs.h");
        opts.emitter_opts.map_output = out.join("generatedKeymap.h");
        opts.emitter_opts.hid_output = out.join("usb_hid.h");
        opts.emitter_opts.pixel_output = out.join("generatedPixelmap.c");
        opts.emitter_opts.json_output = out.join("kll.json");
        opts.emitter_opts.target_dir = out.clone();
        opts_mut(&mut opts);
        let mut control = ControlStage::new(opts);
        (control.process(), out)
    }

    #[test]
    fn byte_split_little_endian() {
        assert_eq!(Kiibohd::byte_split(0x1234, 2), vec!["52", "18"]);
        assert_eq!(Kiibohd::byte_split(5, 1), vec!["5"]);
        // Negative values keep the signed two's complement form
        assert_eq!(Kiibohd::byte_split(-1, 2), vec!["255", "255"]);
    }

    #[test]
    fn gamma_table_bounds() {
        let identity = Kiibohd::generate_gamma_table(1.0);
        assert_eq!(identity[0], 0);
        assert_eq!(identity[128], 128);
        assert_eq!(identity[255], 255);

        let gamma = Kiibohd::generate_gamma_table(2.2);
        assert_eq!(gamma[0], 0);
        assert_eq!(gamma[255], 255);
        assert!(gamma[128] < 128);
    }

    #[test]
    fn c_define_names() {
        assert_eq!(Kiibohd::c_define(HidClass::Keyboard, "A"), "KEY_A");
        assert_eq!(
            Kiibohd::c_define(HidClass::Consumer, "VolumeUp"),
            "CONS_VOLUMEUP"
        );
        assert_eq!(Kiibohd::c_define(HidClass::Indicator, "P/"), "LED_P_");
    }

    #[test]
    fn emits_keymap_tables() {
        let dir = tempfile::tempdir().unwrap();
        let generic = write_kll(
            dir.path(),
            "map.kll",
            &format!(
                "{}S0x10 : U\"A\";\nU\"A\" : U\"B\";\nLayer[1] : layerShift(1);\n",
                CAPABILITIES
            ),
        );
        let partial = write_kll(dir.path(), "layer1.kll", "S0x11 : U\"C\";\n");
        let (code, out) = emit(dir.path(), |opts| {
            opts.generic_files = vec![generic.clone()];
            opts.partial_files = vec![partial.clone()];
        });
        assert_eq!(code, 0);

        let keymap = fs::read_to_string(out.join("generatedKeymap.h")).unwrap();
        // Capability table sorted by C function name; usbKeyOut is last
        assert!(keymap.contains("usbKeyOut_index"));
        assert!(keymap.contains("{ usbKeyOut, 1, CapabilityFeature_Safe }"));
        // Reduced S0x10 : U"B" result macro: <len>, <cap>, <schedule>, <code>
        assert!(keymap.contains("Guide_RM( 0 ) = { 1, 7, 0, KEY_B, 0 };"));
        // Scan code trigger encoding
        assert!(keymap.contains("TriggerType_Switch1"));
        // Layer trigger encoding and the partial layer scan map
        assert!(keymap.contains("TriggerType_Layer1"));
        assert!(keymap.contains("layer1_scanMap"));
        assert!(keymap.contains("Layer_IN( default_scanMap"));
        assert!(keymap.contains("Layer_IN( layer1_scanMap"));

        let defs = fs::read_to_string(out.join("kll_defs.h")).unwrap();
        assert!(defs.contains("#define LayerNum_KLL 2"));
        assert!(defs.contains("#define CapabilitiesNum_KLL 8"));

        let hid = fs::read_to_string(out.join("usb_hid.h")).unwrap();
        assert!(hid.contains("#define KEY_A 0x04"));
        assert!(hid.contains("#define KEY_B 0x05"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("kll.json")).unwrap()).unwrap();
        assert!(json.get("Capabilities").is_some());
        assert!(json.get("Layers").is_some());
    }

    #[test]
    fn missing_required_capability_fails() {
        let dir = tempfile::tempdir().unwrap();
        let generic = write_kll(dir.path(), "map.kll", "S1 : U\"A\";\n");
        let (code, _) = emit(dir.path(), |opts| {
            opts.generic_files = vec![generic.clone()];
        });
        assert_eq!(code, 1);
    }

    #[test]
    fn capability_shape_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let generic = write_kll(
            dir.path(),
            "map.kll",
            &format!("{}S1 : layerShift(1, 2);\n", CAPABILITIES),
        );
        let (code, _) = emit(dir.path(), |opts| {
            opts.generic_files = vec![generic.clone()];
        });
        assert_eq!(code, 1);
    }

    #[test]
    fn kll_round_trip_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let generic = write_kll(
            dir.path(),
            "map.kll",
            "S1 : U\"A\";\nS2 :+ U\"B\";\nmyVar = 12;\n",
        );

        let (code_a, out_a) = emit(dir.path(), |opts| {
            opts.emitter = "kll".to_string();
            opts.generic_files = vec![generic.clone()];
        });
        assert_eq!(code_a, 0);
        let final_a = fs::read_to_string(out_a.join("final.kll")).unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let generic_b = write_kll(
            dir_b.path(),
            "map.kll",
            "S1 : U\"A\";\nS2 :+ U\"B\";\nmyVar = 12;\n",
        );
        let (code_b, out_b) = emit(dir_b.path(), |opts| {
            opts.emitter = "kll".to_string();
            opts.generic_files = vec![generic_b.clone()];
        });
        assert_eq!(code_b, 0);
        let final_b = fs::read_to_string(out_b.join("final.kll")).unwrap();

        assert_eq!(final_a, final_b);
        assert!(final_a.contains("S0x001 : U0x004;"));
    }
}
