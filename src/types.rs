// Copyright 2021-2022 Jacob Alexander
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Identifier containers for KLL expressions.
//!
//! Every leaf value a KLL expression can refer to (scan codes, HID codes,
//! layers, animations, pixels, capabilities, ...) lives here, along with the
//! schedule/position/modifier attachments they carry.

use log::{error, warn};
use std::fmt;

/// Format a uid the canonical KLL way (S0x010, U0x004, ...)
pub fn hex_uid(uid: u32) -> String {
    format!("{:#05x}", uid)
}

// ----- Schedules -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimeUnit {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "s" => Some(Self::Seconds),
            "ms" => Some(Self::Milliseconds),
            "us" => Some(Self::Microseconds),
            "ns" => Some(Self::Nanoseconds),
            _ => None,
        }
    }

    /// Multiplier relative to one second
    pub fn divisor(&self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Milliseconds => 1e3,
            Self::Microseconds => 1e6,
            Self::Nanoseconds => 1e9,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds => write!(f, "s"),
            Self::Milliseconds => write!(f, "ms"),
            Self::Microseconds => write!(f, "us"),
            Self::Nanoseconds => write!(f, "ns"),
        }
    }
}

/// Timing parameter, e.g. 200ms or 1.5s
#[derive(Debug, Clone, PartialEq)]
pub struct Time {
    pub value: f64,
    pub unit: TimeUnit,
}

impl Time {
    pub fn new(value: f64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    pub fn to_ms(&self) -> f64 {
        self.value / self.unit.divisor() * 1e3
    }

    /// Split into whole milliseconds plus CPU ticks for the remainder
    pub fn to_ms_ticks(&self, frequency: u64) -> (u64, u64) {
        let seconds = self.value / self.unit.divisor();
        let ms_full = seconds * 1e3;
        let ms = ms_full as u64;
        let remainder = (ms_full - ms as f64) / 1e3;
        let ticks = (remainder * frequency as f64) as u64;
        (ms, ticks)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.fract() == 0.0 {
            write!(f, "{}{}", self.value as u64, self.unit)
        } else {
            write!(f, "{}{}", self.value, self.unit)
        }
    }
}

/// Symbolic or numeric schedule state
#[derive(Debug, Clone, PartialEq)]
pub enum ParamState {
    Symbol(String),
    Number(i64),
}

impl fmt::Display for ParamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbol(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Semantic class of a schedule parameter, inferred from the parent id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamKind {
    #[default]
    Generic,
    Button,
    Analog,
    Index,
    Indicator,
    Animation,
}

/// One schedule parameter: optional state plus optional timing
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScheduleParam {
    pub state: Option<ParamState>,
    pub timing: Option<Time>,
    pub kind: ParamKind,
}

impl ScheduleParam {
    pub fn new(state: Option<ParamState>, timing: Option<Time>) -> Self {
        Self {
            state,
            timing,
            kind: ParamKind::Generic,
        }
    }

    pub fn is_analog(&self) -> bool {
        self.kind == ParamKind::Analog
    }

    pub fn is_index(&self) -> bool {
        self.kind == ParamKind::Index
    }

    /// Numeric state value, for analog/index parameters
    pub fn state_number(&self) -> Option<i64> {
        match &self.state {
            Some(ParamState::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Long/short descriptors for symbolic states
    pub fn schedule_lookup(&self) -> Option<(&'static str, &'static str)> {
        let sym = match &self.state {
            Some(ParamState::Symbol(s)) => s.as_str(),
            _ => return None,
        };
        match self.kind {
            ParamKind::Button => match sym {
                "P" => Some(("Press", "P")),
                "H" => Some(("Hold", "H")),
                "R" => Some(("Release", "R")),
                "O" => Some(("Off", "O")),
                "UP" => Some(("Unique Press", "UP")),
                "UR" => Some(("Unique Release", "UR")),
                _ => None,
            },
            ParamKind::Indicator => match sym {
                "A" => Some(("Activate", "A")),
                "On" => Some(("On", "On")),
                "D" => Some(("Deactivate", "D")),
                "Off" => Some(("Off", "Off")),
                _ => None,
            },
            ParamKind::Animation => match sym {
                "D" => Some(("Done", "Done")),
                "R" => Some(("Repeat", "Repeat")),
                "O" => Some(("Off", "Off")),
                _ => None,
            },
            _ => None,
        }
    }

    /// Morph into the parameter class matching the parent identifier
    pub fn set_kind(&mut self, parent: ParentKind) {
        self.kind = match parent {
            ParentKind::Indicator | ParentKind::Layer => ParamKind::Indicator,
            ParentKind::GenericTrigger => match self.state {
                Some(ParamState::Number(_)) => ParamKind::Index,
                _ => ParamKind::Button,
            },
            ParentKind::Button | ParentKind::Capability => match self.state {
                Some(ParamState::Number(_)) => ParamKind::Analog,
                _ => ParamKind::Button,
            },
            ParentKind::Animation => ParamKind::Animation,
        };
    }

    /// Validate the assigned state against the inferred class
    pub fn check(&self) -> bool {
        let valid = match (&self.state, self.kind) {
            (Some(ParamState::Symbol(s)), ParamKind::Button) => {
                matches!(s.as_str(), "P" | "H" | "R" | "O" | "UP" | "UR")
            }
            (Some(ParamState::Symbol(s)), ParamKind::Indicator) => {
                matches!(s.as_str(), "A" | "On" | "D" | "Off")
            }
            (Some(ParamState::Symbol(s)), ParamKind::Animation) => {
                matches!(s.as_str(), "D" | "R" | "O")
            }
            (Some(ParamState::Number(_)), ParamKind::Analog | ParamKind::Index) => true,
            (None, _) => self.timing.is_some(),
            _ => false,
        };
        if !valid {
            error!("Invalid {:?} state '{:?}'", self.kind, self.state);
        }
        valid
    }
}

impl fmt::Display for ScheduleParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.state, &self.timing) {
            (Some(state), Some(timing)) => write!(f, "{}:{}", state, timing),
            (Some(state), None) => write!(f, "{}", state),
            (None, Some(timing)) => write!(f, "{}", timing),
            (None, None) => Ok(()),
        }
    }
}

/// Kinds of identifiers a schedule parameter can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    Button,
    Indicator,
    Layer,
    GenericTrigger,
    Animation,
    Capability,
}

/// Identifier schedule; evaluated inside-out, first write wins
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schedule {
    pub params: Option<Vec<ScheduleParam>>,
}

impl Schedule {
    /// Apply schedule parameters; ignored if already set
    pub fn set_schedule(&mut self, params: Option<Vec<ScheduleParam>>, parent: ParentKind) {
        if self.params.is_some() {
            return;
        }
        let Some(mut params) = params else { return };
        for param in &mut params {
            param.set_kind(parent);
            param.check();
        }
        self.params = Some(params);
    }

    pub fn str_schedule(&self) -> String {
        match &self.params {
            None => String::new(),
            Some(params) => params
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Schedule string wrapped in parens when set, empty otherwise
    pub fn suffix(&self) -> String {
        let s = self.str_schedule();
        if s.is_empty() {
            s
        } else {
            format!("({})", s)
        }
    }
}

// ----- Physical positions -----

/// Physical position, distance in mm, rotation in degrees
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Position {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
    pub rx: Option<f32>,
    pub ry: Option<f32>,
    pub rz: Option<f32>,
}

impl Position {
    pub fn is_set(&self) -> bool {
        self.x.is_some()
            || self.y.is_some()
            || self.z.is_some()
            || self.rx.is_some()
            || self.ry.is_some()
            || self.rz.is_some()
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Option<f32>> {
        match name {
            "x" => Some(&mut self.x),
            "y" => Some(&mut self.y),
            "z" => Some(&mut self.z),
            "rx" => Some(&mut self.rx),
            "ry" => Some(&mut self.ry),
            "rz" => Some(&mut self.rz),
            _ => None,
        }
    }

    /// First write per axis wins; expressions are read inside-out
    pub fn set_position(&mut self, params: &[(String, f32)]) {
        for (name, value) in params {
            match self.field_mut(name) {
                Some(field) => {
                    if field.is_none() {
                        *field = Some(*value);
                    }
                }
                None => error!("'{}' is not a valid position parameter", name),
            }
        }
    }

    /// Overwrite every axis the fresher position sets
    pub fn update_positions(&mut self, other: &Position) {
        let mut fresh = other.clone();
        for name in ["x", "y", "z", "rx", "ry", "rz"] {
            let value = *fresh.field_mut(name).unwrap();
            if value.is_some() {
                *self.field_mut(name).unwrap() = value;
            }
        }
    }

    pub fn str_position(&self) -> String {
        let mut out = vec![];
        for (name, value) in [
            ("x", self.x),
            ("y", self.y),
            ("z", self.z),
            ("rx", self.rx),
            ("ry", self.ry),
            ("rz", self.rz),
        ] {
            if let Some(value) = value {
                out.push(format!("{}:{}", name, value));
            }
        }
        out.join(",")
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.str_position())
    }
}

// ----- Animation and pixel modifiers -----

#[derive(Debug, Clone, PartialEq)]
pub enum AnimationModArg {
    None,
    Number(i64),
    Name(String),
    Call(String, Vec<i64>),
}

impl fmt::Display for AnimationModArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Number(n) => write!(f, "{}", n),
            Self::Name(n) => write!(f, "{}", n),
            Self::Call(n, args) => write!(
                f,
                "{}({})",
                n,
                args.iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        }
    }
}

/// Animation playback modifier, e.g. loops:3 or framestretch
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationModifier {
    pub name: String,
    pub value: AnimationModArg,
}

const VALID_ANIMATION_MODIFIERS: &[&str] = &[
    "loops",
    "loop",
    "framedelay",
    "framestretch",
    "start",
    "pause",
    "stop",
    "single",
    "pos",
    "pfunc",
    "ffunc",
    "replace",
];

impl AnimationModifier {
    pub fn new(name: &str, value: AnimationModArg) -> Self {
        if !VALID_ANIMATION_MODIFIERS.contains(&name) {
            error!("'{}' is not a valid animation modifier", name);
        }
        Self {
            name: name.to_string(),
            value,
        }
    }
}

impl fmt::Display for AnimationModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            AnimationModArg::None => write!(f, "{}", self.name),
            _ => write!(f, "{}:{}", self.name, self.value),
        }
    }
}

/// Unordered animation modifier set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnimationModifierList {
    pub modifiers: Vec<AnimationModifier>,
}

impl AnimationModifierList {
    pub fn set_modifiers(&mut self, modifiers: Vec<AnimationModifier>) {
        self.modifiers.extend(modifiers);
    }

    /// Replace a modifier, or add it if missing. loops and loop displace
    /// each other instead of coexisting.
    pub fn replace(&mut self, new: AnimationModifier) {
        let conflicts = |a: &str, b: &str| {
            (a == "loops" && b == "loop") || (a == "loop" && b == "loops")
        };
        if self
            .modifiers
            .iter()
            .any(|m| conflicts(new.name.as_str(), m.name.as_str()))
        {
            return;
        }
        for modifier in &mut self.modifiers {
            if modifier.name == new.name {
                modifier.value = new.value;
                return;
            }
        }
        self.modifiers.push(new);
    }

    pub fn get_modifier(&self, name: &str) -> Option<&AnimationModArg> {
        self.modifiers
            .iter()
            .find(|m| m.name == name)
            .map(|m| &m.value)
    }

    pub fn str_modifiers(&self) -> String {
        let mut sorted: Vec<_> = self.modifiers.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        sorted
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for AnimationModifierList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.str_modifiers())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelOp {
    Add,
    Subtract,
    NoRollAdd,
    NoRollSubtract,
    LeftShift,
    RightShift,
}

impl PixelOp {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Self::Add),
            "-" => Some(Self::Subtract),
            "+:" => Some(Self::NoRollAdd),
            "-:" => Some(Self::NoRollSubtract),
            "<<" => Some(Self::LeftShift),
            ">>" => Some(Self::RightShift),
            _ => None,
        }
    }
}

impl fmt::Display for PixelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "+"),
            Self::Subtract => write!(f, "-"),
            Self::NoRollAdd => write!(f, "+:"),
            Self::NoRollSubtract => write!(f, "-:"),
            Self::LeftShift => write!(f, "<<"),
            Self::RightShift => write!(f, ">>"),
        }
    }
}

/// Per-channel pixel change
#[derive(Debug, Clone, PartialEq)]
pub struct PixelModifier {
    pub operator: Option<PixelOp>,
    pub value: i64,
}

impl PixelModifier {
    /// Firmware PixelChange_* tag
    pub fn operator_type(&self) -> &'static str {
        match self.operator {
            None => "Set",
            Some(PixelOp::Add) => "Add",
            Some(PixelOp::Subtract) => "Subtract",
            Some(PixelOp::NoRollAdd) => "NoRoll_Add",
            Some(PixelOp::NoRollSubtract) => "NoRoll_Subtract",
            Some(PixelOp::LeftShift) => "LeftShift",
            Some(PixelOp::RightShift) => "RightShift",
        }
    }
}

impl fmt::Display for PixelModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operator {
            None => write!(f, "{}", self.value),
            Some(op) => write!(f, "{}{}", op, self.value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PixelModifierList {
    pub modifiers: Vec<PixelModifier>,
}

impl PixelModifierList {
    pub fn str_modifiers(&self) -> String {
        self.modifiers
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Pixel channel reference: uid plus bit width
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub uid: u32,
    pub width: u8,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.width)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelList {
    pub channels: Vec<Channel>,
}

impl ChannelList {
    pub fn str_channels(&self) -> String {
        self.channels
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ----- HID identifiers -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HidClass {
    Keyboard,
    System,
    Consumer,
    Indicator,
}

impl HidClass {
    /// KLL source prefix
    pub fn kll_prefix(&self) -> &'static str {
        match self {
            Self::Keyboard => "U",
            Self::System => "SYS",
            Self::Consumer => "CONS",
            Self::Indicator => "I",
        }
    }

    /// Secondary tag used by the capability lookup
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Keyboard => "USB",
            Self::System => "SYS",
            Self::Consumer => "CONS",
            Self::Indicator => "IND",
        }
    }

    /// Argument width in bytes, per the USB spec
    pub fn width(&self) -> usize {
        match self {
            Self::Consumer => 2,
            _ => 1,
        }
    }
}

/// HID usage identifier; must resolve in the selected locale
#[derive(Debug, Clone, PartialEq)]
pub struct HidId {
    pub class: HidClass,
    pub uid: u16,
    pub schedule: Schedule,
    /// False when the source name failed the locale lookup
    pub known: bool,
}

impl HidId {
    pub fn new(class: HidClass, uid: u16) -> Self {
        Self {
            class,
            uid,
            schedule: Schedule::default(),
            known: true,
        }
    }

    pub fn unknown(class: HidClass) -> Self {
        Self {
            class,
            uid: 0,
            schedule: Schedule::default(),
            known: false,
        }
    }

    pub fn width(&self) -> usize {
        self.class.width()
    }
}

impl fmt::Display for HidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.class.kll_prefix(),
            hex_uid(self.uid as u32),
            self.schedule.suffix()
        )
    }
}

// ----- Scan codes -----

/// Keyboard matrix position. updated_uid caches the post-offset value
/// once the preprocessor has resolved interconnect offsets.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanCodeId {
    pub uid: u16,
    pub updated_uid: Option<u16>,
    pub schedule: Schedule,
    pub position: Position,
}

impl ScanCodeId {
    pub fn new(uid: u16) -> Self {
        Self {
            uid,
            ..Self::default()
        }
    }

    pub fn get_uid(&self) -> u16 {
        self.updated_uid.unwrap_or(self.uid)
    }
}

impl fmt::Display for ScanCodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.position.is_set() {
            return write!(
                f,
                "S{} <= {}",
                hex_uid(self.get_uid() as u32),
                self.position.str_position()
            );
        }
        write!(
            f,
            "S{}{}",
            hex_uid(self.get_uid() as u32),
            self.schedule.suffix()
        )
    }
}

// ----- Layers -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Layer,
    Shift,
    Latch,
    Lock,
}

impl LayerKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Layer" => Some(Self::Layer),
            "LayerShift" => Some(Self::Shift),
            "LayerLatch" => Some(Self::Latch),
            "LayerLock" => Some(Self::Lock),
            _ => None,
        }
    }

    /// Capability the firmware binds this layer event to
    pub fn capability_key(&self) -> &'static str {
        match self {
            Self::Layer | Self::Shift => "Layer",
            Self::Latch => "LayerLatch",
            Self::Lock => "LayerLock",
        }
    }

    /// ScheduleType_* suffix appended to layer trigger states
    pub fn schedule_type(&self) -> &'static str {
        match self {
            Self::Layer => "",
            Self::Shift => " | ScheduleType_Shift",
            Self::Latch => " | ScheduleType_Latch",
            Self::Lock => " | ScheduleType_Lock",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Layer => write!(f, "Layer"),
            Self::Shift => write!(f, "LayerShift"),
            Self::Latch => write!(f, "LayerLatch"),
            Self::Lock => write!(f, "LayerLock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerId {
    pub kind: LayerKind,
    pub uid: u16,
    pub schedule: Schedule,
}

impl LayerId {
    pub fn new(kind: LayerKind, uid: u16) -> Self {
        Self {
            kind,
            uid,
            schedule: Schedule::default(),
        }
    }

    pub fn width(&self) -> usize {
        2
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.kind, self.uid, self.schedule.suffix())
    }
}

// ----- Generic triggers -----

/// Generic trigger, identified by a firmware idcode plus uid.
/// The idcode enumerates the closed TriggerType set (rotation is 21).
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerId {
    pub idcode: u8,
    pub uid: u16,
    pub schedule: Schedule,
}

pub const TRIGGER_IDCODE_ROTATION: u8 = 21;

impl TriggerId {
    pub fn new(idcode: u8, uid: u16) -> Self {
        Self {
            idcode,
            uid,
            schedule: Schedule::default(),
        }
    }

    /// TriggerType_* enum name for the known idcodes
    pub fn type_name(&self) -> Option<&'static str> {
        Some(match self.idcode {
            0x00 => "TriggerType_Switch1",
            0x01 => "TriggerType_Switch2",
            0x02 => "TriggerType_Switch3",
            0x03 => "TriggerType_Switch4",
            0x04 => "TriggerType_LED1",
            0x05 => "TriggerType_Analog1",
            0x06 => "TriggerType_Analog2",
            0x07 => "TriggerType_Analog3",
            0x08 => "TriggerType_Analog4",
            0x09 => "TriggerType_Layer1",
            0x0A => "TriggerType_Layer2",
            0x0B => "TriggerType_Layer3",
            0x0C => "TriggerType_Layer4",
            0x0D => "TriggerType_Animation1",
            0x0E => "TriggerType_Animation2",
            0x0F => "TriggerType_Animation3",
            0x10 => "TriggerType_Animation4",
            0x11 => "TriggerType_Sleep1",
            0x12 => "TriggerType_Resume1",
            0x13 => "TriggerType_Inactive1",
            0x14 => "TriggerType_Active1",
            0x15 => "TriggerType_Rotation1",
            0xFF => "TriggerType_Debug",
            _ => return None,
        })
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T[{},{}]{}",
            self.idcode,
            self.uid,
            self.schedule.suffix()
        )
    }
}

// ----- Animations -----

/// Animation reference; uid is assigned during analysis via the
/// name->index table.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationId {
    pub name: String,
    pub state: Option<String>,
    pub schedule: Schedule,
    pub modifiers: AnimationModifierList,
}

impl AnimationId {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: None,
            schedule: Schedule::default(),
            modifiers: AnimationModifierList::default(),
        }
    }

    pub fn width(&self) -> usize {
        2
    }

    /// Identifier without modifiers
    pub fn base_str(&self) -> String {
        match &self.state {
            Some(state) => format!("A[{}, {}]", self.name, state),
            None => format!("A[{}]", self.name),
        }
    }
}

impl fmt::Display for AnimationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            Some(state) => format!(", {}", state),
            None => String::new(),
        };
        let schedule = self.schedule.str_schedule();
        if !schedule.is_empty() {
            write!(f, "A[{}{}]({})", self.name, state, schedule)
        } else if !self.modifiers.modifiers.is_empty() {
            write!(f, "A[{}{}]({})", self.name, state, self.modifiers)
        } else {
            write!(f, "A[{}{}]", self.name, state)
        }
    }
}

/// One frame of an animation frame set; not usable as a trigger
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationFrameId {
    pub name: String,
    pub index: usize,
}

impl fmt::Display for AnimationFrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A[{}, {}]", self.name, self.index)
    }
}

// ----- Pixels -----

/// Pixel address component value: absolute or percentage
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddrVal {
    Num(i32),
    Percent(f32),
}

impl AddrVal {
    pub fn value_str(&self) -> String {
        match self {
            Self::Num(n) => format!("{:03}", n),
            Self::Percent(p) => {
                let scaled = p * 100.0;
                if scaled.fract() == 0.0 {
                    format!("{}%", scaled as i64)
                } else {
                    format!("{}%", scaled)
                }
            }
        }
    }
}

/// Pixel address: index or positioned; fields are mutually constrained
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PixelAddressId {
    pub index: Option<usize>,
    pub row: Option<AddrVal>,
    pub col: Option<AddrVal>,
    pub rel_row: Option<AddrVal>,
    pub rel_col: Option<AddrVal>,
}

/// Firmware address type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelAddressType {
    Index,
    ColumnFill,
    RowFill,
    Rect,
    RelativeColumnFill,
    RelativeRowFill,
    RelativeRect,
    ScanCode,
}

impl PixelAddressType {
    pub fn c_name(&self) -> &'static str {
        match self {
            Self::Index => "PixelAddressType_Index",
            Self::ColumnFill => "PixelAddressType_ColumnFill",
            Self::RowFill => "PixelAddressType_RowFill",
            Self::Rect => "PixelAddressType_Rect",
            Self::RelativeColumnFill => "PixelAddressType_RelativeColumnFill",
            Self::RelativeRowFill => "PixelAddressType_RelativeRowFill",
            Self::RelativeRect => "PixelAddressType_RelativeRect",
            Self::ScanCode => "PixelAddressType_ScanCode",
        }
    }
}

impl PixelAddressId {
    pub fn from_index(index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    pub fn inferred_type(&self) -> PixelAddressType {
        if self.index.is_some() {
            PixelAddressType::Index
        } else if self.col.is_some() && self.row.is_some() {
            PixelAddressType::Rect
        } else if self.col.is_some() {
            PixelAddressType::ColumnFill
        } else if self.row.is_some() {
            PixelAddressType::RowFill
        } else if self.rel_col.is_some() && self.rel_row.is_some() {
            PixelAddressType::RelativeRect
        } else if self.rel_col.is_some() {
            PixelAddressType::RelativeColumnFill
        } else {
            PixelAddressType::RelativeRowFill
        }
    }

    /// Address payload; single element for index addressing, otherwise
    /// the (col, row) pair
    pub fn uid_set(&self) -> Vec<Option<AddrVal>> {
        if let Some(index) = self.index {
            return vec![Some(AddrVal::Num(index as i32))];
        }
        if self.rel_col.is_some() || self.rel_row.is_some() {
            return vec![self.rel_col, self.rel_row];
        }
        vec![self.col, self.row]
    }

    /// Merge in another partial address. Duplicate non-null fields and
    /// index merges are rejected.
    pub fn merge(&mut self, other: &PixelAddressId) -> Result<(), String> {
        if self.index.is_some() || other.index.is_some() {
            return Err("cannot merge into index pixel addresses".to_string());
        }
        if self.col.is_some() && other.col.is_some() {
            return Err(format!("duplicate column fields '{:?}' '{:?}'", self, other));
        }
        if self.row.is_some() && other.row.is_some() {
            return Err(format!("duplicate row fields '{:?}' '{:?}'", self, other));
        }
        if other.col.is_some() {
            self.col = other.col;
        }
        if other.row.is_some() {
            self.row = other.row;
        }
        if other.rel_col.is_some() {
            self.rel_col = other.rel_col;
        }
        if other.rel_row.is_some() {
            self.rel_row = other.rel_row;
        }
        Ok(())
    }

    fn output_parts(&self) -> Vec<String> {
        let mut out = vec![];
        if let Some(index) = self.index {
            out.push(AddrVal::Num(index as i32).value_str());
        }
        if let Some(row) = self.row {
            out.push(format!("r:{}", row.value_str()));
        }
        if let Some(col) = self.col {
            out.push(format!("c:{}", col.value_str()));
        }
        if let Some(rel_row) = self.rel_row {
            let sign = match rel_row {
                AddrVal::Num(n) if n < 0 => "",
                AddrVal::Percent(p) if p < 0.0 => "",
                _ => "+",
            };
            out.push(format!("r:i{}{}", sign, rel_row.value_str()));
        }
        if let Some(rel_col) = self.rel_col {
            let sign = match rel_col {
                AddrVal::Num(n) if n < 0 => "",
                AddrVal::Percent(p) if p < 0.0 => "",
                _ => "+",
            };
            out.push(format!("c:i{}{}", sign, rel_col.value_str()));
        }
        out
    }
}

impl fmt::Display for PixelAddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.output_parts().join(","))
    }
}

/// What a pixel identifier addresses
#[derive(Debug, Clone, PartialEq)]
pub enum PixelUid {
    Address(PixelAddressId),
    Scan(ScanCodeId),
    Hid(HidId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelId {
    pub uid: PixelUid,
    pub modifiers: PixelModifierList,
    pub channels: ChannelList,
    pub position: Position,
}

impl PixelId {
    pub fn from_index(index: usize) -> Self {
        Self::from_address(PixelAddressId::from_index(index))
    }

    pub fn from_address(address: PixelAddressId) -> Self {
        Self {
            uid: PixelUid::Address(address),
            modifiers: PixelModifierList::default(),
            channels: ChannelList::default(),
            position: Position::default(),
        }
    }

    /// Plain index when this pixel uses index addressing
    pub fn index(&self) -> Option<usize> {
        match &self.uid {
            PixelUid::Address(addr) => addr.index,
            _ => None,
        }
    }

    pub fn address_type(&self) -> PixelAddressType {
        match &self.uid {
            PixelUid::Address(addr) => addr.inferred_type(),
            PixelUid::Scan(_) => PixelAddressType::ScanCode,
            PixelUid::Hid(_) => PixelAddressType::ScanCode,
        }
    }

    pub fn unique_key(&self) -> String {
        match &self.uid {
            PixelUid::Address(addr) => match addr.index {
                Some(index) => format!("P{}", hex_uid(index as u32)),
                None => format!("P[{}]", addr),
            },
            PixelUid::Scan(sc) => format!("{}", sc),
            PixelUid::Hid(hid) => format!("{}", hid),
        }
    }
}

impl fmt::Display for PixelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.position.is_set() {
            return write!(f, "{} <= {}", self.unique_key(), self.position);
        }
        let mut extra = String::new();
        if !self.modifiers.modifiers.is_empty() {
            extra += &format!("({})", self.modifiers.str_modifiers());
        }
        if !self.channels.channels.is_empty() {
            extra += &format!("({})", self.channels.str_channels());
        }
        write!(f, "{}{}", self.unique_key(), extra)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelLayerId {
    pub uid: u16,
    pub modifiers: PixelModifierList,
}

impl fmt::Display for PixelLayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modifiers.modifiers.is_empty() {
            write!(f, "PL{}", self.uid)
        } else {
            write!(f, "PL{}({})", self.uid, self.modifiers.str_modifiers())
        }
    }
}

// ----- Capabilities -----

#[derive(Debug, Clone, PartialEq)]
pub enum CapArg {
    /// Named argument with byte width, used by definitions
    Def { name: String, width: Option<usize> },
    /// Literal value, used by invocations
    Value(i64),
}

impl fmt::Display for CapArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Def { name, width: None } => write!(f, "{}", name),
            Self::Def {
                name,
                width: Some(width),
            } => write!(f, "{}:{}", name, width),
            Self::Value(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    Capability,
    Definition,
}

/// Capability reference or definition
#[derive(Debug, Clone, PartialEq)]
pub struct CapId {
    pub name: String,
    pub kind: CapKind,
    pub args: Vec<CapArg>,
    pub schedule: Schedule,
}

impl CapId {
    pub fn new(name: &str, kind: CapKind, args: Vec<CapArg>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            args,
            schedule: Schedule::default(),
        }
    }

    /// Sum of declared argument byte widths (definitions only)
    pub fn declared_arg_bytes(&self) -> usize {
        self.args
            .iter()
            .map(|arg| match arg {
                CapArg::Def { width, .. } => width.unwrap_or(0),
                CapArg::Value(_) => 0,
            })
            .sum()
    }

    /// Invocation argument values
    pub fn arg_values(&self) -> Vec<i64> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                CapArg::Value(v) => Some(*v),
                CapArg::Def { .. } => None,
            })
            .collect()
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})",
            self.name,
            self.args
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

/// UTF-8 text result; indexed into the string table at emit time
#[derive(Debug, Clone, PartialEq)]
pub struct Utf8Id {
    pub text: String,
    pub schedule: Schedule,
}

impl Utf8Id {
    pub fn width(&self) -> usize {
        2
    }
}

impl fmt::Display for Utf8Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u\"{}\"", self.text)
    }
}

// ----- The identifier sum type -----

#[derive(Debug, Clone, PartialEq)]
pub enum Identifier {
    ScanCode(ScanCodeId),
    Hid(HidId),
    Layer(LayerId),
    Generic(TriggerId),
    Animation(AnimationId),
    AnimationFrame(AnimationFrameId),
    Pixel(PixelId),
    PixelLayer(PixelLayerId),
    Capability(CapId),
    None,
    Utf8(Utf8Id),
}

impl Identifier {
    /// Numeric uid where one exists
    pub fn get_uid(&self) -> Option<u16> {
        match self {
            Self::ScanCode(id) => Some(id.get_uid()),
            Self::Hid(id) => Some(id.uid),
            Self::Layer(id) => Some(id.uid),
            Self::Generic(id) => Some(id.uid),
            Self::PixelLayer(id) => Some(id.uid),
            _ => None,
        }
    }

    /// True for identifier kinds the firmware can match as triggers
    /// (everything the reduction pass passes through untouched)
    pub fn is_trigger_kind(&self) -> bool {
        matches!(
            self,
            Self::ScanCode(_) | Self::Layer(_) | Self::Generic(_)
        ) || matches!(self, Self::Hid(id) if id.class == HidClass::Indicator)
    }

    pub fn is_hid_code(&self) -> bool {
        matches!(self, Self::Hid(id) if id.class != HidClass::Indicator)
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        match self {
            Self::ScanCode(id) => Some(&id.schedule),
            Self::Hid(id) => Some(&id.schedule),
            Self::Layer(id) => Some(&id.schedule),
            Self::Generic(id) => Some(&id.schedule),
            Self::Animation(id) => Some(&id.schedule),
            Self::Capability(id) => Some(&id.schedule),
            Self::Utf8(id) => Some(&id.schedule),
            _ => None,
        }
    }

    pub fn str_schedule(&self) -> String {
        self.schedule()
            .map(|s| s.str_schedule())
            .unwrap_or_default()
    }

    /// Attach a schedule; first write wins, kind inferred from self
    pub fn set_schedule(&mut self, params: Option<Vec<ScheduleParam>>) {
        if params.is_none() {
            return;
        }
        match self {
            Self::ScanCode(id) => id.schedule.set_schedule(params, ParentKind::Button),
            Self::Hid(id) => {
                let parent = if id.class == HidClass::Indicator {
                    ParentKind::Indicator
                } else {
                    ParentKind::Button
                };
                id.schedule.set_schedule(params, parent)
            }
            Self::Layer(id) => id.schedule.set_schedule(params, ParentKind::Layer),
            Self::Generic(id) => id.schedule.set_schedule(params, ParentKind::GenericTrigger),
            Self::Animation(id) => id.schedule.set_schedule(params, ParentKind::Animation),
            Self::Capability(id) => id.schedule.set_schedule(params, ParentKind::Capability),
            _ => warn!("schedule not supported for {}", self),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScanCode(id) => write!(f, "{}", id),
            Self::Hid(id) => write!(f, "{}", id),
            Self::Layer(id) => write!(f, "{}", id),
            Self::Generic(id) => write!(f, "{}", id),
            Self::Animation(id) => write!(f, "{}", id),
            Self::AnimationFrame(id) => write!(f, "{}", id),
            Self::Pixel(id) => write!(f, "{}", id),
            Self::PixelLayer(id) => write!(f, "{}", id),
            Self::Capability(id) => write!(f, "{}", id),
            Self::None => write!(f, "None"),
            Self::Utf8(id) => write!(f, "{}", id),
        }
    }
}
