//! KLL expression containers.
//!
//! The classifier stage produces one expression per statement; the
//! per-operator stage fills in one of the four concrete forms. Every
//! expression can produce the unique keys used to merge functionally
//! equivalent expressions across contexts, and a canonical kll rendering.

use crate::types::{
    AnimationFrameId, AnimationId, AnimationModifierList, CapId, Identifier, PixelId, ScanCodeId,
};
use std::fmt;

/// Map expression operators, including the isolated variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Set,
    LazySet,
    Append,
    Remove,
    IsolatedSet,
    IsolatedLazySet,
    IsolatedAppend,
    IsolatedRemove,
}

impl Operator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            ":" => Some(Self::Set),
            "::" => Some(Self::LazySet),
            ":+" => Some(Self::Append),
            ":-" => Some(Self::Remove),
            "i:" => Some(Self::IsolatedSet),
            "i::" => Some(Self::IsolatedLazySet),
            "i:+" => Some(Self::IsolatedAppend),
            "i:-" => Some(Self::IsolatedRemove),
            _ => None,
        }
    }

    pub fn is_isolated(&self) -> bool {
        matches!(
            self,
            Self::IsolatedSet | Self::IsolatedLazySet | Self::IsolatedAppend | Self::IsolatedRemove
        )
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::LazySet | Self::IsolatedLazySet)
    }

    pub fn is_append(&self) -> bool {
        matches!(self, Self::Append | Self::IsolatedAppend)
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Self::Remove | Self::IsolatedRemove)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set | Self::IsolatedSet)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => write!(f, ":"),
            Self::LazySet => write!(f, "::"),
            Self::Append => write!(f, ":+"),
            Self::Remove => write!(f, ":-"),
            Self::IsolatedSet => write!(f, "i:"),
            Self::IsolatedLazySet => write!(f, "i::"),
            Self::IsolatedAppend => write!(f, "i:+"),
            Self::IsolatedRemove => write!(f, "i:-"),
        }
    }
}

/// One simultaneous press/action
pub type Combo = Vec<Identifier>;
/// Ordered combos
pub type Sequence = Vec<Combo>;

// ----- Assignment (=) -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignKind {
    Variable,
    Array,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignValue {
    Single(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentExpression {
    pub kind: AssignKind,
    pub name: String,
    /// Index for single-element array writes; None once the array has
    /// been expanded into a list
    pub pos: Option<usize>,
    pub value: AssignValue,
}

impl AssignmentExpression {
    pub fn variable(name: &str, value: String) -> Self {
        Self {
            kind: AssignKind::Variable,
            name: name.to_string(),
            pos: None,
            value: AssignValue::Single(value),
        }
    }

    pub fn array(name: &str, pos: Option<usize>, value: AssignValue) -> Self {
        Self {
            kind: AssignKind::Array,
            name: name.to_string(),
            pos,
            value,
        }
    }

    /// Expand an indexed write into a sparse list, padding with empty
    /// strings, then merge in another indexed write if given
    pub fn merge_array(&mut self, new: Option<&AssignmentExpression>) {
        if let Some(pos) = self.pos.take() {
            let single = match &self.value {
                AssignValue::Single(s) => s.clone(),
                AssignValue::List(l) => l.join(""),
            };
            let mut list = vec![String::new(); pos];
            list.push(single);
            self.value = AssignValue::List(list);
        }
        if let Some(new) = new {
            if let Some(pos) = new.pos {
                let AssignValue::List(list) = &mut self.value else {
                    return;
                };
                if list.len() <= pos {
                    list.resize(pos + 1, String::new());
                }
                list[pos] = match &new.value {
                    AssignValue::Single(s) => s.clone(),
                    AssignValue::List(l) => l.join(""),
                };
            }
        }
    }

    /// Flat value for scalar reads
    pub fn value_str(&self) -> String {
        match &self.value {
            AssignValue::Single(s) => s.clone(),
            AssignValue::List(l) => l.join(" "),
        }
    }

    pub fn value_list(&self) -> Vec<String> {
        match &self.value {
            AssignValue::Single(s) => vec![s.clone()],
            AssignValue::List(l) => l.clone(),
        }
    }
}

impl fmt::Display for AssignmentExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.value) {
            (AssignKind::Variable, _) => write!(f, "{} = {};", self.name, self.value_str()),
            (AssignKind::Array, AssignValue::List(list)) => {
                write!(f, "{}[] =", self.name)?;
                for value in list {
                    write!(f, " \"{}\"", value)?;
                }
                write!(f, ";")
            }
            (AssignKind::Array, AssignValue::Single(value)) => {
                write!(f, "{}[{}] = {};", self.name, self.pos.unwrap_or(0), value)
            }
        }
    }
}

// ----- Name association (=>) -----

#[derive(Debug, Clone, PartialEq)]
pub enum NameAssoc {
    /// Capability definition with argument widths
    Capability(CapId),
    /// C define alias
    Define(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameAssociationExpression {
    pub name: String,
    pub association: NameAssoc,
}

impl NameAssociationExpression {
    pub fn subtype(&self) -> &'static str {
        match self.association {
            NameAssoc::Capability(_) => "Capability",
            NameAssoc::Define(_) => "Define",
        }
    }

    pub fn capability(&self) -> Option<&CapId> {
        match &self.association {
            NameAssoc::Capability(cap) => Some(cap),
            NameAssoc::Define(_) => None,
        }
    }
}

impl fmt::Display for NameAssociationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.association {
            NameAssoc::Capability(cap) => write!(f, "{} => {};", self.name, cap),
            NameAssoc::Define(name) => write!(f, "{} => {};", self.name, name),
        }
    }
}

// ----- Data association (<=) -----

#[derive(Debug, Clone, PartialEq)]
pub enum DataAssociation {
    /// Animation default settings
    Animation {
        animation: AnimationId,
        modifiers: AnimationModifierList,
    },
    /// Frame contents of an animation frame set
    AnimationFrame {
        frames: Vec<AnimationFrameId>,
        pixels: Vec<PixelId>,
    },
    /// Physical pixel placement; positions are stored on the ids
    PixelPosition { pixels: Vec<PixelId> },
    /// Physical key placement; positions are stored on the ids
    ScanCodePosition { scancodes: Vec<ScanCodeId> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataAssociationExpression {
    pub association: DataAssociation,
}

impl DataAssociationExpression {
    pub fn subtype(&self) -> &'static str {
        match self.association {
            DataAssociation::Animation { .. } => "Animation",
            DataAssociation::AnimationFrame { .. } => "AnimationFrame",
            DataAssociation::PixelPosition { .. } => "PixelPosition",
            DataAssociation::ScanCodePosition { .. } => "ScanCodePosition",
        }
    }

    /// Destructive position update from a fresher association
    pub fn update(&mut self, new: &DataAssociationExpression) {
        match (&mut self.association, &new.association) {
            (
                DataAssociation::PixelPosition { pixels },
                DataAssociation::PixelPosition { pixels: new_pixels },
            ) => {
                if let Some(new_pixel) = new_pixels.first() {
                    for pixel in pixels {
                        pixel.position.update_positions(&new_pixel.position);
                    }
                }
            }
            (
                DataAssociation::ScanCodePosition { scancodes },
                DataAssociation::ScanCodePosition {
                    scancodes: new_codes,
                },
            ) => {
                if let Some(new_code) = new_codes.first() {
                    for scancode in scancodes {
                        scancode.position.update_positions(&new_code.position);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn unique_keys(&self) -> Vec<(String, Expression)> {
        let mut keys: Vec<(String, Expression)> = vec![];
        match &self.association {
            DataAssociation::Animation { animation, .. } => {
                keys.push((animation.base_str(), Expression::DataAssociation(self.clone())));
            }
            DataAssociation::AnimationFrame { frames, pixels } => {
                for frame in frames {
                    let narrowed = DataAssociationExpression {
                        association: DataAssociation::AnimationFrame {
                            frames: vec![frame.clone()],
                            pixels: pixels.clone(),
                        },
                    };
                    keys.push((format!("{}", frame), Expression::DataAssociation(narrowed)));
                }
            }
            DataAssociation::PixelPosition { pixels } => {
                for pixel in pixels {
                    let narrowed = DataAssociationExpression {
                        association: DataAssociation::PixelPosition {
                            pixels: vec![pixel.clone()],
                        },
                    };
                    keys.push((pixel.unique_key(), Expression::DataAssociation(narrowed)));
                }
            }
            DataAssociation::ScanCodePosition { scancodes } => {
                for scancode in scancodes {
                    let narrowed = DataAssociationExpression {
                        association: DataAssociation::ScanCodePosition {
                            scancodes: vec![scancode.clone()],
                        },
                    };
                    keys.push((
                        format!("S{:03}", scancode.get_uid()),
                        Expression::DataAssociation(narrowed),
                    ));
                }
            }
        }
        dedup_keys(keys)
    }
}

impl fmt::Display for DataAssociationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.association {
            DataAssociation::Animation {
                animation,
                modifiers,
            } => write!(f, "{} <= {};", animation.base_str(), modifiers),
            DataAssociation::AnimationFrame { frames, pixels } => {
                let frames = frames
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                let pixels = pixels
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{} <= {};", frames, pixels)
            }
            DataAssociation::PixelPosition { pixels } => {
                let out = pixels
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                write!(f, "{};", out)
            }
            DataAssociation::ScanCodePosition { scancodes } => {
                let out = scancodes
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                write!(f, "{};", out)
            }
        }
    }
}

// ----- Map expressions (the : family) -----

#[derive(Debug, Clone, PartialEq)]
pub enum PixelChanTarget {
    Scan(ScanCodeId),
    None,
}

impl fmt::Display for PixelChanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan(sc) => write!(f, "{}", sc),
            Self::None => write!(f, "None"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MapKind {
    /// trigger -> result mapping
    TriggerCode,
    /// pixel -> channel composition
    PixelChannel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapExpression {
    pub kind: MapKind,
    /// Trigger variants (expanded from ranges), each a sequence of combos
    pub triggers: Vec<Sequence>,
    pub operator: Operator,
    /// Result variants
    pub results: Vec<Sequence>,
    /// PixelChannel form payload
    pub pixel: Option<PixelId>,
    pub pixel_target: Option<PixelChanTarget>,
    /// Set while the expression belongs to a BaseMap merge; cleared when
    /// merged from any other context kind
    pub base_map: bool,
    pub connect_id: u8,
}

impl MapExpression {
    pub fn trigger_code(triggers: Vec<Sequence>, operator: Operator, results: Vec<Sequence>) -> Self {
        Self {
            kind: MapKind::TriggerCode,
            triggers,
            operator,
            results,
            pixel: None,
            pixel_target: None,
            base_map: false,
            connect_id: 0,
        }
    }

    pub fn pixel_channel(pixel: PixelId, target: PixelChanTarget) -> Self {
        Self {
            kind: MapKind::PixelChannel,
            triggers: vec![],
            operator: Operator::Set,
            results: vec![],
            pixel: Some(pixel),
            pixel_target: Some(target),
            base_map: false,
            connect_id: 0,
        }
    }

    pub fn subtype(&self) -> &'static str {
        match self.kind {
            MapKind::TriggerCode => "TriggerCode",
            MapKind::PixelChannel => "PixelChannel",
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.operator.is_isolated()
    }

    /// Prettified sequences of combos: (S0x010 + S0x011, S0x042)|(...)
    pub fn sequences_str(param: &[Sequence]) -> String {
        let mut out = String::new();
        for (index, sequence) in param.iter().enumerate() {
            if index > 0 {
                out += "|";
            }
            out += "(";
            for (index, combo) in sequence.iter().enumerate() {
                if index > 0 {
                    out += ", ";
                }
                for (index, identifier) in combo.iter().enumerate() {
                    if index > 0 {
                        out += " + ";
                    }
                    out += &identifier.to_string();
                }
            }
            out += ")";
        }
        out
    }

    /// kll rendition, one string per variant
    pub fn sequences_kll(param: &[Sequence]) -> Vec<String> {
        let mut out = vec![String::new()];
        for (index, sequence) in param.iter().enumerate() {
            if index > 0 {
                out.push(String::new());
            }
            for (index, combo) in sequence.iter().enumerate() {
                if index > 0 {
                    *out.last_mut().unwrap() += ", ";
                }
                for (index, identifier) in combo.iter().enumerate() {
                    if index > 0 {
                        *out.last_mut().unwrap() += " + ";
                    }
                    *out.last_mut().unwrap() += &identifier.to_string();
                }
            }
        }
        out
    }

    /// All trigger identifiers across variants; may contain duplicates
    pub fn trigger_id_list(&self) -> Vec<&Identifier> {
        self.triggers.iter().flatten().flatten().collect()
    }

    pub fn trigger_id_list_mut(&mut self) -> Vec<&mut Identifier> {
        self.triggers.iter_mut().flatten().flatten().collect()
    }

    pub fn result_id_list(&self) -> Vec<&Identifier> {
        self.results.iter().flatten().flatten().collect()
    }

    /// (trigger element count, result element count)
    pub fn elems(&self) -> (usize, usize) {
        if self.kind == MapKind::PixelChannel {
            return (0, 0);
        }
        let triggers = self.triggers.iter().flatten().map(|c| c.len()).sum();
        let results = self.results.iter().flatten().map(|c| c.len()).sum();
        (triggers, results)
    }

    pub fn min_trigger_uid(&self) -> u16 {
        let mut min_uid = 0xFFFF;
        for identifier in self.trigger_id_list() {
            if identifier.is_trigger_kind() {
                if let Some(uid) = identifier.get_uid() {
                    if uid < min_uid {
                        min_uid = uid;
                    }
                }
            }
        }
        min_uid
    }

    pub fn max_trigger_uid(&self) -> u16 {
        let mut max_uid = 0;
        for identifier in self.trigger_id_list() {
            if identifier.is_trigger_kind() {
                if let Some(uid) = identifier.get_uid() {
                    if uid > max_uid {
                        max_uid = uid;
                    }
                }
            }
        }
        max_uid
    }

    /// Apply the interconnect scan-code offset to every trigger
    pub fn add_trigger_uid_offset(&mut self, offset: u16) {
        for identifier in self.trigger_id_list_mut() {
            if let Identifier::ScanCode(sc) = identifier {
                sc.updated_uid = Some(sc.uid + offset);
            }
        }
    }

    pub fn trigger_str(&self) -> String {
        if self.kind == MapKind::PixelChannel {
            return format!("{}", self.pixel.as_ref().unwrap());
        }
        Self::sequences_str(&self.triggers)
    }

    pub fn result_str(&self) -> String {
        if self.kind == MapKind::PixelChannel {
            return format!("{}", self.pixel_target.as_ref().unwrap());
        }
        Self::sequences_str(&self.results)
    }

    /// Sortable trigger, first variant only
    pub fn sort_trigger(&self) -> String {
        if self.kind == MapKind::PixelChannel {
            return format!("{}", self.pixel.as_ref().unwrap());
        }
        Self::sequences_kll(&self.triggers)[0].clone()
    }

    /// Sortable result, first variant only
    pub fn sort_result(&self) -> String {
        if self.kind == MapKind::PixelChannel {
            return format!("{}", self.pixel_target.as_ref().unwrap());
        }
        Self::sequences_kll(&self.results)[0].clone()
    }

    pub fn kllify(&self) -> String {
        if self.kind == MapKind::PixelChannel {
            let pixel = self.pixel.as_ref().unwrap();
            let channels = pixel.channels.str_channels();
            return format!(
                "P[{}]({}) : {};",
                match pixel.index() {
                    Some(index) => index.to_string(),
                    None => pixel.unique_key(),
                },
                channels,
                self.pixel_target.as_ref().unwrap()
            );
        }
        format!(
            "{} {} {};",
            Self::sequences_kll(&self.triggers)[0],
            self.operator,
            Self::sequences_kll(&self.results)[0],
        )
    }

    pub fn unique_keys(&self) -> Vec<(String, Expression)> {
        let mut keys: Vec<(String, Expression)> = vec![];

        if self.kind == MapKind::PixelChannel {
            keys.push((
                format!("{}", self.pixel.as_ref().unwrap()),
                Expression::Map(self.clone()),
            ));
            return dedup_keys(keys);
        }

        for (index, sequence) in self.triggers.iter().enumerate() {
            let mut uniq = self.clone();
            if self.triggers.len() > 1 {
                uniq.triggers = vec![self.triggers[index].clone()];
            }

            let mut key = String::new();
            for (index, combo) in sequence.iter().enumerate() {
                if index > 0 {
                    key += ", ";
                }
                for (index, identifier) in combo.iter().enumerate() {
                    if index > 0 {
                        key += " + ";
                    }
                    key += &format!("{} {}", self.connect_id, identifier);
                }
            }
            keys.push((key, Expression::Map(uniq)));
        }
        dedup_keys(keys)
    }
}

impl fmt::Display for MapExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == MapKind::PixelChannel {
            return write!(
                f,
                "{} : {};",
                self.pixel.as_ref().unwrap(),
                self.pixel_target.as_ref().unwrap()
            );
        }
        write!(
            f,
            "{} {} {};",
            Self::sequences_str(&self.triggers),
            self.operator,
            Self::sequences_str(&self.results),
        )
    }
}

// ----- The expression sum type -----

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Assignment(AssignmentExpression),
    NameAssociation(NameAssociationExpression),
    DataAssociation(DataAssociationExpression),
    Map(MapExpression),
}

impl Expression {
    /// (expression class, expression subtype), the organization routing key
    pub fn routing(&self) -> (&'static str, &'static str) {
        match self {
            Self::Assignment(e) => (
                "AssignmentExpression",
                match e.kind {
                    AssignKind::Variable => "Variable",
                    AssignKind::Array => "Array",
                },
            ),
            Self::NameAssociation(e) => ("NameAssociationExpression", e.subtype()),
            Self::DataAssociation(e) => ("DataAssociationExpression", e.subtype()),
            Self::Map(e) => ("MapExpression", e.subtype()),
        }
    }

    pub fn unique_keys(&self) -> Vec<(String, Expression)> {
        match self {
            Self::Assignment(e) => vec![(e.name.clone(), self.clone())],
            Self::NameAssociation(e) => vec![(e.name.clone(), self.clone())],
            Self::DataAssociation(e) => e.unique_keys(),
            Self::Map(e) => e.unique_keys(),
        }
    }

    pub fn kllify(&self) -> String {
        match self {
            Self::Assignment(e) => format!("{}", e),
            Self::NameAssociation(e) => format!("{}", e),
            Self::DataAssociation(e) => {
                // Position associations have a distinct kll form with the
                // kllified ids
                format!("{}", e)
            }
            Self::Map(e) => e.kllify(),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assignment(e) => write!(f, "{}", e),
            Self::NameAssociation(e) => write!(f, "{}", e),
            Self::DataAssociation(e) => write!(f, "{}", e),
            Self::Map(e) => write!(f, "{}", e),
        }
    }
}

/// Drop duplicate keys, keeping first arrival
fn dedup_keys(keys: Vec<(String, Expression)>) -> Vec<(String, Expression)> {
    let mut seen = std::collections::HashSet::new();
    keys.into_iter()
        .filter(|(key, _)| seen.insert(key.clone()))
        .collect()
}
