//! Locale HID dictionaries.
//!
//! Layout files map HID usage names to codes for the four HID classes and
//! carry the character composition table used by sequence strings. A default
//! locale is bundled so the compiler runs without any external data; more
//! locales are picked up from a layout directory.

use crate::types::HidClass;
use log::{error, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk layout schema
#[derive(Debug, Clone, Deserialize)]
struct LayoutFile {
    name: String,
    #[serde(default)]
    hid_keyboard: BTreeMap<String, String>,
    #[serde(default)]
    hid_consumer: BTreeMap<String, String>,
    #[serde(default)]
    hid_sysctrl: BTreeMap<String, String>,
    #[serde(default)]
    hid_led: BTreeMap<String, String>,
    #[serde(default)]
    composition: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default)]
struct HidTable {
    forward: BTreeMap<String, u16>,
    reverse: BTreeMap<u16, String>,
}

impl HidTable {
    fn build(raw: &BTreeMap<String, String>) -> Self {
        let mut table = Self::default();
        for (name, code) in raw {
            match parse_int(code) {
                Some(uid) => {
                    table.forward.insert(name.to_uppercase(), uid as u16);
                    table.reverse.entry(uid as u16).or_insert_with(|| name.clone());
                }
                None => error!("'{}' is not a valid HID code for '{}'", code, name),
            }
        }
        table
    }
}

/// One locale: forward/reverse dictionaries plus the composer table
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub name: String,
    keyboard: HidTable,
    consumer: HidTable,
    sysctrl: HidTable,
    led: HidTable,
    composition: BTreeMap<String, Vec<String>>,
}

impl Layout {
    fn from_file(file: LayoutFile) -> Self {
        Self {
            name: file.name.clone(),
            keyboard: HidTable::build(&file.hid_keyboard),
            consumer: HidTable::build(&file.hid_consumer),
            sysctrl: HidTable::build(&file.hid_sysctrl),
            led: HidTable::build(&file.hid_led),
            composition: file.composition,
        }
    }

    fn table(&self, class: HidClass) -> &HidTable {
        match class {
            HidClass::Keyboard => &self.keyboard,
            HidClass::Consumer => &self.consumer,
            HidClass::System => &self.sysctrl,
            HidClass::Indicator => &self.led,
        }
    }

    /// Forward lookup, case-insensitive: name -> uid
    pub fn uid(&self, class: HidClass, name: &str) -> Option<u16> {
        self.table(class).forward.get(&name.to_uppercase()).copied()
    }

    /// Reverse lookup: uid -> name
    pub fn name(&self, class: HidClass, uid: u16) -> Option<&str> {
        self.table(class).reverse.get(&uid).map(|s| s.as_str())
    }

    pub fn keyboard_uid(&self, name: &str) -> Option<u16> {
        self.uid(HidClass::Keyboard, name)
    }

    pub fn consumer_uid(&self, name: &str) -> Option<u16> {
        self.uid(HidClass::Consumer, name)
    }

    pub fn sysctrl_uid(&self, name: &str) -> Option<u16> {
        self.uid(HidClass::System, name)
    }

    pub fn led_uid(&self, name: &str) -> Option<u16> {
        self.uid(HidClass::Indicator, name)
    }

    pub fn keyboard_name(&self, uid: u16) -> Option<&str> {
        self.name(HidClass::Keyboard, uid)
    }

    /// True if the uid is a known usage for the class
    pub fn known_uid(&self, class: HidClass, uid: u16) -> bool {
        self.table(class).reverse.contains_key(&uid)
    }

    /// Full reverse table for a class, used by the usb_hid.h defines
    pub fn reverse_table(&self, class: HidClass) -> &BTreeMap<u16, String> {
        &self.table(class).reverse
    }

    /// Compose a sequence string into a sequence of key-name combos.
    ///
    /// 'Ab'  -> [Shift, A], [B]
    /// 'abb' -> [A], [B], [NoEvent], [B]   (clear between repeats)
    ///
    /// With no_clears set (trigger side) the NoEvent clears are skipped.
    pub fn compose(&self, text: &str, no_clears: bool) -> Option<Vec<Vec<String>>> {
        let mut sequence: Vec<Vec<String>> = vec![];
        for ch in text.chars() {
            let combo = match self.composition.get(&ch.to_string()) {
                Some(combo) => combo.clone(),
                None => {
                    warn!("'{}' is not composable in locale '{}'", ch, self.name);
                    return None;
                }
            };
            if !no_clears {
                if let Some(last) = sequence.last() {
                    if last.iter().any(|key| combo.contains(key)) {
                        sequence.push(vec!["NoEvent".to_string()]);
                    }
                }
            }
            sequence.push(combo);
        }
        Some(sequence)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Locale manager; loads the bundled default plus any layout directory
#[derive(Debug, Clone)]
pub struct Layouts {
    pub layout_dir: PathBuf,
    layouts: BTreeMap<String, Layout>,
}

const DEFAULT_LAYOUT: &str = include_str!("../layouts/default.json");

impl Layouts {
    /// Manager seeded with the bundled default locale
    pub fn new() -> Self {
        let mut layouts = BTreeMap::new();
        match serde_json::from_str::<LayoutFile>(DEFAULT_LAYOUT) {
            Ok(file) => {
                let layout = Layout::from_file(file);
                layouts.insert(layout.name.clone(), layout);
            }
            Err(err) => error!("bundled default layout is invalid: {}", err),
        }
        Self {
            layout_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("layouts"),
            layouts,
        }
    }

    /// Load every layout json file from the given directory
    pub fn from_dir(path: &Path) -> std::io::Result<Self> {
        let mut layouts = Self::new();
        layouts.layout_dir = path.to_path_buf();
        layouts.refresh()?;
        Ok(layouts)
    }

    /// Re-scan the layout directory
    pub fn refresh(&mut self) -> std::io::Result<()> {
        if !self.layout_dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.layout_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let data = fs::read_to_string(&path)?;
                match serde_json::from_str::<LayoutFile>(&data) {
                    Ok(file) => {
                        let layout = Layout::from_file(file);
                        self.layouts.insert(layout.name.clone(), layout);
                    }
                    Err(err) => error!("{}: invalid layout file: {}", path.display(), err),
                }
            }
        }
        Ok(())
    }

    pub fn list_layouts(&self) -> Vec<String> {
        self.layouts.keys().cloned().collect()
    }

    pub fn get_layout(&self, name: &str) -> Option<&Layout> {
        self.layouts.get(name)
    }

    pub fn default_layout(&self) -> &Layout {
        self.layouts
            .get("default")
            .or_else(|| self.layouts.values().next())
            .expect("no layouts loaded")
    }
}

impl Default for Layouts {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse 0x-prefixed or decimal integers without panicking on bad data
fn parse_int(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u32>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_layout() -> Layout {
        Layouts::new().default_layout().clone()
    }

    #[test]
    fn forward_lookups_per_class() {
        let layout = default_layout();
        assert_eq!(layout.keyboard_uid("A"), Some(0x04));
        // Case-insensitive
        assert_eq!(layout.keyboard_uid("enter"), Some(0x28));
        assert_eq!(layout.consumer_uid("VolumeUp"), Some(0xE9));
        assert_eq!(layout.sysctrl_uid("Sleep"), Some(0x82));
        assert_eq!(layout.led_uid("CapsLock"), Some(0x02));
        assert_eq!(layout.keyboard_uid("NotAKey"), None);
    }

    #[test]
    fn reverse_lookup() {
        let layout = default_layout();
        assert_eq!(layout.keyboard_name(0x04), Some("A"));
        assert_eq!(layout.keyboard_name(0xFFFF), None);
    }

    #[test]
    fn compose_with_and_without_clears() {
        let layout = default_layout();
        // 'Ab' -> [Shift, A], [B]
        let composed = layout.compose("Ab", true).unwrap();
        assert_eq!(composed.len(), 2);
        assert_eq!(composed[0], vec!["Shift".to_string(), "A".to_string()]);
        // Repeats get a NoEvent clear unless no_clears is set
        let cleared = layout.compose("bb", false).unwrap();
        assert_eq!(cleared.len(), 3);
        assert_eq!(cleared[1], vec!["NoEvent".to_string()]);
        let uncleared = layout.compose("bb", true).unwrap();
        assert_eq!(uncleared.len(), 2);
    }
}
