//! Emitter base classes and registry.
//!
//! An emitter converts the analyzed datastructures into output artifacts.
//! The text emitter drives `<|TAG|>` template files, the json emitter
//! serializes a report dictionary, and the file emitter collects plain
//! generated files.

pub mod kiibohd;
pub mod kll;
pub mod none;

use crate::stages::ControlStage;
use log::{error, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("'{0}' does not exist...")]
    MissingTemplate(PathBuf),
    #[error("{0}")]
    Message(String),
}

/// Emitter interface: process the datastructures, write the outputs,
/// report accumulated errors
pub trait Emitter {
    fn process(&mut self, control: &ControlStage) -> Result<(), EmitError>;
    fn output(&mut self) -> Result<(), EmitError>;
    /// False if any error was recorded while emitting
    fn check(&self) -> bool;
}

/// Emitter output configuration (templates and artifact paths)
#[derive(Debug, Clone)]
pub struct EmitterOptions {
    pub def_template: PathBuf,
    pub map_template: PathBuf,
    pub hid_template: PathBuf,
    pub pixel_template: PathBuf,
    pub def_output: PathBuf,
    pub map_output: PathBuf,
    pub hid_output: PathBuf,
    pub pixel_output: PathBuf,
    pub json_output: PathBuf,
    pub target_dir: PathBuf,
    pub kiibohd_debug: bool,
    pub output_debug: bool,
}

impl Default for EmitterOptions {
    fn default() -> Self {
        let template_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates");
        Self {
            def_template: template_dir.join("kiibohdDefs.h"),
            map_template: template_dir.join("kiibohdKeymap.h"),
            hid_template: template_dir.join("kiibohd_usb_hid.h"),
            pixel_template: template_dir.join("kiibohdPixelmap.c"),
            def_output: PathBuf::from("kll_defs.h"),
            map_output: PathBuf::from("generatedKeymap.h"),
            hid_output: PathBuf::from("usb_hid.h"),
            pixel_output: PathBuf::from("generatedPixelmap.c"),
            json_output: PathBuf::from("kll.json"),
            target_dir: PathBuf::from("generated"),
            kiibohd_debug: false,
            output_debug: false,
        }
    }
}

/// Available emitters; kiibohd is the default backend
pub fn emitter_list() -> [&'static str; 3] {
    ["kiibohd", "kll", "none"]
}

/// Run the named emitter against the control stage data.
/// Returns false if the emitter failed or recorded errors.
pub fn run(name: &str, control: &ControlStage) -> bool {
    let opts = control.opts.emitter_opts.clone();
    let mut emitter: Box<dyn Emitter> = match name {
        "kiibohd" => Box::new(kiibohd::Kiibohd::new(opts)),
        "kll" => Box::new(kll::KllEmitter::new(opts)),
        _ => Box::new(none::Drop::default()),
    };

    if let Err(err) = emitter.process(control) {
        error!("{}", err);
        return false;
    }
    if let Err(err) = emitter.output() {
        error!("{}", err);
        return false;
    }
    emitter.check()
}

/// Template-driven text emitter; replaces `<|TAG|>` interpolation points
/// with entries from the fill dictionary
#[derive(Debug, Default)]
pub struct TextEmitter {
    pub fill_dict: BTreeMap<String, String>,
    template: Option<PathBuf>,
}

impl TextEmitter {
    pub fn load_template(&mut self, template: &Path) -> Result<(), EmitError> {
        if !template.is_file() {
            return Err(EmitError::MissingTemplate(template.to_path_buf()));
        }
        self.template = Some(template.to_path_buf());
        Ok(())
    }

    pub fn generate(&self, output_path: &Path) -> Result<(), EmitError> {
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| EmitError::Message("load_template has not been called".to_string()))?;
        let tag = Regex::new(r"<\|([^|>]+)\|>").unwrap();

        let mut output = String::new();
        for line in fs::read_to_string(template)?.lines() {
            match tag.captures(line) {
                Some(caps) => {
                    match self.fill_dict.get(&caps[1]) {
                        Some(fill) => output.push_str(fill),
                        None => warn!("'{}' not found, skipping...", &caps[1]),
                    }
                    output.push('\n');
                }
                None => {
                    output.push_str(line);
                    output.push('\n');
                }
            }
        }
        fs::write(output_path, output)?;
        Ok(())
    }
}

/// JSON report emitter
#[derive(Debug, Default)]
pub struct JsonEmitter {
    pub json_dict: serde_json::Map<String, serde_json::Value>,
}

impl JsonEmitter {
    pub fn generate_json(&self, output_path: &Path) -> Result<(), EmitError> {
        let output = serde_json::Value::Object(self.json_dict.clone());
        fs::write(output_path, serde_json::to_string_pretty(&output).unwrap())?;
        Ok(())
    }
}

/// Collects generated files and writes them in one pass
#[derive(Debug, Default)]
pub struct FileEmitter {
    pub output_files: Vec<(String, String)>,
}

impl FileEmitter {
    pub fn generate(&self, output_path: &Path) -> Result<(), EmitError> {
        for (name, contents) in &self.output_files {
            fs::write(output_path.join(name), contents)?;
        }
        Ok(())
    }
}
