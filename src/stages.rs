// Copyright 2021-2022 Jacob Alexander
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compiler stage definitions.
//!
//! Ten stages run in fixed order, each reading the results of earlier
//! stages through the shared [`ControlStage`] and writing only its own
//! fields. The controller stops at the first stage that does not complete.

use crate::context::{Context, ContextKind, MergeContext};
use crate::emitters;
use crate::emitters::EmitterOptions;
use crate::expression::{Expression, MapExpression};
use crate::layouts::{Layout, Layouts};
use crate::parser;
use crate::types::{
    AnimationId, AnimationModifierList, Identifier, LayerKind, ScheduleParam,
    TRIGGER_IDCODE_ROTATION,
};
use log::{debug, error, warn};
use rayon::prelude::*;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Queued,
    Running,
    Completed,
    Incomplete,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Incomplete => write!(f, "Incomplete"),
        }
    }
}

/// Compiler configuration gathered from the command line
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub emitter: String,
    pub jobs: usize,
    pub color: bool,
    pub generic_files: Vec<PathBuf>,
    pub config_files: Vec<PathBuf>,
    pub base_files: Vec<PathBuf>,
    pub default_files: Vec<PathBuf>,
    /// One partial layer per entry
    pub partial_files: Vec<PathBuf>,
    pub layout_dir: Option<PathBuf>,
    pub preprocessor_tmp_path: PathBuf,
    pub preprocessor_debug: bool,
    pub token_debug: bool,
    pub parser_debug: bool,
    pub parser_token_debug: bool,
    pub operation_organization_display: bool,
    pub data_organization_display: bool,
    pub data_finalization_display: bool,
    pub data_analysis_display: bool,
    pub emitter_opts: EmitterOptions,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            emitter: "kiibohd".to_string(),
            jobs: 0,
            color: true,
            generic_files: vec![],
            config_files: vec![],
            base_files: vec![],
            default_files: vec![],
            partial_files: vec![],
            layout_dir: None,
            preprocessor_tmp_path: std::env::temp_dir().join("kll"),
            preprocessor_debug: false,
            token_debug: false,
            parser_debug: false,
            parser_token_debug: false,
            operation_organization_display: false,
            data_organization_display: false,
            data_finalization_display: false,
            data_analysis_display: false,
            emitter_opts: EmitterOptions::default(),
        }
    }
}

/// Imported KLL file with its assigned context role
#[derive(Debug, Clone)]
pub struct KllFile {
    pub path: PathBuf,
    pub kind: ContextKind,
    pub data: String,
    pub connect_id: Option<u8>,
    pub hid_mapping_name: Option<String>,
}

impl KllFile {
    pub fn new(path: PathBuf, kind: ContextKind) -> Self {
        Self {
            path,
            kind,
            data: String::new(),
            connect_id: None,
            hid_mapping_name: None,
        }
    }

    pub fn check(&self) -> bool {
        let exists = self.path.is_file();
        if !exists {
            error!("{} does not exist...", self.path.display());
        }
        exists
    }

    pub fn read(&mut self) -> bool {
        match fs::read_to_string(&self.path) {
            Ok(data) => {
                self.data = data;
                true
            }
            Err(err) => {
                error!("Failed to read '{}': {}", self.path.display(), err);
                false
            }
        }
    }

    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Physical placement plus the pixel/scan-code cross links
#[derive(Debug, Clone, Default)]
pub struct PhysicalEntry {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub pixel: Option<usize>,
    pub scancode: Option<u16>,
}

/// Reconciled animation settings entry
#[derive(Debug, Clone)]
pub struct AnimationSetting {
    pub name: String,
    pub modifiers: AnimationModifierList,
}

/// One distinct schedule encountered in any trigger or result
#[derive(Debug, Clone, Default)]
pub struct ScheduleEntry {
    pub params: Option<Vec<ScheduleParam>>,
    pub layer_kind: Option<LayerKind>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayParams {
    pub columns: usize,
    pub rows: usize,
}

/// Everything the analysis stage derives for the emitters
#[derive(Debug, Default)]
pub struct AnalysisData {
    pub reduced_contexts: Vec<MergeContext>,
    pub min_scan_code: Vec<u16>,
    pub max_scan_code: Vec<u16>,
    /// One entry per unique kll string
    pub trigger_index: Vec<MapExpression>,
    /// Deduplicated on the trigger string alone; the array the firmware's
    /// trigger-match engine walks
    pub trigger_index_reduced: Vec<MapExpression>,
    pub result_index: Vec<MapExpression>,
    pub trigger_index_lookup: BTreeMap<String, usize>,
    pub trigger_index_reduced_lookup: BTreeMap<String, usize>,
    pub result_index_lookup: BTreeMap<String, usize>,
    /// Per layer, per scan code: indices into trigger_index
    pub trigger_lists: Vec<Vec<Option<Vec<usize>>>>,
    /// Rotary encoder wrap points
    pub rotation_map: BTreeMap<u16, i64>,
    pub scancode_positions: BTreeMap<u16, PhysicalEntry>,
    pub pixel_positions: BTreeMap<usize, PhysicalEntry>,
    pub pixel_display_mapping: Vec<Vec<usize>>,
    pub pixel_display_params: DisplayParams,
    pub animation_settings: BTreeMap<String, AnimationSetting>,
    pub animation_settings_orig: BTreeMap<String, String>,
    pub animation_settings_list: Vec<String>,
    pub animation_uid_lookup: BTreeMap<String, u16>,
    /// Distinct schedules, keyed by schedule string; index order is the
    /// sorted key order
    pub schedule_list: BTreeMap<String, ScheduleEntry>,
    pub utf8_strings: Vec<String>,
}

impl AnalysisData {
    pub fn schedule_index(&self, key: &str) -> Option<usize> {
        self.schedule_list.keys().position(|k| k == key)
    }

    pub fn utf8_index(&self, text: &str) -> Option<usize> {
        self.utf8_strings.iter().position(|s| s == text)
    }
}

/// Top-level stage: controls the order in which each stage is processed
pub struct ControlStage {
    pub opts: CompilerOptions,
    pub version: String,
    pub statuses: Vec<(&'static str, Status)>,
    pub pool: Option<rayon::ThreadPool>,
    pub layouts: Layouts,
    pub kll_files: Vec<KllFile>,
    pub contexts: Vec<Context>,
    /// Per connect id, discovered by the preprocessor
    pub min_scan_code: Vec<u16>,
    pub max_scan_code: Vec<u16>,
    pub interconnect_scancode_offsets: Vec<u16>,
    /// Merged context per role group
    pub organized: BTreeMap<String, MergeContext>,
    pub base_context: MergeContext,
    pub default_context: MergeContext,
    pub partial_contexts: Vec<MergeContext>,
    pub full_context: MergeContext,
    /// default + partials, indexed by keyboard layer
    pub layer_contexts: Vec<MergeContext>,
    pub analysis: AnalysisData,
}

type StageFn = fn(&mut ControlStage) -> Result<(), StageError>;

const STAGES: [(&str, StageFn); 10] = [
    ("CompilerConfigurationStage", ControlStage::compiler_configuration),
    ("FileImportStage", ControlStage::file_import),
    ("PreprocessorStage", ControlStage::preprocessor),
    ("OperationClassificationStage", ControlStage::operation_classification),
    ("OperationSpecificsStage", ControlStage::operation_specifics),
    ("OperationOrganizationStage", ControlStage::operation_organization),
    ("DataOrganizationStage", ControlStage::data_organization),
    ("DataFinalizationStage", ControlStage::data_finalization),
    ("DataAnalysisStage", ControlStage::data_analysis),
    ("CodeGenerationStage", ControlStage::code_generation),
];

impl ControlStage {
    pub fn new(opts: CompilerOptions) -> Self {
        Self {
            opts,
            version: env!("CARGO_PKG_VERSION").to_string(),
            statuses: STAGES.iter().map(|(name, _)| (*name, Status::Queued)).collect(),
            pool: None,
            layouts: Layouts::new(),
            kll_files: vec![],
            contexts: vec![],
            min_scan_code: vec![0],
            max_scan_code: vec![0],
            interconnect_scancode_offsets: vec![0],
            organized: BTreeMap::new(),
            base_context: MergeContext::default(),
            default_context: MergeContext::default(),
            partial_contexts: vec![],
            full_context: MergeContext::default(),
            layer_contexts: vec![],
            analysis: AnalysisData::default(),
        }
    }

    /// Run every stage in order; each must complete before the next one
    /// begins. Returns the process exit code.
    pub fn process(&mut self) -> i32 {
        for index in 0..STAGES.len() {
            let (name, stage) = STAGES[index];
            self.statuses[index].1 = Status::Running;
            match stage(self) {
                Ok(()) => self.statuses[index].1 = Status::Completed,
                Err(err) => {
                    self.statuses[index].1 = Status::Incomplete;
                    error!("{}", err);
                    error!("Invalid stage status 'Incomplete' for '{}'.", name);
                    return 1;
                }
            }
        }
        0
    }

    fn pool(&self) -> &rayon::ThreadPool {
        self.pool.as_ref().unwrap()
    }

    // ----- Stage 1: compiler configuration -----

    fn compiler_configuration(&mut self) -> Result<(), StageError> {
        if !emitters::emitter_list().contains(&self.opts.emitter.as_str()) {
            return Err(StageError::Message(format!(
                "Invalid emitter '{}', valid emitters: {:?}",
                self.opts.emitter,
                emitters::emitter_list()
            )));
        }

        // Parser failure traces are not thread safe
        let jobs = if self.opts.parser_debug { 1 } else { self.opts.jobs };
        let mut builder = rayon::ThreadPoolBuilder::new();
        if jobs > 0 {
            builder = builder.num_threads(jobs);
        }
        self.pool = Some(
            builder
                .build()
                .map_err(|err| StageError::Message(err.to_string()))?,
        );

        self.layouts = match &self.opts.layout_dir {
            Some(dir) => Layouts::from_dir(dir)?,
            None => {
                let mut layouts = Layouts::new();
                layouts.refresh()?;
                layouts
            }
        };
        Ok(())
    }

    // ----- Stage 2: file import -----

    fn file_import(&mut self) -> Result<(), StageError> {
        let opts = &self.opts;
        let mut files = vec![];
        for path in &opts.generic_files {
            files.push(KllFile::new(path.clone(), ContextKind::Generic));
        }
        for path in &opts.config_files {
            files.push(KllFile::new(path.clone(), ContextKind::Configuration));
        }
        for path in &opts.base_files {
            files.push(KllFile::new(path.clone(), ContextKind::BaseMap));
        }
        for path in &opts.default_files {
            files.push(KllFile::new(path.clone(), ContextKind::DefaultMap));
        }
        for (layer, path) in opts.partial_files.iter().enumerate() {
            files.push(KllFile::new(path.clone(), ContextKind::PartialMap(layer)));
        }

        if files.iter().any(|file| !file.check()) {
            return Err(StageError::Message("missing input files".to_string()));
        }

        let ok: Vec<bool> = self
            .pool()
            .install(|| files.par_iter_mut().map(|file| file.read()).collect());
        if ok.contains(&false) {
            return Err(StageError::Message("failed to read input files".to_string()));
        }

        self.kll_files = files;
        Ok(())
    }

    // ----- Stage 3: preprocessor -----

    fn preprocessor(&mut self) -> Result<(), StageError> {
        let directive =
            Regex::new(r"^\s*(HIDMapping|ScanCodeOffset|ConnectId)\s*=\s*([A-Za-z_0-9]+)\s*;")
                .unwrap();
        let scancode = Regex::new(r"S((?:0x[0-9a-fA-F]+)|(?:[0-9]+))\s*:").unwrap();
        let layout_list = self.layouts.list_layouts();

        // First pass: learn per-connect-id scan code ranges and per-file
        // metadata. The current connect id carries across files in
        // command-line order.
        let mut current_id: usize = 0;
        self.min_scan_code = vec![0];
        self.max_scan_code = vec![0];
        for file in &mut self.kll_files {
            for line in file.data.lines() {
                if let Some(caps) = directive.captures(line) {
                    match &caps[1] {
                        "HIDMapping" => {
                            let name = caps[2].to_string();
                            if !layout_list.contains(&name) {
                                return Err(StageError::Message(format!(
                                    "{}: unknown HIDMapping '{}', available: {:?}",
                                    file.path.display(),
                                    name,
                                    layout_list
                                )));
                            }
                            file.hid_mapping_name = Some(name);
                        }
                        "ConnectId" => {
                            if let Ok(id) = caps[2].parse::<usize>() {
                                current_id = id;
                                file.connect_id = Some(id as u8);
                                while self.min_scan_code.len() <= current_id {
                                    self.min_scan_code.push(u16::MAX);
                                }
                                while self.max_scan_code.len() <= current_id {
                                    self.max_scan_code.push(0);
                                }
                            }
                        }
                        // Fixed per-file offset folded into the ranges
                        "ScanCodeOffset" => {}
                        _ => {}
                    }
                }
                if let Some(caps) = scancode.captures(line) {
                    let code = parser::parse_int(&caps[1]) as u16;
                    if code < self.min_scan_code[current_id] {
                        self.min_scan_code[current_id] = code;
                    }
                    if code > self.max_scan_code[current_id] {
                        self.max_scan_code[current_id] = code;
                    }
                }
            }
        }

        // Cumulative offsets: offset[i] = sum of max scan codes before i
        self.interconnect_scancode_offsets = vec![];
        let mut previous_max = 0u16;
        for max in &self.max_scan_code {
            self.interconnect_scancode_offsets.push(previous_max);
            previous_max += max;
        }
        self.interconnect_scancode_offsets.push(previous_max);

        if self.opts.preprocessor_debug {
            debug!("Preprocessor Min ScanCodes: {:?}", self.min_scan_code);
            debug!("Preprocessor Max ScanCodes: {:?}", self.max_scan_code);
            debug!(
                "Preprocessor ScanCode offsets: {:?}",
                self.interconnect_scancode_offsets
            );
        }

        // Mirror the processed files to the scratch directory
        self.export_processed_files()?;

        // Seed contexts. BaseMap files inherit the running connect id;
        // every other context is node 0.
        let mut current_id = 0u8;
        let mut contexts = vec![];
        for file in &self.kll_files {
            let connect_id = if file.kind == ContextKind::BaseMap {
                if let Some(id) = file.connect_id {
                    current_id = id;
                }
                current_id
            } else {
                0
            };

            let locale_name = file.hid_mapping_name.as_deref().unwrap_or("default");
            let locale: Arc<Layout> = Arc::new(
                self.layouts
                    .get_layout(locale_name)
                    .cloned()
                    .unwrap_or_else(|| self.layouts.default_layout().clone()),
            );

            let mut context = Context::new(file.kind, file.path.clone(), locale);
            context.data = file.data.clone();
            context.connect_id = connect_id;
            contexts.push(context);
        }
        self.contexts = contexts;
        Ok(())
    }

    fn export_processed_files(&self) -> Result<(), StageError> {
        let dir = &self.opts.preprocessor_tmp_path;
        fs::create_dir_all(dir)?;

        let paths: Vec<String> = self
            .kll_files
            .iter()
            .map(|f| f.path.parent().unwrap_or(Path::new("")).to_string_lossy().to_string())
            .collect();
        let common = common_prefix(&paths);

        for file in &self.kll_files {
            let parent = file
                .path
                .parent()
                .unwrap_or(Path::new(""))
                .to_string_lossy()
                .to_string();
            let prefix = parent
                .strip_prefix(&common)
                .unwrap_or(&parent)
                .replace(['/', '\\'], "_");
            let base = file.filename();
            let (stem, ext) = match base.rsplit_once('.') {
                Some((stem, ext)) => (stem.to_string(), ext.to_string()),
                None => (base.clone(), "kll".to_string()),
            };
            let processed = format!("{}@{}_processed.{}", prefix, stem, ext);
            let output = dir.join(processed);
            if self.opts.preprocessor_debug {
                debug!("Processed filename: {}", output.display());
            }
            fs::write(&output, &file.data)?;
        }
        Ok(())
    }

    // ----- Stage 4: operation classification -----

    fn operation_classification(&mut self) -> Result<(), StageError> {
        let pool = self.pool.as_ref().unwrap();
        let contexts = &mut self.contexts;
        let results: Vec<Option<String>> = pool.install(|| {
            contexts
                .par_iter_mut()
                .map(|context| match parser::classify(&context.data) {
                    Ok(raws) => {
                        context.raw_expressions = raws;
                        None
                    }
                    Err(err) => Some(format!(
                        "{}:tokenize -> {}:{}",
                        "OperationClassificationStage",
                        context.path.display(),
                        err
                    )),
                })
                .collect()
        });

        let mut failed = false;
        for message in results.into_iter().flatten() {
            error!("{}", message);
            failed = true;
        }
        if failed {
            return Err(StageError::Message("classification failed".to_string()));
        }
        Ok(())
    }

    // ----- Stage 5: operation specifics -----

    fn operation_specifics(&mut self) -> Result<(), StageError> {
        let token_debug = self.opts.token_debug;
        let parser_debug = self.opts.parser_debug;
        let parser_token_debug = self.opts.parser_token_debug;

        let pool = self.pool.as_ref().unwrap();
        let contexts = &mut self.contexts;
        let results: Vec<bool> = pool.install(|| {
            contexts
                .par_iter_mut()
                .map(|context| {
                    let locale = Arc::clone(&context.hid_mapping);
                    let mut ok = true;
                    for raw in &context.raw_expressions {
                        match parser::parse_raw(raw, &locale) {
                            Ok(expression) => {
                                if token_debug || parser_token_debug {
                                    debug!(
                                        "{}:{}:{} > {}",
                                        context
                                            .path
                                            .file_name()
                                            .map(|f| f.to_string_lossy().to_string())
                                            .unwrap_or_default(),
                                        raw.line,
                                        raw.operator,
                                        raw.regen_str()
                                    );
                                }
                                if parser_debug {
                                    debug!("parsed: {}", expression);
                                }
                                context.expressions.push(expression);
                            }
                            Err(err) => {
                                ok = false;
                                // Re-run the failed expression with verbose
                                // tracing enabled to get the full rule trail
                                for line in parser::parse_trace(raw).lines() {
                                    error!("{}", line);
                                }
                                error!(
                                    "OperationSpecificsStage:parse -> {}:{}",
                                    context.path.display(),
                                    raw.line
                                );
                                error!("Bad kll expression, usually a syntax error.");
                                error!("\t{}", raw.regen_str());
                                error!("{}", err);
                            }
                        }
                    }
                    ok
                })
                .collect()
        });

        if results.contains(&false) {
            return Err(StageError::Message("parsing failed".to_string()));
        }
        Ok(())
    }

    // ----- Stage 6: operation organization -----

    fn operation_organization(&mut self) -> Result<(), StageError> {
        for context in &mut self.contexts {
            // Arrival order within a file must be preserved
            for expression in &context.expressions {
                let mut expression = expression.clone();
                if let Expression::Map(map) = &mut expression {
                    map.connect_id = context.connect_id;
                }
                context.organization.add_expression(&expression);
            }
        }

        if self.opts.operation_organization_display {
            for context in &self.contexts {
                println!("{}:{}", context.path.display(), context.kind);
                print!("{}", context.organization);
            }
        }
        Ok(())
    }

    // ----- Stage 7: data organization -----

    fn data_organization(&mut self) -> Result<(), StageError> {
        // Group like contexts, partial maps by layer
        let mut groups: BTreeMap<String, Vec<&Context>> = BTreeMap::new();
        for context in &self.contexts {
            groups
                .entry(context.kind.group_name())
                .or_default()
                .push(context);
        }

        // Merge each group in command-line order
        let merged: Vec<(String, MergeContext)> = self.pool().install(|| {
            groups
                .par_iter()
                .map(|(name, members)| {
                    let mut merge = MergeContext::from_context(members[0]);
                    for next in &members[1..] {
                        debug!(
                            "=== Merging === {:?} into {:?}",
                            next.kll_files, merge.kll_files
                        );
                        merge.merge_context(next, next.kind);
                    }
                    (name.clone(), merge)
                })
                .collect()
        });
        self.organized = merged.into_iter().collect();

        // Flag BaseMap-originated map expressions; the flag decides what
        // partial-map cleanup may drop later
        if let Some(base) = self.organized.get_mut("BaseMapContext") {
            for exprs in base.organization.mapping_data.data.values_mut() {
                if let Some(first) = exprs.first_mut() {
                    first.base_map = true;
                }
            }
        }

        if self.opts.data_organization_display {
            for (name, context) in &self.organized {
                println!("{}:{:?}", name, context.kll_files);
                print!("{}", context.organization);
            }
        }
        Ok(())
    }

    // ----- Stage 8: data finalization -----

    fn data_finalization(&mut self) -> Result<(), StageError> {
        // Configuration is the lowest priority; Generic stacks on top
        let mut base = match (
            self.organized.get("ConfigurationContext"),
            self.organized.get("GenericContext"),
        ) {
            (Some(configuration), generic) => {
                let mut base = MergeContext::from_merge(configuration);
                if let Some(generic) = generic {
                    base.merge(generic, ContextKind::Generic);
                }
                base
            }
            (None, Some(generic)) => MergeContext::from_merge(generic),
            (None, None) => {
                return Err(StageError::Message(
                    "Missing a 'GenericContext' and/or 'ConfigurationContext'.".to_string(),
                ))
            }
        };

        if let Some(basemap) = self.organized.get("BaseMapContext") {
            base.merge(basemap, ContextKind::BaseMap);
        }

        let mut default = MergeContext::from_merge(&base);
        if let Some(defaultmap) = self.organized.get("DefaultMapContext") {
            default.merge(defaultmap, ContextKind::DefaultMap);
        }

        // Fully merged dataset; mostly needed for variables
        let mut full = MergeContext::from_merge(&default);

        // Partial layers stack on the base, sorted by layer number
        let mut partials = vec![];
        let mut partial_groups: Vec<(usize, &MergeContext)> = self
            .organized
            .iter()
            .filter_map(|(name, context)| {
                name.starts_with("PartialMapContext")
                    .then(|| (context.layer.unwrap_or(0), context))
            })
            .collect();
        partial_groups.sort_by_key(|(layer, _)| *layer);
        for (layer, partial) in partial_groups {
            let mut merged = MergeContext::from_merge(&base);
            merged.merge(partial, ContextKind::PartialMap(layer));
            partials.push(merged);
            full.merge(partial, ContextKind::PartialMap(layer));
        }

        self.layer_contexts = vec![default.clone()];
        self.layer_contexts.extend(partials.iter().cloned());
        self.base_context = base;
        self.default_context = default;
        self.partial_contexts = partials;
        self.full_context = full;

        if self.opts.data_finalization_display {
            for (index, context) in self.layer_contexts.iter().enumerate() {
                println!("*Layer{}:{:?}", index, context.kll_files);
                print!("{}", context.organization);
            }
        }
        Ok(())
    }

    // ----- Stage 9: data analysis -----

    fn data_analysis(&mut self) -> Result<(), StageError> {
        self.reduce_layers();
        self.generate_pixel_display_mapping();
        self.generate_animation_settings();
        self.generate_mapping_indices();
        self.generate_schedule_list();
        self.generate_utf8_strings();
        self.generate_trigger_lists();
        self.generate_rotation_ranges()?;

        if self.opts.data_analysis_display {
            for (index, context) in self.analysis.reduced_contexts.iter().enumerate() {
                println!("*Layer{}:{:?}", index, context.kll_files);
                print!("{}", context.organization);
            }
            println!("Min ScanCode: {:?}", self.analysis.min_scan_code);
            println!("Max ScanCode: {:?}", self.analysis.max_scan_code);
        }
        Ok(())
    }

    /// Reduce each layer: rewrite HID triggers to scan codes, resolve
    /// lazy operators, then drop BaseMap-only expressions from partials
    fn reduce_layers(&mut self) {
        let reduced: Vec<MergeContext> = self.pool().install(|| {
            self.layer_contexts
                .par_iter()
                .map(|layer| {
                    let mut reduced = MergeContext::from_merge(layer);
                    reduced.reduction();
                    reduced
                })
                .collect()
        });
        self.analysis.reduced_contexts = reduced;

        // Layer 0 is the default map, nothing to clean up there
        for layer in self.analysis.reduced_contexts.iter_mut().skip(1) {
            layer.cleanup();
        }
    }

    fn generate_mapping_indices(&mut self) {
        let offsets = &self.interconnect_scancode_offsets;
        let mut expressions: BTreeMap<String, MapExpression> = BTreeMap::new();

        for (index, layer) in self.analysis.reduced_contexts.iter_mut().enumerate() {
            self.analysis.min_scan_code.push(0xFFFF);
            self.analysis.max_scan_code.push(0);

            for exprs in layer.organization.mapping_data.data.values_mut() {
                for sub_expr in exprs.iter_mut() {
                    let offset = offsets
                        .get(sub_expr.connect_id as usize)
                        .copied()
                        .unwrap_or(0);
                    sub_expr.add_trigger_uid_offset(offset);
                    expressions.insert(sub_expr.kllify(), sub_expr.clone());
                }

                // Triggers are the same across the list, first is enough
                if let Some(first) = exprs.first() {
                    let min_uid = first.min_trigger_uid();
                    if min_uid < self.analysis.min_scan_code[index] {
                        self.analysis.min_scan_code[index] = min_uid;
                    }
                    let max_uid = first.max_trigger_uid();
                    if max_uid > self.analysis.max_scan_code[index] {
                        self.analysis.max_scan_code[index] = max_uid;
                    }
                }
            }

            if self.analysis.min_scan_code[index] == 0xFFFF
                && self.analysis.max_scan_code[index] == 0
            {
                self.analysis.min_scan_code[index] = 0;
            }
        }

        // Sort expressions by trigger and result; duplicate triggers stay,
        // the trigger->result and result->trigger mappings are still needed
        let mut trigger_sorted: BTreeMap<String, MapExpression> = BTreeMap::new();
        let mut trigger_sorted_reduced: BTreeMap<String, MapExpression> = BTreeMap::new();
        let mut result_sorted: BTreeMap<String, MapExpression> = BTreeMap::new();
        for (key, elem) in &expressions {
            trigger_sorted.insert(key.clone(), elem.clone());
            trigger_sorted_reduced
                .entry(elem.trigger_str())
                .or_insert_with(|| elem.clone());
            result_sorted
                .entry(elem.result_str())
                .or_insert_with(|| elem.clone());
        }

        let sort = |map: BTreeMap<String, MapExpression>, key: fn(&MapExpression) -> String| {
            let mut list: Vec<MapExpression> = map.into_values().collect();
            list.sort_by(|a, b| alphanumeric_sort::compare_str(&key(a), &key(b)));
            list
        };
        self.analysis.trigger_index = sort(trigger_sorted, MapExpression::sort_trigger);
        self.analysis.trigger_index_reduced =
            sort(trigger_sorted_reduced, MapExpression::sort_trigger);
        self.analysis.result_index = sort(result_sorted, MapExpression::sort_result);

        self.analysis.trigger_index_lookup = self
            .analysis
            .trigger_index
            .iter()
            .enumerate()
            .map(|(index, expr)| (expr.kllify(), index))
            .collect();
        self.analysis.trigger_index_reduced_lookup = self
            .analysis
            .trigger_index_reduced
            .iter()
            .enumerate()
            .map(|(index, expr)| (expr.sort_trigger(), index))
            .collect();
        self.analysis.result_index_lookup = self
            .analysis
            .result_index
            .iter()
            .enumerate()
            .map(|(index, expr)| (expr.sort_result(), index))
            .collect();
    }

    /// Trigger list per layer: for every scan code, the list of trigger
    /// macros it may initiate
    fn generate_trigger_lists(&mut self) {
        for (index, layer) in self.analysis.reduced_contexts.iter().enumerate() {
            let mut list: Vec<Option<Vec<usize>>> =
                vec![None; self.analysis.max_scan_code[index] as usize + 1];

            for exprs in layer.organization.mapping_data.data.values() {
                for sub_expr in exprs {
                    let Some(&trigger_index) =
                        self.analysis.trigger_index_lookup.get(&sub_expr.kllify())
                    else {
                        continue;
                    };
                    for identifier in sub_expr.trigger_id_list() {
                        let uid = match identifier {
                            Identifier::Animation(anim) => {
                                match self.analysis.animation_uid_lookup.get(&anim.name) {
                                    Some(uid) => *uid,
                                    None => {
                                        warn!("Unknown animation '{}'", anim.name);
                                        continue;
                                    }
                                }
                            }
                            id if id.is_trigger_kind() => match id.get_uid() {
                                Some(uid) => uid,
                                None => continue,
                            },
                            _ => continue,
                        };

                        let slot = uid as usize;
                        if slot >= list.len() {
                            list.resize(slot + 1, None);
                        }
                        match &mut list[slot] {
                            Some(entries) => {
                                if !entries.contains(&trigger_index) {
                                    entries.push(trigger_index);
                                }
                            }
                            none => *none = Some(vec![trigger_index]),
                        }
                    }
                }
            }
            self.analysis.trigger_lists.push(list);
        }
    }

    /// Track the wrap point of each rotary encoder
    fn generate_rotation_ranges(&mut self) -> Result<(), StageError> {
        let mut incomplete = false;
        for layer in &self.analysis.reduced_contexts {
            for exprs in layer.organization.mapping_data.data.values() {
                for sub_expr in exprs {
                    for identifier in sub_expr.trigger_id_list() {
                        let Identifier::Generic(trigger) = identifier else {
                            continue;
                        };
                        if trigger.idcode != TRIGGER_IDCODE_ROTATION {
                            continue;
                        }
                        let entry = self
                            .analysis
                            .rotation_map
                            .entry(trigger.uid)
                            .or_insert(0);
                        let params = trigger.schedule.params.as_deref().unwrap_or(&[]);
                        if params.len() != 1 {
                            error!(
                                "Rotation trigger must have 1 parameter e.g. T[21,1](3): {}",
                                sub_expr
                            );
                            incomplete = true;
                            continue;
                        }
                        if let Some(state) = params[0].state_number() {
                            if state > *entry {
                                *entry = state;
                            }
                        }
                    }
                }
            }
        }
        if incomplete {
            return Err(StageError::Message("invalid rotation triggers".to_string()));
        }
        Ok(())
    }

    /// Place every pixel in a 2D display grid computed from the physical
    /// positions and the Pixel_DisplayMapping_* variables
    fn generate_pixel_display_mapping(&mut self) {
        // Back-fill scan-code -> pixel links via the pixel channel maps
        let channel_maps: Vec<&MapExpression> = self
            .full_context
            .organization
            .pixel_channel_data
            .data
            .values()
            .filter_map(|expr| match expr {
                Expression::Map(map) => Some(map),
                _ => None,
            })
            .collect();

        let mut positions: BTreeMap<usize, PhysicalEntry> = BTreeMap::new();
        let mut scancode_positions: BTreeMap<u16, PhysicalEntry> = BTreeMap::new();

        let mut place = |x: Option<f32>, y: Option<f32>, z: Option<f32>, uid: PixelOrScan| {
            let entry = PhysicalEntry {
                x: x.unwrap_or(0.0),
                y: y.unwrap_or(0.0),
                z: z.unwrap_or(0.0),
                pixel: None,
                scancode: None,
            };
            match uid {
                PixelOrScan::Pixel(uid) => {
                    positions.insert(uid, entry);
                }
                PixelOrScan::Scan(scancode) => {
                    // Resolve the pixel this scan code drives
                    let pixel = channel_maps.iter().find_map(|map| {
                        match (&map.pixel, &map.pixel_target) {
                            (Some(pixel), Some(crate::expression::PixelChanTarget::Scan(sc)))
                                if sc.uid == scancode =>
                            {
                                pixel.index()
                            }
                            _ => None,
                        }
                    });
                    let mut scan_entry = entry.clone();
                    scan_entry.pixel = pixel;
                    scancode_positions.insert(scancode, scan_entry);
                    if let Some(pixel) = pixel {
                        let mut pixel_entry = entry;
                        pixel_entry.scancode = Some(scancode);
                        positions.insert(pixel, pixel_entry);
                    }
                }
            }
        };

        for expr in self
            .full_context
            .organization
            .scan_code_position_data
            .data
            .values()
        {
            if let Expression::DataAssociation(data) = expr {
                if let crate::expression::DataAssociation::ScanCodePosition { scancodes } =
                    &data.association
                {
                    for scancode in scancodes {
                        let pos = &scancode.position;
                        place(pos.x, pos.y, pos.z, PixelOrScan::Scan(scancode.get_uid()));
                    }
                }
            }
        }
        for expr in self
            .full_context
            .organization
            .pixel_position_data
            .data
            .values()
        {
            if let Expression::DataAssociation(data) = expr {
                if let crate::expression::DataAssociation::PixelPosition { pixels } =
                    &data.association
                {
                    for pixel in pixels {
                        match pixel.index() {
                            Some(uid) => {
                                let pos = &pixel.position;
                                place(pos.x, pos.y, pos.z, PixelOrScan::Pixel(uid));
                            }
                            None => match &pixel.uid {
                                crate::types::PixelUid::Scan(sc) => {
                                    let pos = &pixel.position;
                                    place(pos.x, pos.y, pos.z, PixelOrScan::Scan(sc.get_uid()));
                                }
                                _ => {}
                            },
                        }
                    }
                }
            }
        }

        self.analysis.pixel_positions = positions;
        self.analysis.scancode_positions = scancode_positions;

        // Grid parameters
        let unit_size = self.variable_f32("Pixel_DisplayMapping_UnitSize").unwrap_or(1.0);
        let column_size = self.variable_f32("Pixel_DisplayMapping_ColumnSize").unwrap_or(20.0);
        let row_size = self.variable_f32("Pixel_DisplayMapping_RowSize").unwrap_or(20.0);
        let column_direction = self
            .variable_f32("Pixel_DisplayMapping_ColumnDirection")
            .unwrap_or(1.0);
        let row_direction = self
            .variable_f32("Pixel_DisplayMapping_RowDirection")
            .unwrap_or(1.0);

        let mut min = (0.0f32, 0.0f32);
        let mut max = (0.0f32, 0.0f32);
        for entry in self.analysis.pixel_positions.values() {
            min.0 = min.0.min(entry.x);
            min.1 = min.1.min(entry.y);
            max.0 = max.0.max(entry.x);
            max.1 = max.1.max(entry.y);
        }

        let width_val = max.0 - min.0;
        let height_val = max.1 - min.1;
        let height = (height_val / unit_size * column_size).round() as usize + 1;
        let width = (width_val / unit_size * row_size).round() as usize + 1;
        let width_offset = -min.0;
        let height_offset = -min.1;

        self.analysis.pixel_display_params = DisplayParams {
            columns: width,
            rows: height,
        };
        let mut grid = vec![vec![0usize; width]; height];

        for (uid, entry) in &self.analysis.pixel_positions {
            let mut x_percent = if width_val == 0.0 {
                0.0
            } else {
                (entry.x + width_offset) / width_val
            };
            let mut y_percent = if height_val == 0.0 {
                0.0
            } else {
                (entry.y + height_offset) / height_val
            };
            if column_direction < 0.0 {
                y_percent = 1.0 - y_percent;
            }
            if row_direction < 0.0 {
                x_percent = 1.0 - x_percent;
            }

            let x = (x_percent * (width - 1) as f32).round() as usize;
            let y = (y_percent * (height - 1) as f32).round() as usize;

            if grid[y][x] == 0 {
                grid[y][x] = *uid;
            } else {
                warn!(
                    "Cannot fit pixel {} at ({}, {}), already occupied by {}",
                    uid, x, y, grid[y][x]
                );
            }
        }
        self.analysis.pixel_display_mapping = grid;
    }

    /// Reconcile default animation settings with every reference variant
    fn generate_animation_settings(&mut self) {
        let mut default_animations: BTreeMap<String, AnimationModifierList> = BTreeMap::new();

        for (key, expr) in &self.full_context.organization.animation_data.data {
            let Expression::DataAssociation(data) = expr else { continue };
            let crate::expression::DataAssociation::Animation {
                animation,
                modifiers,
            } = &data.association
            else {
                continue;
            };
            let str_name = format!("{}({})", key, modifiers);
            self.analysis.animation_settings.insert(
                str_name.clone(),
                AnimationSetting {
                    name: animation.name.clone(),
                    modifiers: modifiers.clone(),
                },
            );
            self.analysis.animation_settings_list.push(str_name);
            default_animations.insert(key.clone(), modifiers.clone());
        }

        // Every animation referenced from any map result in any layer
        let mut val_list: BTreeMap<String, AnimationId> = BTreeMap::new();
        for layer in &self.layer_contexts {
            for exprs in layer.organization.mapping_data.data.values() {
                for sub_expr in exprs {
                    for identifier in sub_expr.result_id_list() {
                        if let Identifier::Animation(anim) = identifier {
                            val_list.insert(format!("{}", anim), anim.clone());
                        }
                    }
                }
            }
        }

        for (str_name, val) in val_list {
            let lookup_name = format!("A[{}]", val.name);
            match default_animations.get(&lookup_name) {
                None => {
                    // No default, the reference settings stand alone
                    self.analysis.animation_settings.insert(
                        str_name.clone(),
                        AnimationSetting {
                            name: val.name.clone(),
                            modifiers: val.modifiers.clone(),
                        },
                    );
                    self.analysis
                        .animation_settings_orig
                        .insert(str_name.clone(), str_name.clone());
                    self.analysis.animation_settings_list.push(str_name);
                }
                Some(default_mods) => {
                    // Reference wins, defaults fill the gaps
                    let mut merged = val.modifiers.clone();
                    for setting in &default_mods.modifiers {
                        if merged.get_modifier(&setting.name).is_none() {
                            merged.replace(setting.clone());
                        }
                    }
                    self.analysis.animation_settings.insert(
                        str_name.clone(),
                        AnimationSetting {
                            name: val.name.clone(),
                            modifiers: merged,
                        },
                    );
                    self.analysis
                        .animation_settings_orig
                        .insert(str_name.clone(), str_name.clone());
                    if !self.analysis.animation_settings_list.contains(&str_name) {
                        self.analysis.animation_settings_list.push(str_name);
                    }
                }
            }
        }

        // Stable uid per animation name
        for (count, (_, expr)) in self
            .full_context
            .organization
            .animation_data
            .data
            .iter()
            .enumerate()
        {
            if let Expression::DataAssociation(data) = expr {
                if let crate::expression::DataAssociation::Animation { animation, .. } =
                    &data.association
                {
                    self.analysis
                        .animation_uid_lookup
                        .insert(animation.name.clone(), count as u16);
                }
            }
        }
    }

    /// Global sorted set of distinct schedules; index 0-ish entry "" is
    /// the unspecified/generic schedule
    fn generate_schedule_list(&mut self) {
        self.analysis
            .schedule_list
            .insert(String::new(), ScheduleEntry::default());

        let mut collect = |identifier: &Identifier| {
            let key = identifier.str_schedule();
            if key.is_empty() {
                return;
            }
            let layer_kind = match identifier {
                Identifier::Layer(layer) => Some(layer.kind),
                _ => None,
            };
            self.analysis.schedule_list.entry(key).or_insert(ScheduleEntry {
                params: identifier.schedule().and_then(|s| s.params.clone()),
                layer_kind,
            });
        };

        for expr in &self.analysis.trigger_index {
            for identifier in expr.trigger_id_list() {
                collect(identifier);
            }
        }
        for expr in &self.analysis.result_index {
            for identifier in expr.result_id_list() {
                collect(identifier);
            }
        }

        if self.analysis.schedule_list.len() > 255 {
            error!("More than 255 different state schedules are not supported");
        }
    }

    /// Deduplicated UTF-8 string table in discovery order
    fn generate_utf8_strings(&mut self) {
        for expr in &self.analysis.result_index {
            for identifier in expr.result_id_list() {
                if let Identifier::Utf8(utf8) = identifier {
                    if !self.analysis.utf8_strings.contains(&utf8.text) {
                        self.analysis.utf8_strings.push(utf8.text.clone());
                    }
                }
            }
        }
    }

    /// Scalar variable read from the full context
    pub fn variable_f32(&self, name: &str) -> Option<f32> {
        match self.full_context.organization.variable_data.data.get(name) {
            Some(Expression::Assignment(assign)) => assign.value_str().trim().parse().ok(),
            _ => None,
        }
    }

    pub fn variable_str(&self, name: &str) -> Option<String> {
        match self.full_context.organization.variable_data.data.get(name) {
            Some(Expression::Assignment(assign)) => Some(assign.value_str()),
            _ => None,
        }
    }

    pub fn variable_list(&self, name: &str) -> Option<Vec<String>> {
        match self.full_context.organization.variable_data.data.get(name) {
            Some(Expression::Assignment(assign)) => Some(assign.value_list()),
            _ => None,
        }
    }

    // ----- Stage 10: code generation -----

    fn code_generation(&mut self) -> Result<(), StageError> {
        if emitters::run(&self.opts.emitter.clone(), self) {
            Ok(())
        } else {
            Err(StageError::Message(format!(
                "emitter '{}' reported errors",
                self.opts.emitter
            )))
        }
    }
}

enum PixelOrScan {
    Pixel(usize),
    Scan(u16),
}

/// Longest common prefix of a path list
fn common_prefix(paths: &[String]) -> String {
    let Some(first) = paths.first() else {
        return String::new();
    };
    let mut prefix = first.clone();
    for path in &paths[1..] {
        while !path.starts_with(&prefix) {
            prefix.pop();
            if prefix.is_empty() {
                return prefix;
            }
        }
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn logging() {
        let _ = flexi_logger::Logger::with_env_or_str("warn").start();
    }

    fn write_kll(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn run(mut opts: CompilerOptions, scratch: &std::path::Path) -> ControlStage {
        logging();
        opts.preprocessor_tmp_path = scratch.join("kll-scratch");
        let mut control = ControlStage::new(opts);
        assert_eq!(control.process(), 0);
        control
    }

    #[test]
    fn pipeline_reduces_usb_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_kll(
            dir.path(),
            "map.kll",
            "S0x10 : U\"A\";\nU\"A\" : U\"B\";\n",
        );
        let control = run(
            CompilerOptions {
                emitter: "none".to_string(),
                generic_files: vec![file],
                ..CompilerOptions::default()
            },
            dir.path(),
        );

        let analysis = &control.analysis;
        assert_eq!(analysis.trigger_index.len(), 1);
        assert_eq!(analysis.result_index.len(), 1);
        assert_eq!(analysis.trigger_index[0].trigger_str(), "(S0x010)");
        assert_eq!(analysis.result_index[0].result_str(), "(U0x005)");

        // Index pairing: the lookups point back at the same expressions
        let expr = &analysis.trigger_index[0];
        let result_pos = analysis.result_index_lookup[&expr.sort_result()];
        assert_eq!(
            analysis.result_index[result_pos].result_str(),
            expr.result_str()
        );

        // Trigger list slot for the scan code holds the macro index
        assert_eq!(analysis.min_scan_code[0], 0x10);
        assert_eq!(analysis.max_scan_code[0], 0x10);
        assert_eq!(analysis.trigger_lists[0][0x10], Some(vec![0]));
    }

    #[test]
    fn pipeline_rotation_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_kll(
            dir.path(),
            "rot.kll",
            "T[21, 0](5) : U\"A\";\nT[21, 0](9) : U\"B\";\n",
        );
        let control = run(
            CompilerOptions {
                emitter: "none".to_string(),
                generic_files: vec![file],
                ..CompilerOptions::default()
            },
            dir.path(),
        );
        assert_eq!(control.analysis.rotation_map.get(&0), Some(&9));
    }

    #[test]
    fn pipeline_interconnect_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let generic = write_kll(dir.path(), "generic.kll", "Name = interconnect;\n");
        let node0 = write_kll(dir.path(), "node0.kll", "S0x40 : U\"C\";\n");
        let node1 = write_kll(
            dir.path(),
            "node1.kll",
            "ConnectId = 1;\nS0x05 : U\"A\";\n",
        );
        let control = run(
            CompilerOptions {
                emitter: "none".to_string(),
                generic_files: vec![generic],
                base_files: vec![node0, node1],
                ..CompilerOptions::default()
            },
            dir.path(),
        );

        // offset[i] = sum of max scan codes before node i
        assert_eq!(control.max_scan_code, vec![0x40, 0x05]);
        assert_eq!(control.interconnect_scancode_offsets[0], 0);
        assert_eq!(control.interconnect_scancode_offsets[1], 0x40);

        // c.updated_uid == c.uid + cumulative_offset[1]
        let analysis = &control.analysis;
        let offset_pos = analysis
            .trigger_index
            .iter()
            .position(|expr| expr.trigger_str() == "(S0x045)")
            .expect("offset trigger present");
        assert_eq!(analysis.trigger_lists[0][0x45], Some(vec![offset_pos]));
    }

    #[test]
    fn pipeline_partial_layers() {
        let dir = tempfile::tempdir().unwrap();
        let generic = write_kll(dir.path(), "generic.kll", "Name = partials;\n");
        let base = write_kll(dir.path(), "base.kll", "S1 : U\"A\";\nS2 : U\"B\";\n");
        let partial = write_kll(dir.path(), "partial.kll", "S1 : U\"C\";\n");
        let control = run(
            CompilerOptions {
                emitter: "none".to_string(),
                generic_files: vec![generic],
                base_files: vec![base],
                partial_files: vec![partial],
                ..CompilerOptions::default()
            },
            dir.path(),
        );

        let analysis = &control.analysis;
        assert_eq!(analysis.reduced_contexts.len(), 2);
        // The partial layer only keeps its own override; BaseMap-flagged
        // expressions are cleaned up
        let partial_maps = &analysis.reduced_contexts[1].organization.mapping_data.data;
        assert_eq!(partial_maps.len(), 1);
        assert_eq!(
            partial_maps.values().next().unwrap()[0].result_str(),
            "(U0x006)"
        );
        // Layer 0 keeps both
        assert_eq!(
            analysis.reduced_contexts[0]
                .organization
                .mapping_data
                .data
                .len(),
            2
        );
    }

    #[test]
    fn pipeline_schedule_and_utf8_tables() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_kll(
            dir.path(),
            "sched.kll",
            "S1(H:200ms) : U\"A\";\nS2 : u\"caf\u{e9}\";\n",
        );
        let control = run(
            CompilerOptions {
                emitter: "none".to_string(),
                generic_files: vec![file],
                ..CompilerOptions::default()
            },
            dir.path(),
        );

        let analysis = &control.analysis;
        // The generic "" schedule always exists and sorts first
        assert_eq!(analysis.schedule_index(""), Some(0));
        assert!(analysis.schedule_index("H:200ms").is_some());
        assert_eq!(analysis.utf8_strings, vec!["caf\u{e9}".to_string()]);
    }

    #[test]
    fn pipeline_animation_settings() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_kll(
            dir.path(),
            "anim.kll",
            "A[Rainbow] <= loops:3, framedelay:2;\nS1 : A[Rainbow](start, loops:1);\n",
        );
        let control = run(
            CompilerOptions {
                emitter: "none".to_string(),
                generic_files: vec![file],
                ..CompilerOptions::default()
            },
            dir.path(),
        );

        let analysis = &control.analysis;
        assert_eq!(analysis.animation_uid_lookup.get("Rainbow"), Some(&0));
        // Default entry plus the reference variant
        assert_eq!(analysis.animation_settings_list.len(), 2);
        // The reference wins on loops, defaults fill framedelay
        let variant = analysis
            .animation_settings
            .get(&analysis.animation_settings_list[1])
            .unwrap();
        assert!(matches!(
            variant.modifiers.get_modifier("loops"),
            Some(crate::types::AnimationModArg::Number(1))
        ));
        assert!(matches!(
            variant.modifiers.get_modifier("framedelay"),
            Some(crate::types::AnimationModArg::Number(2))
        ));
    }

    #[test]
    fn pipeline_requires_generic_or_configuration() {
        logging();
        let dir = tempfile::tempdir().unwrap();
        let base = write_kll(dir.path(), "base.kll", "S1 : U\"A\";\n");
        let mut control = ControlStage::new(CompilerOptions {
            emitter: "none".to_string(),
            base_files: vec![base],
            preprocessor_tmp_path: dir.path().join("kll-scratch"),
            ..CompilerOptions::default()
        });
        assert_eq!(control.process(), 1);
    }

    #[test]
    fn pipeline_rejects_missing_files() {
        logging();
        let mut control = ControlStage::new(CompilerOptions {
            emitter: "none".to_string(),
            generic_files: vec![PathBuf::from("/does/not/exist.kll")],
            ..CompilerOptions::default()
        });
        assert_eq!(control.process(), 1);
    }

    #[test]
    fn pipeline_halts_on_syntax_error() {
        logging();
        let dir = tempfile::tempdir().unwrap();
        let file = write_kll(dir.path(), "broken.kll", "S1 : U\"A\"\n");
        let mut control = ControlStage::new(CompilerOptions {
            emitter: "none".to_string(),
            generic_files: vec![file],
            preprocessor_tmp_path: dir.path().join("kll-scratch"),
            ..CompilerOptions::default()
        });
        // No terminating ; means classification cannot complete
        assert_eq!(control.process(), 1);
        assert!(control
            .statuses
            .iter()
            .any(|(name, status)| *name == "OperationClassificationStage"
                && *status == Status::Incomplete));
    }

    #[test]
    fn pixel_display_grid_placement() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_kll(
            dir.path(),
            "pixels.kll",
            concat!(
                "Pixel_DisplayMapping_UnitSize = 10;\n",
                "Pixel_DisplayMapping_ColumnSize = 1;\n",
                "Pixel_DisplayMapping_RowSize = 1;\n",
                "Pixel_DisplayMapping_ColumnDirection = 1;\n",
                "Pixel_DisplayMapping_RowDirection = 1;\n",
                "P[1] <= x:0,y:0;\n",
                "P[2] <= x:10,y:0;\n",
                "P[1](3:8) : S1;\n",
                "P[2](6:8) : S2;\n",
                "S1 : U\"A\";\n",
            ),
        );
        let control = run(
            CompilerOptions {
                emitter: "none".to_string(),
                generic_files: vec![file],
                ..CompilerOptions::default()
            },
            dir.path(),
        );

        let analysis = &control.analysis;
        assert_eq!(analysis.pixel_display_params.columns, 2);
        assert_eq!(analysis.pixel_display_params.rows, 1);
        assert_eq!(analysis.pixel_display_mapping[0][0], 1);
        assert_eq!(analysis.pixel_display_mapping[0][1], 2);
    }
}
