//! KLL context definitions.
//!
//! Each source file is assigned one context role on the command line:
//! Generic (auto-detected), Configuration, BaseMap, DefaultMap or
//! PartialMap. Merging contexts of like roles, then stacking the roles,
//! produces the per-layer [`MergeContext`]s the analysis works on.

use crate::expression::Expression;
use crate::layouts::Layout;
use crate::organization::Organization;
use crate::parser::RawExpression;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextKind {
    Generic,
    Configuration,
    BaseMap,
    DefaultMap,
    PartialMap(usize),
}

impl ContextKind {
    /// Group name used when merging like contexts; partial maps group by
    /// name and layer number
    pub fn group_name(&self) -> String {
        match self {
            Self::Generic => "GenericContext".to_string(),
            Self::Configuration => "ConfigurationContext".to_string(),
            Self::BaseMap => "BaseMapContext".to_string(),
            Self::DefaultMap => "DefaultMapContext".to_string(),
            Self::PartialMap(layer) => format!("PartialMapContext{}", layer),
        }
    }

    pub fn layer(&self) -> Option<usize> {
        match self {
            Self::PartialMap(layer) => Some(*layer),
            _ => None,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.group_name())
    }
}

/// One file's worth of KLL data and its organization
#[derive(Debug, Clone)]
pub struct Context {
    pub kind: ContextKind,
    pub path: PathBuf,
    pub kll_files: Vec<String>,
    pub data: String,
    pub raw_expressions: Vec<RawExpression>,
    pub expressions: Vec<Expression>,
    pub organization: Organization,
    pub layer: Option<usize>,
    pub connect_id: u8,
    pub hid_mapping: Arc<Layout>,
}

impl Context {
    pub fn new(kind: ContextKind, path: PathBuf, hid_mapping: Arc<Layout>) -> Self {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            kind,
            path,
            kll_files: vec![filename],
            data: String::new(),
            raw_expressions: vec![],
            expressions: vec![],
            organization: Organization::default(),
            layer: kind.layer(),
            connect_id: 0,
            hid_mapping,
        }
    }

    /// Text label for which layer this is
    pub fn layer_info(&self) -> String {
        match self.layer {
            None => "0".to_string(),
            Some(layer) => format!("{}", layer + 1),
        }
    }
}

/// A merged context; references the files of every context merged in
#[derive(Debug, Clone, Default)]
pub struct MergeContext {
    pub kll_files: Vec<String>,
    pub layer: Option<usize>,
    pub organization: Organization,
}

impl MergeContext {
    pub fn from_context(base: &Context) -> Self {
        Self {
            kll_files: base.kll_files.clone(),
            layer: base.layer,
            organization: base.organization.clone(),
        }
    }

    pub fn from_merge(base: &MergeContext) -> Self {
        base.clone()
    }

    /// Merge a single context in
    pub fn merge_context(&mut self, merge_in: &Context, map_type: ContextKind) {
        self.kll_files.extend(merge_in.kll_files.iter().cloned());
        if merge_in.layer.is_some() {
            self.layer = merge_in.layer;
        }
        self.organization.merge(&merge_in.organization, map_type);
    }

    /// Merge another merged context in
    pub fn merge(&mut self, merge_in: &MergeContext, map_type: ContextKind) {
        self.kll_files.extend(merge_in.kll_files.iter().cloned());
        if merge_in.layer.is_some() {
            self.layer = merge_in.layer;
        }
        self.organization.merge(&merge_in.organization, map_type);
    }

    /// Drop still-flagged BaseMap expressions after a partial merge
    pub fn cleanup(&mut self) {
        self.organization.cleanup();
    }

    /// Simplify the datastructures; context is lost, so reduce a copy
    pub fn reduction(&mut self) {
        self.organization.reduction();
    }

    /// Short-form list of files that built this context
    pub fn files(&self) -> &[String] {
        &self.kll_files
    }
}
