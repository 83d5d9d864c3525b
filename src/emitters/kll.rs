//! Re-emits KLL files after processing.
//!
//! Every organized context is reconstituted into canonical kll, along with
//! the finalized base/default/partial/final layer stacks. Entries are
//! sorted by their canonical form so the output is stable across runs.

use crate::emitters::{EmitError, Emitter, EmitterOptions, FileEmitter};
use crate::organization::Organization;
use crate::stages::ControlStage;
use log::debug;
use std::fs;

pub struct KllEmitter {
    opts: EmitterOptions,
    files: FileEmitter,
}

impl KllEmitter {
    pub fn new(opts: EmitterOptions) -> Self {
        Self {
            opts,
            files: FileEmitter::default(),
        }
    }

    /// Re-constitute one organization into kll file contents
    fn reconstitute(&self, organization: &Organization) -> String {
        let mut output = String::new();

        for store in organization.data_stores() {
            output += &format!("# {}\n", store.name);
            let mut lines: Vec<String> = store
                .data
                .iter()
                .map(|(key, expr)| {
                    if self.opts.output_debug {
                        format!("{} # {}\n", expr.kllify(), key)
                    } else {
                        format!("{}\n", expr.kllify())
                    }
                })
                .collect();
            lines.sort();
            for line in lines {
                output += &line;
            }
            output += "\n";
        }

        output += "# MappingData\n";
        let mut lines: Vec<String> = vec![];
        for (key, exprs) in &organization.mapping_data.data {
            for expr in exprs {
                if self.opts.output_debug {
                    lines.push(format!("{} # {}\n", expr.kllify(), key));
                } else {
                    lines.push(format!("{}\n", expr.kllify()));
                }
            }
        }
        lines.sort();
        for line in lines {
            output += &line;
        }
        output += "\n";

        output
    }
}

impl Emitter for KllEmitter {
    fn process(&mut self, control: &ControlStage) -> Result<(), EmitError> {
        for (name, context) in &control.organized {
            let contents = self.reconstitute(&context.organization);
            self.files
                .output_files
                .push((format!("{}.kll", name), contents));
        }

        let base = self.reconstitute(&control.base_context.organization);
        self.files.output_files.push(("base.kll".to_string(), base));

        let default = self.reconstitute(&control.default_context.organization);
        self.files
            .output_files
            .push(("default.kll".to_string(), default));

        for (index, partial) in control.partial_contexts.iter().enumerate() {
            let contents = self.reconstitute(&partial.organization);
            self.files
                .output_files
                .push((format!("partial-{}.kll", index), contents));
        }

        let full = self.reconstitute(&control.full_context.organization);
        self.files.output_files.push(("final.kll".to_string(), full));
        Ok(())
    }

    fn output(&mut self) -> Result<(), EmitError> {
        debug!("-- Generating --");
        debug!("{}", self.opts.target_dir.display());
        fs::create_dir_all(&self.opts.target_dir)?;
        self.files.generate(&self.opts.target_dir)?;
        Ok(())
    }

    fn check(&self) -> bool {
        true
    }
}
