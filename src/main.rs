//! KLL compiler command line front-end.

use kll::emitters;
use kll::layouts::Layouts;
use kll::stages::{CompilerOptions, ControlStage};
use log::{Level, LevelFilter, Metadata, Record};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "kll", about = "KLL (Keyboard Layout Language) Compiler")]
struct Opts {
    /// Auto-detect context of .kll files, defaults to generic context
    #[structopt(parse(from_os_str))]
    generic: Vec<PathBuf>,

    /// Specify base configuration .kll files, earliest priority
    #[structopt(long = "config", parse(from_os_str))]
    config: Vec<PathBuf>,

    /// Specify base map configuration, applied after config .kll files
    #[structopt(long = "base", parse(from_os_str))]
    base: Vec<PathBuf>,

    /// Specify .kll files to layer on top of the default map (layer 0)
    #[structopt(long = "default", parse(from_os_str))]
    default_files: Vec<PathBuf>,

    /// Specify a .kll file for a partial map; each occurrence defines
    /// another partial layer
    #[structopt(long = "partial", parse(from_os_str), number_of_values = 1)]
    partial: Vec<PathBuf>,

    /// Target emitter for the KLL compiler (kiibohd, kll, none)
    #[structopt(long = "emitter", default_value = "kiibohd")]
    emitter: String,

    /// Max number of threads to use (0 = number of CPUs)
    #[structopt(long = "jobs", default_value = "0")]
    jobs: usize,

    /// Debug colorizer mode (auto, always, never)
    #[structopt(long = "color", default_value = "auto")]
    color: String,

    /// Show the compiler installation path, then exit
    #[structopt(long = "path")]
    path: bool,

    /// Show the layout cache directory, then exit
    #[structopt(long = "layout-cache-path")]
    layout_cache_path: bool,

    /// Re-scan the layout cache, then exit
    #[structopt(long = "layout-cache-refresh")]
    layout_cache_refresh: bool,

    /// Alternate layout directory
    #[structopt(long = "layout-dir", parse(from_os_str))]
    layout_dir: Option<PathBuf>,

    /// Work directory for the preprocessor
    #[structopt(long = "preprocessor-tmp-path", parse(from_os_str))]
    preprocessor_tmp_path: Option<PathBuf>,

    /// Enable debug output in the preprocessor
    #[structopt(long = "preprocessor-debug")]
    preprocessor_debug: bool,

    /// Enable tokenization debug output
    #[structopt(long = "token-debug")]
    token_debug: bool,

    /// Enable parser debug output (serializes to one job)
    #[structopt(long = "parser-debug")]
    parser_debug: bool,

    /// Enable parser-stage token debug output
    #[structopt(long = "parser-token-debug")]
    parser_token_debug: bool,

    /// Show datastructure of each context after filling
    #[structopt(long = "operation-organization-display")]
    operation_organization_display: bool,

    /// Show datastructure of each context after merging
    #[structopt(long = "data-organization-display")]
    data_organization_display: bool,

    /// Show datastructure of each layer after finalization
    #[structopt(long = "data-finalization-display")]
    data_finalization_display: bool,

    /// Show results of data analysis
    #[structopt(long = "data-analysis-display")]
    data_analysis_display: bool,

    /// Specify KLL define .h file template
    #[structopt(long = "def-template", parse(from_os_str))]
    def_template: Option<PathBuf>,

    /// Specify KLL map .h file template
    #[structopt(long = "map-template", parse(from_os_str))]
    map_template: Option<PathBuf>,

    /// Specify USB HID lookup .h file template
    #[structopt(long = "hid-template", parse(from_os_str))]
    hid_template: Option<PathBuf>,

    /// Specify KLL pixel map .c file template
    #[structopt(long = "pixel-template", parse(from_os_str))]
    pixel_template: Option<PathBuf>,

    /// Specify KLL define .h file output
    #[structopt(long = "def-output", parse(from_os_str))]
    def_output: Option<PathBuf>,

    /// Specify KLL map .h file output
    #[structopt(long = "map-output", parse(from_os_str))]
    map_output: Option<PathBuf>,

    /// Specify USB HID lookup .h file output
    #[structopt(long = "hid-output", parse(from_os_str))]
    hid_output: Option<PathBuf>,

    /// Specify KLL pixel map .c file output
    #[structopt(long = "pixel-output", parse(from_os_str))]
    pixel_output: Option<PathBuf>,

    /// Specify json settings dictionary output
    #[structopt(long = "json-output", parse(from_os_str))]
    json_output: Option<PathBuf>,

    /// Target directory for the kll emitter
    #[structopt(long = "target-dir", parse(from_os_str))]
    target_dir: Option<PathBuf>,

    /// Show debug info from the kiibohd emitter
    #[structopt(long = "kiibohd-debug")]
    kiibohd_debug: bool,

    /// Enable kll reconstitution in-file debug output
    #[structopt(long = "output-debug")]
    output_debug: bool,
}

/// Minimal stderr logger mirroring the classic compiler diagnostics
struct StderrLogger {
    color: bool,
}

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let (tag, code) = match record.level() {
            Level::Error => ("ERROR", "\x1b[5;1;31m"),
            Level::Warn => ("WARNING", "\x1b[5;1;33m"),
            Level::Info => ("INFO", "\x1b[1;32m"),
            Level::Debug | Level::Trace => ("DEBUG", "\x1b[1;35m"),
        };
        if self.color {
            eprintln!("{}{}\x1b[0m: {}", code, tag, record.args());
        } else {
            eprintln!("{}: {}", tag, record.args());
        }
    }

    fn flush(&self) {}
}

fn main() {
    let opts = match Opts::from_iter_safe(std::env::args()) {
        Ok(opts) => opts,
        Err(err) if err.kind == structopt::clap::ErrorKind::VersionDisplayed
            || err.kind == structopt::clap::ErrorKind::HelpDisplayed =>
        {
            println!("{}", err.message);
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("{}", err.message);
            std::process::exit(2);
        }
    };

    // Validate before any processing; misuse exits 2
    if !["auto", "always", "never"].contains(&opts.color.as_str()) {
        eprintln!("Invalid color option '{}'", opts.color);
        std::process::exit(2);
    }
    let color = opts.color != "never";

    if !emitters::emitter_list().contains(&opts.emitter.as_str()) {
        eprintln!("Invalid emitter '{}'", opts.emitter);
        eprintln!("Valid emitters: {:?}", emitters::emitter_list());
        std::process::exit(2);
    }

    let debug_requested = opts.preprocessor_debug
        || opts.token_debug
        || opts.parser_debug
        || opts.parser_token_debug
        || opts.kiibohd_debug;
    log::set_boxed_logger(Box::new(StderrLogger { color })).unwrap();
    log::set_max_level(if debug_requested {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    // Introspection flags print and exit
    if opts.path {
        println!("{}", env!("CARGO_MANIFEST_DIR"));
        std::process::exit(0);
    }
    if opts.layout_cache_path || opts.layout_cache_refresh {
        let mut layouts = match &opts.layout_dir {
            Some(dir) => Layouts::from_dir(dir).unwrap_or_default(),
            None => Layouts::new(),
        };
        if opts.layout_cache_refresh {
            if let Err(err) = layouts.refresh() {
                eprintln!("layout refresh failed: {}", err);
                std::process::exit(1);
            }
        }
        println!("{}", layouts.layout_dir.display());
        std::process::exit(0);
    }

    let mut compiler_opts = CompilerOptions {
        emitter: opts.emitter,
        jobs: opts.jobs,
        color,
        generic_files: opts.generic,
        config_files: opts.config,
        base_files: opts.base,
        default_files: opts.default_files,
        partial_files: opts.partial,
        layout_dir: opts.layout_dir,
        preprocessor_debug: opts.preprocessor_debug,
        token_debug: opts.token_debug,
        parser_debug: opts.parser_debug,
        parser_token_debug: opts.parser_token_debug,
        operation_organization_display: opts.operation_organization_display,
        data_organization_display: opts.data_organization_display,
        data_finalization_display: opts.data_finalization_display,
        data_analysis_display: opts.data_analysis_display,
        ..CompilerOptions::default()
    };
    if let Some(path) = opts.preprocessor_tmp_path {
        compiler_opts.preprocessor_tmp_path = path;
    }

    let emitter_opts = &mut compiler_opts.emitter_opts;
    if let Some(path) = opts.def_template {
        emitter_opts.def_template = path;
    }
    if let Some(path) = opts.map_template {
        emitter_opts.map_template = path;
    }
    if let Some(path) = opts.hid_template {
        emitter_opts.hid_template = path;
    }
    if let Some(path) = opts.pixel_template {
        emitter_opts.pixel_template = path;
    }
    if let Some(path) = opts.def_output {
        emitter_opts.def_output = path;
    }
    if let Some(path) = opts.map_output {
        emitter_opts.map_output = path;
    }
    if let Some(path) = opts.hid_output {
        emitter_opts.hid_output = path;
    }
    if let Some(path) = opts.pixel_output {
        emitter_opts.pixel_output = path;
    }
    if let Some(path) = opts.json_output {
        emitter_opts.json_output = path;
    }
    if let Some(path) = opts.target_dir {
        emitter_opts.target_dir = path;
    }
    emitter_opts.kiibohd_debug = opts.kiibohd_debug;
    emitter_opts.output_debug = opts.output_debug;

    let mut control = ControlStage::new(compiler_opts);
    std::process::exit(control.process());
}
