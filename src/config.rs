//! Run configuration.
//!
//! Three layers feed a run: the metadata JSON, the `key:value` config file, and
//! CLI flags, merged in that order so later layers win. The merged layer is then
//! validated once, before any patch is executed; every problem found there is a
//! configuration error and aborts the run.
use crate::cli::{ConfigArgs, RunArgs};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchMode {
    Rewrite,
    Compile,
    #[default]
    Gdb,
}

impl FromStr for PatchMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "rewrite" => Ok(Self::Rewrite),
            "compile" => Ok(Self::Compile),
            "gdb" => Ok(Self::Gdb),
            other => Err(anyhow!(
                "invalid patch_mode {other:?} (expected rewrite, compile, or gdb)"
            )),
        }
    }
}

impl fmt::Display for PatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rewrite => "rewrite",
            Self::Compile => "compile",
            Self::Gdb => "gdb",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecMode {
    Sequential,
    SemiParallel,
    #[default]
    Parallel,
}

impl ExecMode {
    /// Worker threads for this mode on a host with `cores` CPUs.
    pub fn worker_count(self, cores: usize) -> usize {
        let cores = cores.max(1);
        match self {
            Self::Sequential => 1,
            Self::SemiParallel => (cores / 2).max(1),
            Self::Parallel => cores,
        }
    }
}

impl FromStr for ExecMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "0" | "sequential" => Ok(Self::Sequential),
            "1" | "semi-parallel" => Ok(Self::SemiParallel),
            "2" | "parallel" => Ok(Self::Parallel),
            other => Err(anyhow!(
                "invalid exec_mode {other:?} (expected sequential, semi-parallel, parallel, or 0-2)"
            )),
        }
    }
}

/// Metadata JSON handed over by the surrounding repair pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub binary_path: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub build_script: Option<PathBuf>,
    pub config_script: Option<PathBuf>,
    pub pub_test_script: Option<PathBuf>,
    pub pvt_test_script: Option<PathBuf>,
    pub adv_test_script: Option<PathBuf>,
    pub failing_test: Vec<String>,
    pub patch_dir: Option<PathBuf>,
    pub patch_file: Option<PathBuf>,
    pub test_oracle: Option<PathBuf>,
}

/// One configuration source; `None` means "not set here".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    pub binary: Option<PathBuf>,
    pub source_file: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub patch_dir: Option<PathBuf>,
    pub patch_file: Option<PathBuf>,
    pub test_ids: Option<Vec<String>>,
    pub test_oracle: Option<PathBuf>,
    pub test_suite: Option<PathBuf>,
    pub pub_test_script: Option<PathBuf>,
    pub pvt_test_script: Option<PathBuf>,
    pub adv_test_script: Option<PathBuf>,
    pub build_script: Option<PathBuf>,
    pub config_script: Option<PathBuf>,
    pub patch_command: Option<String>,
    pub patch_script: Option<PathBuf>,
    pub reset_command: Option<String>,
    pub reset_script: Option<PathBuf>,
    pub patch_mode: Option<String>,
    pub exec_mode: Option<String>,
    pub timeout_minutes: Option<u64>,
    pub test_timeout_secs: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub limit: Option<usize>,
    pub per_dir_limit: Option<usize>,
    pub tag: Option<String>,
    pub debug: Option<bool>,
    pub partition: Option<bool>,
    pub only_validate: Option<bool>,
    pub trace_distance: Option<bool>,
    pub e9_plugin_dir: Option<PathBuf>,
}

macro_rules! overlay_fields {
    ($base:ident, $top:ident, $($field:ident),+ $(,)?) => {
        $(
            if $top.$field.is_some() {
                $base.$field = $top.$field;
            }
        )+
    };
}

impl ConfigLayer {
    /// Apply `top` over `self`; fields set in `top` win.
    pub fn overlay(mut self, top: ConfigLayer) -> ConfigLayer {
        overlay_fields!(
            self,
            top,
            binary,
            source_file,
            source_dir,
            output_dir,
            patch_dir,
            patch_file,
            test_ids,
            test_oracle,
            test_suite,
            pub_test_script,
            pvt_test_script,
            adv_test_script,
            build_script,
            config_script,
            patch_command,
            patch_script,
            reset_command,
            reset_script,
            patch_mode,
            exec_mode,
            timeout_minutes,
            test_timeout_secs,
            task_timeout_secs,
            limit,
            per_dir_limit,
            tag,
            debug,
            partition,
            only_validate,
            trace_distance,
            e9_plugin_dir,
        );
        self
    }

    pub fn from_metadata(meta: Metadata) -> Self {
        Self {
            binary: meta.binary_path,
            source_dir: meta.source_dir,
            build_script: meta.build_script,
            config_script: meta.config_script,
            pub_test_script: meta.pub_test_script,
            pvt_test_script: meta.pvt_test_script,
            adv_test_script: meta.adv_test_script,
            test_ids: (!meta.failing_test.is_empty()).then_some(meta.failing_test),
            patch_dir: meta.patch_dir,
            patch_file: meta.patch_file,
            test_oracle: meta.test_oracle,
            ..Self::default()
        }
    }

    pub fn from_config_args(args: &ConfigArgs) -> Result<Self> {
        Ok(Self {
            binary: args.binary.clone(),
            source_file: args.source_file.clone(),
            source_dir: args.source_dir.clone(),
            output_dir: args.output_dir.clone(),
            patch_dir: args.patch_dir.clone(),
            patch_file: args.patch_file.clone(),
            test_ids: args
                .test_id_list
                .as_deref()
                .map(parse_test_id_list)
                .transpose()?,
            test_oracle: args.test_oracle.clone(),
            test_suite: args.test_suite.clone(),
            patch_mode: args.patch_mode.clone(),
            exec_mode: args.exec_mode.clone(),
            tag: args.tag.clone(),
            debug: args.debug.then_some(true),
            ..Self::default()
        })
    }

    pub fn from_run_args(args: &RunArgs) -> Result<Self> {
        let base = Self::from_config_args(&args.config)?;
        Ok(Self {
            timeout_minutes: args.timeout,
            test_timeout_secs: args.test_timeout,
            task_timeout_secs: args.task_timeout,
            limit: args.limit,
            per_dir_limit: args.patch_per_dir_limit,
            partition: args.partition.then_some(true),
            only_validate: args.only_validate.then_some(true),
            trace_distance: args.trace_distance.then_some(true),
            ..base
        })
    }
}

fn parse_test_id_list(raw: &str) -> Result<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<serde_json::Value> =
        serde_json::from_str(trimmed).with_context(|| format!("parse test_id_list {trimmed:?}"))?;
    values
        .into_iter()
        .map(|value| match value {
            serde_json::Value::String(text) => Ok(text),
            serde_json::Value::Number(number) => Ok(number.to_string()),
            other => Err(anyhow!("test ids must be strings or numbers (got {other})")),
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{key} must be a boolean (got {other:?})")),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{key} must be a non-negative integer (got {value:?})"))
}

/// Parse a `key:value` configuration file body.
///
/// Blank lines and `#` comments are skipped; unknown keys are rejected.
pub fn parse_config_text(text: &str) -> Result<ConfigLayer> {
    let mut layer = ConfigLayer::default();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            bail!("config line {}: expected key:value, got {line:?}", index + 1);
        };
        let key = key.trim();
        let value = value.trim();
        let text = || Some(value.to_string());
        let path = || Some(PathBuf::from(value));
        match key {
            "binary" => layer.binary = path(),
            "source_file" => layer.source_file = text(),
            "source_dir" => layer.source_dir = path(),
            "output_dir" => layer.output_dir = path(),
            "patch_dir" => layer.patch_dir = path(),
            "patch_file" => layer.patch_file = path(),
            "test_id_list" => layer.test_ids = Some(parse_test_id_list(value)?),
            "test_oracle" => layer.test_oracle = path(),
            "test_suite" => layer.test_suite = path(),
            "pub_test_script" => layer.pub_test_script = path(),
            "pvt_test_script" => layer.pvt_test_script = path(),
            "adv_test_script" => layer.adv_test_script = path(),
            "build_script" => layer.build_script = path(),
            "config_script" => layer.config_script = path(),
            "patch_command" => layer.patch_command = text(),
            "patch_script" => layer.patch_script = path(),
            "reset_command" => layer.reset_command = text(),
            "reset_script" => layer.reset_script = path(),
            "patch_mode" => layer.patch_mode = text(),
            "exec_mode" => layer.exec_mode = text(),
            "timeout" => layer.timeout_minutes = Some(parse_number(key, value)?),
            "test_timeout" => layer.test_timeout_secs = Some(parse_number(key, value)?),
            "task_timeout" => layer.task_timeout_secs = Some(parse_number(key, value)?),
            "limit" | "patch_limit" => layer.limit = Some(parse_number(key, value)?),
            "patch_per_dir_limit" => layer.per_dir_limit = Some(parse_number(key, value)?),
            "tag" => layer.tag = text(),
            "debug" => layer.debug = Some(parse_bool(key, value)?),
            "partition" => layer.partition = Some(parse_bool(key, value)?),
            "only_validate" => layer.only_validate = Some(parse_bool(key, value)?),
            "trace_distance" => layer.trace_distance = Some(parse_bool(key, value)?),
            "e9_plugin_dir" => layer.e9_plugin_dir = path(),
            other => bail!("config line {}: unknown key {other:?}", index + 1),
        }
    }
    Ok(layer)
}

pub fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    if text.trim().is_empty() {
        bail!("config file {} is empty", path.display());
    }
    parse_config_text(&text).with_context(|| format!("parse config {}", path.display()))
}

pub fn load_metadata(path: &Path) -> Result<ConfigLayer> {
    let bytes = fs::read(path).with_context(|| format!("read metadata {}", path.display()))?;
    let meta: Metadata = serde_json::from_slice(&bytes).context("parse metadata JSON")?;
    Ok(ConfigLayer::from_metadata(meta))
}

/// Merge metadata, config file, and CLI layers in precedence order.
pub fn merge_sources(args: &ConfigArgs, cli_layer: ConfigLayer) -> Result<ConfigLayer> {
    let mut merged = ConfigLayer::default();
    if let Some(meta) = &args.meta {
        merged = merged.overlay(load_metadata(meta)?);
    }
    if let Some(conf) = &args.conf {
        merged = merged.overlay(load_config_file(conf)?);
    }
    Ok(merged.overlay(cli_layer))
}

/// Test scripts for the public, private, and adversarial gates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierScripts {
    pub public: Option<PathBuf>,
    pub private: Option<PathBuf>,
    pub adversarial: Option<PathBuf>,
}

/// How the recompilation backend applies and reverts a patch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceCommands {
    pub patch_command: Option<String>,
    pub patch_script: Option<PathBuf>,
    pub reset_command: Option<String>,
    pub reset_script: Option<PathBuf>,
    pub build_script: Option<PathBuf>,
    pub config_script: Option<PathBuf>,
}

/// Validated configuration for one run.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub binary: Option<PathBuf>,
    pub source_file: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Patch directory or single patch file.
    pub patch_location: PathBuf,
    pub test_ids: Vec<String>,
    pub test_oracle: Option<PathBuf>,
    pub test_suite: Option<PathBuf>,
    pub tiers: TierScripts,
    pub source_commands: SourceCommands,
    pub patch_mode: PatchMode,
    pub exec_mode: ExecMode,
    pub budget: Option<Duration>,
    pub test_timeout: Duration,
    pub task_timeout: Duration,
    pub limit: Option<usize>,
    pub per_dir_limit: Option<usize>,
    pub tag: Option<String>,
    pub debug: bool,
    pub partition: bool,
    pub only_validate: bool,
    pub trace_distance: bool,
    pub e9_plugin_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(args: &RunArgs) -> Result<Config> {
        let cli_layer = ConfigLayer::from_run_args(args)?;
        let merged = merge_sources(&args.config, cli_layer)?;
        Config::resolve(merged)
    }

    /// Validate a merged layer into a run configuration.
    pub fn resolve(layer: ConfigLayer) -> Result<Config> {
        let patch_mode = layer
            .patch_mode
            .as_deref()
            .map(PatchMode::from_str)
            .transpose()?
            .unwrap_or_default();
        let exec_mode = layer
            .exec_mode
            .as_deref()
            .map(ExecMode::from_str)
            .transpose()?
            .unwrap_or_default();

        let binary = existing_file(layer.binary, "binary")?;
        let test_oracle = existing_file(layer.test_oracle, "test_oracle")?;
        let test_suite = existing_file(layer.test_suite, "test_suite")?;
        let source_dir = existing_dir(layer.source_dir, "source_dir")?;
        let tiers = TierScripts {
            public: existing_file(layer.pub_test_script, "pub_test_script")?,
            private: existing_file(layer.pvt_test_script, "pvt_test_script")?,
            adversarial: existing_file(layer.adv_test_script, "adv_test_script")?,
        };
        let source_commands = SourceCommands {
            patch_command: layer.patch_command,
            patch_script: existing_file(layer.patch_script, "patch_script")?,
            reset_command: layer.reset_command,
            reset_script: existing_file(layer.reset_script, "reset_script")?,
            build_script: existing_file(layer.build_script, "build_script")?,
            config_script: existing_file(layer.config_script, "config_script")?,
        };

        let patch_location = match (layer.patch_dir, layer.patch_file) {
            (Some(dir), _) if dir.is_dir() => absolute(&dir)?,
            (_, Some(file)) if file.is_file() => absolute(&file)?,
            (Some(dir), _) => bail!("patch_dir {} does not exist", dir.display()),
            (None, Some(file)) => bail!("patch_file {} does not exist", file.display()),
            (None, None) => bail!("patch_dir or patch_file is required"),
        };

        let test_ids = layer.test_ids.unwrap_or_default();
        if test_ids.is_empty() {
            bail!("test_id_list is missing or empty");
        }
        if test_suite.is_none() && tiers.public.is_none() && binary.is_none() && test_oracle.is_none() {
            bail!("binary/test_oracle is missing (or configure test_suite/pub_test_script)");
        }
        match patch_mode {
            PatchMode::Gdb if test_suite.is_none() && (binary.is_none() || test_oracle.is_none()) => {
                bail!("patch_mode gdb needs binary and test_oracle, or test_suite")
            }
            PatchMode::Rewrite if binary.is_none() || test_oracle.is_none() => {
                bail!("patch_mode rewrite needs binary and test_oracle")
            }
            PatchMode::Compile if source_dir.is_none() => {
                bail!("patch_mode compile needs source_dir")
            }
            PatchMode::Compile if test_oracle.is_none() && test_suite.is_none() => {
                bail!("patch_mode compile needs test_oracle or test_suite")
            }
            _ => {}
        }

        let output_dir = match layer.output_dir {
            Some(dir) => dir,
            None => PathBuf::from(DEFAULT_OUTPUT_DIR),
        };
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;
        let output_dir = absolute(&output_dir)?;

        Ok(Config {
            binary,
            source_file: layer.source_file,
            source_dir,
            output_dir,
            patch_location,
            test_ids,
            test_oracle,
            test_suite,
            tiers,
            source_commands,
            patch_mode,
            exec_mode,
            budget: layer
                .timeout_minutes
                .filter(|minutes| *minutes > 0)
                .map(|minutes| Duration::from_secs(minutes * 60)),
            test_timeout: Duration::from_secs(
                layer.test_timeout_secs.unwrap_or(DEFAULT_TEST_TIMEOUT_SECS),
            ),
            task_timeout: Duration::from_secs(
                layer.task_timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS),
            ),
            limit: layer.limit.filter(|limit| *limit > 0),
            per_dir_limit: layer.per_dir_limit.filter(|limit| *limit > 0),
            tag: layer.tag.filter(|tag| !tag.trim().is_empty()),
            debug: layer.debug.unwrap_or(false),
            partition: layer.partition.unwrap_or(false),
            only_validate: layer.only_validate.unwrap_or(false),
            trace_distance: layer.trace_distance.unwrap_or(false),
            e9_plugin_dir: existing_dir(layer.e9_plugin_dir, "e9_plugin_dir")?,
        })
    }

    /// Whether a recompilation backend can be built for this run.
    pub fn can_recompile(&self) -> bool {
        self.source_dir.is_some()
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("resolve {}", path.display()))
}

fn existing_file(path: Option<PathBuf>, key: &str) -> Result<Option<PathBuf>> {
    match path {
        None => Ok(None),
        Some(path) if path.is_file() => Ok(Some(absolute(&path)?)),
        Some(path) => Err(anyhow!("{key} {} does not exist", path.display())),
    }
}

fn existing_dir(path: Option<PathBuf>, key: &str) -> Result<Option<PathBuf>> {
    match path {
        None => Ok(None),
        Some(path) if path.is_dir() => Ok(Some(absolute(&path)?)),
        Some(path) => Err(anyhow!("{key} {} is not a directory", path.display())),
    }
}

/// External tools each mode relies on; missing ones are reported, not fatal.
pub fn check_dependencies(config: &Config) -> Vec<String> {
    let mut tools = Vec::new();
    match config.patch_mode {
        PatchMode::Gdb => tools.push("gdb"),
        PatchMode::Rewrite => tools.extend(["gdb", "e9tool"]),
        PatchMode::Compile => {}
    }
    if config.source_dir.is_some() && config.source_commands.patch_command.is_none() {
        tools.push("patch");
    }
    if !config.only_validate && config.binary.is_some() {
        tools.extend(["e9afl", "afl-showmap"]);
    }
    let mut missing = Vec::new();
    for tool in tools {
        if which::which(tool).is_err() && !missing.iter().any(|m: &String| m == tool) {
            tracing::warn!(tool, "external tool not found in PATH");
            missing.push(tool.to_string());
        }
    }
    missing
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
