//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Scratch repair task: a source tree, a patch directory, helper scripts, and
/// an output directory, all below one temp dir.
pub struct Task {
    pub dir: TempDir,
    conf: Vec<String>,
}

impl Task {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        for sub in ["src", "patches", "out"] {
            fs::create_dir_all(dir.path().join(sub)).expect("create task dir");
        }
        fs::write(
            dir.path().join("src/f.c"),
            "int f(int x) {\n  int y = x;\n  y = y + 1;\n  return y;\n}\n",
        )
        .expect("write source");
        let mut task = Self {
            dir,
            conf: Vec::new(),
        };
        let root = task.path().to_path_buf();
        task.set("source_dir", &root.join("src").display().to_string());
        task.set("patch_dir", &root.join("patches").display().to_string());
        task.set("output_dir", &root.join("out").display().to_string());
        task.set("test_id_list", "[\"1\"]");
        task
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.conf.push(format!("{key}:{value}"));
    }

    /// Write a `sh` script below the task and return its path.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        path
    }

    /// Register a script under a config key.
    pub fn set_script(&mut self, key: &str, name: &str, body: &str) -> PathBuf {
        let path = self.script(name, body);
        self.set(key, &path.display().to_string());
        path
    }

    pub fn patch(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path().join("patches").join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create patch dir");
        }
        fs::write(&path, body).expect("write patch");
        path
    }

    pub fn run(&self, extra: &[&str]) -> Output {
        let conf = self.path().join("repair.conf");
        fs::write(&conf, self.conf.join("\n")).expect("write conf");
        Command::new(env!("CARGO_BIN_EXE_valkyrie"))
            .arg("run")
            .arg("--conf")
            .arg(&conf)
            .args(extra)
            .env("RUST_LOG", "warn")
            .output()
            .expect("run valkyrie")
    }

    pub fn out(&self) -> PathBuf {
        self.path().join("out")
    }

    /// `result.json` rows as `(patch_id, label)`.
    pub fn results(&self) -> Vec<(String, String)> {
        let text = fs::read_to_string(self.out().join("result.json")).expect("read result.json");
        serde_json::from_str(&text).expect("parse result.json")
    }

    pub fn summary(&self) -> serde_json::Value {
        let text =
            fs::read_to_string(self.out().join("run-summary.json")).expect("read run summary");
        serde_json::from_str(&text).expect("parse run summary")
    }
}
