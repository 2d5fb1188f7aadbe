use super::*;

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(path, contents.as_bytes()).expect("write file");
}

/// Layer with a patch dir, oracle, binary, and one failing test on disk.
fn runnable_layer(root: &Path) -> ConfigLayer {
    write_file(&root.join("patches/1.patch"), "");
    write_file(&root.join("oracle.sh"), "#!/bin/sh\nexit 0\n");
    write_file(&root.join("bin/prog"), "");
    fs::create_dir_all(root.join("src")).expect("create src");
    ConfigLayer {
        binary: Some(root.join("bin/prog")),
        patch_dir: Some(root.join("patches")),
        test_oracle: Some(root.join("oracle.sh")),
        test_ids: Some(vec!["1".to_string()]),
        output_dir: Some(root.join("out")),
        ..ConfigLayer::default()
    }
}

#[test]
fn parses_keys_comments_and_json_lists() {
    let layer = parse_config_text(
        "# repair task\n\
         binary:/tmp/prog\n\
         test_id_list:[\"1\", 2]\n\
         patch_limit: 50\n\
         exec_mode:1\n\
         partition:true\n\
         patch_command:git apply PATCH_FILE\n\
         \n",
    )
    .expect("parse config");
    assert_eq!(layer.binary, Some(PathBuf::from("/tmp/prog")));
    assert_eq!(layer.test_ids, Some(vec!["1".to_string(), "2".to_string()]));
    assert_eq!(layer.limit, Some(50));
    assert_eq!(layer.exec_mode.as_deref(), Some("1"));
    assert_eq!(layer.partition, Some(true));
    assert_eq!(layer.patch_command.as_deref(), Some("git apply PATCH_FILE"));
}

#[test]
fn values_may_contain_colons() {
    let layer = parse_config_text("reset_command:git checkout HEAD:src\n").expect("parse");
    assert_eq!(layer.reset_command.as_deref(), Some("git checkout HEAD:src"));
}

#[test]
fn unknown_keys_and_bad_values_are_rejected() {
    let err = parse_config_text("binray:/tmp/prog\n").expect_err("unknown key");
    assert!(err.to_string().contains("unknown key"));
    assert!(parse_config_text("test_timeout:soon\n").is_err());
    assert!(parse_config_text("partition:maybe\n").is_err());
    assert!(parse_config_text("no separator here\n").is_err());
}

#[test]
fn later_layers_win() {
    let meta = ConfigLayer::from_metadata(Metadata {
        binary_path: Some(PathBuf::from("/meta/bin")),
        test_oracle: Some(PathBuf::from("/meta/oracle")),
        failing_test: vec!["m1".to_string()],
        ..Metadata::default()
    });
    let file = parse_config_text("binary:/conf/bin\ntag:nightly\n").expect("parse");
    let cli = ConfigLayer {
        tag: Some("cli".to_string()),
        ..ConfigLayer::default()
    };
    let merged = meta.overlay(file).overlay(cli);
    assert_eq!(merged.binary, Some(PathBuf::from("/conf/bin")));
    assert_eq!(merged.test_oracle, Some(PathBuf::from("/meta/oracle")));
    assert_eq!(merged.test_ids, Some(vec!["m1".to_string()]));
    assert_eq!(merged.tag.as_deref(), Some("cli"));
}

#[test]
fn metadata_json_is_loaded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meta.json");
    write_file(
        &path,
        r#"{"binary_path": "/x/prog", "failing_test": ["3", "4"], "extra": 1}"#,
    );
    let layer = load_metadata(&path).expect("load metadata");
    assert_eq!(layer.binary, Some(PathBuf::from("/x/prog")));
    assert_eq!(layer.test_ids, Some(vec!["3".to_string(), "4".to_string()]));
}

#[test]
fn exec_mode_accepts_names_and_indices() {
    assert_eq!("0".parse::<ExecMode>().expect("parse"), ExecMode::Sequential);
    assert_eq!(
        "semi-parallel".parse::<ExecMode>().expect("parse"),
        ExecMode::SemiParallel
    );
    assert_eq!("2".parse::<ExecMode>().expect("parse"), ExecMode::Parallel);
    assert!("3".parse::<ExecMode>().is_err());
    assert_eq!(ExecMode::Sequential.worker_count(8), 1);
    assert_eq!(ExecMode::SemiParallel.worker_count(8), 4);
    assert_eq!(ExecMode::SemiParallel.worker_count(1), 1);
    assert_eq!(ExecMode::Parallel.worker_count(8), 8);
}

#[test]
fn patch_mode_rejects_unknown_values() {
    assert_eq!("compile".parse::<PatchMode>().expect("parse"), PatchMode::Compile);
    let err = "emulate".parse::<PatchMode>().expect_err("invalid mode");
    assert!(err.to_string().contains("patch_mode"));
}

#[test]
fn resolve_applies_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config::resolve(runnable_layer(dir.path())).expect("resolve");
    assert_eq!(config.patch_mode, PatchMode::Gdb);
    assert_eq!(config.exec_mode, ExecMode::Parallel);
    assert_eq!(config.test_timeout, Duration::from_secs(DEFAULT_TEST_TIMEOUT_SECS));
    assert_eq!(config.budget, None);
    assert!(!config.partition);
    assert!(config.output_dir.is_dir());
    assert!(config.patch_location.is_absolute());
}

#[test]
fn resolve_requires_test_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layer = ConfigLayer {
        test_ids: Some(Vec::new()),
        ..runnable_layer(dir.path())
    };
    let err = Config::resolve(layer).expect_err("missing tests");
    assert!(err.to_string().contains("test_id_list"));
}

#[test]
fn resolve_rejects_missing_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layer = ConfigLayer {
        binary: Some(dir.path().join("nope")),
        ..runnable_layer(dir.path())
    };
    let err = Config::resolve(layer).expect_err("missing binary");
    assert!(err.to_string().contains("binary"));
}

#[test]
fn compile_mode_requires_source_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layer = ConfigLayer {
        patch_mode: Some("compile".to_string()),
        ..runnable_layer(dir.path())
    };
    let err = Config::resolve(layer).expect_err("no source dir");
    assert!(err.to_string().contains("source_dir"));

    let layer = ConfigLayer {
        patch_mode: Some("compile".to_string()),
        source_dir: Some(dir.path().join("src")),
        ..runnable_layer(dir.path())
    };
    let config = Config::resolve(layer).expect("resolve compile");
    assert!(config.can_recompile());
}

#[test]
fn zero_timeout_means_no_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layer = ConfigLayer {
        timeout_minutes: Some(0),
        ..runnable_layer(dir.path())
    };
    assert_eq!(Config::resolve(layer).expect("resolve").budget, None);
    let layer = ConfigLayer {
        timeout_minutes: Some(2),
        ..runnable_layer(dir.path())
    };
    assert_eq!(
        Config::resolve(layer).expect("resolve").budget,
        Some(Duration::from_secs(120))
    );
}
