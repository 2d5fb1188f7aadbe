mod common;

use common::{find_in_path, Task};
use std::fs;

const GOOD_PATCH: &str = "--- a/f.c\n+++ b/f.c\n@@ -3,1 +3,1 @@\n-  y = y + 1;\n+  y = y + 2;\n";

/// Compile-mode task whose apply, reset, and build steps are no-op scripts.
fn scripted_task() -> Task {
    let mut task = Task::new();
    task.set("patch_mode", "compile");
    task.set_script("patch_script", "apply.sh", "exit 0");
    task.set_script("reset_script", "reset.sh", "exit 0");
    task.set_script("build_script", "build.sh", "exit 0");
    task
}

#[test]
fn empty_patch_is_listed_separately() {
    let mut task = scripted_task();
    task.set_script("test_oracle", "oracle.sh", "exit 0");
    task.patch("empty.patch", "");
    task.patch("good.patch", GOOD_PATCH);

    let output = task.run(&[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    assert_eq!(
        task.results(),
        vec![("good.patch".to_string(), "fix-failing-failed".to_string())]
    );
    let summary = task.summary();
    assert_eq!(summary["empty"], serde_json::json!(["empty.patch"]));
    assert_eq!(summary["initial"], 2);
    assert!(task.out().join("failure-fixing/good.patch").is_file());
    assert!(!task.out().join("invalid/empty.patch").exists());
}

#[test]
fn apply_failure_stops_before_build_and_tests() {
    if find_in_path("patch").is_none() {
        return;
    }
    let mut task = Task::new();
    task.set("patch_mode", "compile");
    let built = task.path().join("built");
    let tested = task.path().join("tested");
    task.set_script("build_script", "build.sh", &format!("touch {}", built.display()));
    task.set_script("test_oracle", "oracle.sh", &format!("touch {}", tested.display()));
    task.patch(
        "bad.patch",
        "--- a/f.c\n+++ b/f.c\n@@ -2,1 +2,1 @@\n-  int z = 0;\n+  int z = 1;\n",
    );
    let before = fs::read_to_string(task.path().join("src/f.c")).expect("read source");

    let output = task.run(&[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    assert_eq!(
        task.results(),
        vec![("bad.patch".to_string(), "invalid-apply".to_string())]
    );
    assert!(!built.exists());
    assert!(!tested.exists());
    let after = fs::read_to_string(task.path().join("src/f.c")).expect("read source");
    assert_eq!(before, after);
    assert!(!task.path().join("src/f.c.rej").exists());
}

#[test]
fn include_patch_is_recompiled_in_debugger_mode() {
    let mut task = Task::new();
    let applied = task.path().join("applied.log");
    let built = task.path().join("built");
    task.set("patch_mode", "gdb");
    task.set_script("test_suite", "suite.sh", "exit 0");
    task.set_script(
        "patch_script",
        "apply.sh",
        &format!("echo \"$1\" >> {}", applied.display()),
    );
    task.set_script("reset_script", "reset.sh", "exit 0");
    task.set_script("build_script", "build.sh", &format!("touch {}", built.display()));
    task.patch(
        "include.patch",
        "--- a/f.c\n+++ b/f.c\n@@ -1,0 +1,1 @@\n+#include <string.h>\n",
    );

    let output = task.run(&[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    assert_eq!(
        task.results(),
        vec![("include.patch".to_string(), "fix-failing-failed".to_string())]
    );
    assert!(built.is_file());
    let log = fs::read_to_string(&applied).expect("read apply log");
    assert!(log.contains("include.patch"));
}

#[test]
fn high_quality_patches_are_ranked_by_coverage_distance() {
    let mut task = scripted_task();
    task.set_script(
        "test_suite",
        "suite.sh",
        r#"if [ "$COVERAGE" = 1 ]; then
  if [ "$PATCH_ID" = "far.patch" ]; then
    printf 'e1:3\ne2:1\n' > "$VALKYRIE_COVERAGE_FILE"
  else
    printf 'e1:1\n' > "$VALKYRIE_COVERAGE_FILE"
  fi
fi
exit 0"#,
    );
    for key in ["pub_test_script", "pvt_test_script", "adv_test_script"] {
        task.set_script(key, &format!("{key}.sh"), "exit 0");
    }
    task.patch("far.patch", GOOD_PATCH);
    task.patch(
        "near.patch",
        "--- a/f.c\n+++ b/f.c\n@@ -3,1 +3,1 @@\n-  y = y + 1;\n+  y = (y + 1) * 2 - y - 1 + y;\n",
    );

    let output = task.run(&[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let labels: Vec<String> = task.results().into_iter().map(|(_, label)| label).collect();
    assert_eq!(labels, ["high-quality", "high-quality"]);
    let scores = fs::read_to_string(task.out().join("patch-score")).expect("read patch-score");
    let lines: Vec<Vec<&str>> = scores.lines().map(|line| line.split(' ').collect()).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0][..3], ["near.patch", "0", "0"]);
    assert_eq!(lines[1][..3], ["far.patch", "0", "3"]);
    assert!(task.out().join("high_quality/near.patch").is_file());
}

#[test]
fn only_validate_skips_ranking() {
    let mut task = scripted_task();
    task.set_script("test_oracle", "oracle.sh", "exit 0");
    task.set("only_validate", "true");
    task.patch("good.patch", GOOD_PATCH);

    let output = task.run(&[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(!task.out().join("patch-score").exists());
    assert_eq!(task.summary()["ranked"], 0);
}

#[test]
fn failing_test_marks_patch_incorrect_and_logs_error() {
    let mut task = scripted_task();
    task.set_script("test_oracle", "oracle.sh", "echo still broken >&2\nexit 1");
    task.patch("good.patch", GOOD_PATCH);

    let output = task.run(&[]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        task.results(),
        vec![("good.patch".to_string(), "incorrect".to_string())]
    );
    let log = fs::read_to_string(task.out().join("errors/pgood.patch.err")).expect("read error log");
    assert!(log.contains("still broken"));
}

#[test]
fn missing_test_ids_fail_before_execution() {
    let mut task = scripted_task();
    task.set_script("test_oracle", "oracle.sh", "exit 0");
    task.set("test_id_list", "[]");
    task.patch("good.patch", GOOD_PATCH);

    let output = task.run(&[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("test_id_list"));
    assert!(!task.out().join("result.json").exists());
}
