//! Sequential gate from staging outcome to one terminal class.
//!
//! Gates run in a fixed order and stop at the first one that fails, so a
//! patch in class *k* has cleared every gate below it.
use crate::backend::{record_failure, PatchedProgram, RunEnv, StageOutcome, Validation, ValidationResult};
use crate::exec::{run_command, script_command, CancelToken};
use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    InvalidApply,
    InvalidBuild,
    Incorrect,
    FixFailingFailed,
    Plausible,
    Correct,
    HighQuality,
}

impl Classification {
    pub const ALL: [Classification; 7] = [
        Self::InvalidApply,
        Self::InvalidBuild,
        Self::Incorrect,
        Self::FixFailingFailed,
        Self::Plausible,
        Self::Correct,
        Self::HighQuality,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::InvalidApply => "invalid-apply",
            Self::InvalidBuild => "invalid-build",
            Self::Incorrect => "incorrect",
            Self::FixFailingFailed => "fix-failing-failed",
            Self::Plausible => "plausible",
            Self::Correct => "correct",
            Self::HighQuality => "high-quality",
        }
    }

    /// Output directory receiving copies of patches in this class.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::InvalidApply | Self::InvalidBuild => "invalid",
            Self::Incorrect => "incorrect",
            Self::FixFailingFailed => "failure-fixing",
            Self::Plausible => "plausible",
            Self::Correct => "correct",
            Self::HighQuality => "high_quality",
        }
    }

    /// Whether the patch takes part in ranking.
    pub fn is_ranked(self) -> bool {
        self >= Self::Plausible
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classification plus whatever the gates left behind.
pub struct Classified<'s> {
    pub classification: Classification,
    pub result: ValidationResult,
    pub reason: Option<String>,
    /// Still-staged program for ranking; `None` below the build gate.
    pub program: Option<Box<dyn PatchedProgram + 's>>,
}

/// Run one tier script against the staged program; an unconfigured tier fails.
pub fn run_tier(
    env: &RunEnv,
    patch_id: &str,
    tier: &str,
    script: Option<&Path>,
    program: &dyn PatchedProgram,
    cancel: &CancelToken,
) -> Result<bool> {
    let Some(script) = script else {
        tracing::debug!(patch = patch_id, tier, "tier not configured");
        return Ok(false);
    };
    let candidate = program.candidate();
    let mut cmd = script_command(script);
    cmd.arg(&candidate.path)
        .env("PATCH_ID", patch_id)
        .env("VALKYRIE_BINARY", &candidate.path);
    for (key, value) in &candidate.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &env.config.source_dir {
        cmd.current_dir(dir);
    }
    let output = run_command(&mut cmd, Some(env.config.task_timeout), cancel)?;
    if !output.success() {
        record_failure(&env.paths, patch_id, &format!("{tier} tests"), &output);
    }
    Ok(output.success())
}

/// Push a validated patch through the remaining gates.
pub fn classify<'s>(
    env: &RunEnv,
    patch_id: &str,
    test_count: usize,
    validation: Validation<'s>,
    cancel: &CancelToken,
) -> Result<Classified<'s>> {
    let Validation {
        stage,
        result,
        program,
    } = validation;
    let gate = |classification: Classification,
                reason: Option<String>,
                program: Option<Box<dyn PatchedProgram + 's>>| Classified {
        classification,
        result: result.clone(),
        reason,
        program,
    };
    let program = match (stage, program) {
        (StageOutcome::ApplyFailed(reason), _) => {
            return Ok(gate(Classification::InvalidApply, Some(reason), None))
        }
        (StageOutcome::BuildFailed(reason), _) => {
            return Ok(gate(Classification::InvalidBuild, Some(reason), None))
        }
        (StageOutcome::Ready, None) => {
            return Ok(gate(
                Classification::InvalidApply,
                Some("no staged program".to_string()),
                None,
            ))
        }
        (StageOutcome::Ready, Some(program)) => program,
    };
    if result.outcomes.len() < test_count || !result.all_passed() {
        let reason = if result.any_timed_out() {
            "failing test timed out"
        } else {
            "failing test still fails"
        };
        return Ok(gate(Classification::Incorrect, Some(reason.to_string()), None));
    }

    let tiers = &env.config.tiers;
    let gates = [
        ("public", tiers.public.as_deref(), Classification::FixFailingFailed),
        ("private", tiers.private.as_deref(), Classification::Plausible),
        ("adversarial", tiers.adversarial.as_deref(), Classification::Correct),
    ];
    for (tier, script, on_failure) in gates {
        if !run_tier(env, patch_id, tier, script, program.as_ref(), cancel)? {
            return Ok(gate(on_failure, None, Some(program)));
        }
    }
    Ok(gate(Classification::HighQuality, None, Some(program)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Candidate, TestOutcome};
    use crate::config::{Config, ConfigLayer};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct Fixed;

    impl PatchedProgram for Fixed {
        fn run_test(&mut self, test_id: &str) -> Result<TestOutcome> {
            Ok(TestOutcome {
                test_id: test_id.to_string(),
                passed: true,
                cached: false,
                timed_out: false,
            })
        }

        fn candidate(&self) -> Candidate {
            Candidate {
                path: PathBuf::from("/opt/candidate"),
                env: Vec::new(),
            }
        }
    }

    fn env(root: &Path, tiers: &[(&str, &str)]) -> Arc<RunEnv> {
        fs::create_dir_all(root.join("patches")).expect("create patches");
        fs::write(root.join("suite.sh"), "exit 0\n").expect("write suite");
        let mut layer = ConfigLayer {
            patch_dir: Some(root.join("patches")),
            test_suite: Some(root.join("suite.sh")),
            test_ids: Some(vec!["1".to_string()]),
            output_dir: Some(root.join("out")),
            ..ConfigLayer::default()
        };
        for (tier, body) in tiers {
            let path = root.join(format!("{tier}.sh"));
            fs::write(&path, body).expect("write tier");
            match *tier {
                "pub" => layer.pub_test_script = Some(path),
                "pvt" => layer.pvt_test_script = Some(path),
                _ => layer.adv_test_script = Some(path),
            }
        }
        Arc::new(RunEnv::new(Config::resolve(layer).expect("resolve")))
    }

    fn passing(outcomes: usize) -> Validation<'static> {
        let mut result = ValidationResult::default();
        for index in 0..outcomes {
            result.push(TestOutcome {
                test_id: index.to_string(),
                passed: true,
                cached: false,
                timed_out: false,
            });
        }
        Validation {
            stage: StageOutcome::Ready,
            result,
            program: Some(Box::new(Fixed)),
        }
    }

    #[test]
    fn classes_are_ordered_and_labelled() {
        assert!(Classification::InvalidApply < Classification::InvalidBuild);
        assert!(Classification::Correct < Classification::HighQuality);
        assert_eq!(Classification::FixFailingFailed.label(), "fix-failing-failed");
        assert_eq!(Classification::InvalidBuild.dir_name(), "invalid");
        assert_eq!(Classification::HighQuality.dir_name(), "high_quality");
        assert!(Classification::Plausible.is_ranked());
        assert!(!Classification::FixFailingFailed.is_ranked());
        let json = serde_json::to_string(&Classification::HighQuality).expect("serialize");
        assert_eq!(json, "\"high-quality\"");
    }

    #[test]
    fn staging_failures_stop_at_first_gates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), &[]);
        let cancel = CancelToken::new();
        let failed = Validation {
            stage: StageOutcome::BuildFailed("make: *** [all] Error 2".to_string()),
            result: ValidationResult::default(),
            program: None,
        };
        let classified = classify(&env, "p", 1, failed, &cancel).expect("classify");
        assert_eq!(classified.classification, Classification::InvalidBuild);
        assert!(classified.program.is_none());
    }

    #[test]
    fn incomplete_failing_run_is_incorrect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), &[]);
        let cancel = CancelToken::new();
        let classified = classify(&env, "p", 2, passing(1), &cancel).expect("classify");
        assert_eq!(classified.classification, Classification::Incorrect);
    }

    #[test]
    fn unconfigured_public_tier_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), &[]);
        let cancel = CancelToken::new();
        let classified = classify(&env, "p", 1, passing(1), &cancel).expect("classify");
        assert_eq!(classified.classification, Classification::FixFailingFailed);
    }

    #[test]
    fn tiers_receive_candidate_and_stop_at_first_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("adv-ran");
        let adversarial = format!("touch {}\n", marker.display());
        let env = env(
            dir.path(),
            &[
                ("pub", "[ \"$1\" = /opt/candidate ] && [ \"$VALKYRIE_BINARY\" = \"$1\" ]\n"),
                ("pvt", "exit 1\n"),
                ("adv", adversarial.as_str()),
            ],
        );
        let cancel = CancelToken::new();
        let classified = classify(&env, "p", 1, passing(1), &cancel).expect("classify");
        assert_eq!(classified.classification, Classification::Plausible);
        assert!(classified.program.is_some());
        assert!(!marker.exists());
    }

    #[test]
    fn all_tiers_passing_is_high_quality() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), &[("pub", "exit 0\n"), ("pvt", "exit 0\n"), ("adv", "exit 0\n")]);
        let cancel = CancelToken::new();
        let classified = classify(&env, "p", 1, passing(1), &cancel).expect("classify");
        assert_eq!(classified.classification, Classification::HighQuality);
    }
}
