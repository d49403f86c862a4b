//! Staging and submission of speculative try builds.
//!
//! [`TryCommit`] is a scoped resource over a worktree: staging applies the
//! scheduling hacks as a commit, submission runs the in-tree tool and
//! scrapes the resulting remote revision, and dropping the value resets
//! the worktree head to its pre-staging commit whatever happened in
//! between. Worktrees are shared infrastructure; they must never leak a
//! half-applied hack commit into the next operation.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use ferry_git::{GitRepo, Worktree};
use ferry_process::{CommandResult, Mach, run_command_in_dir};
use ferry_types::{Ctx, FerryError};
use regex::Regex;
use tracing::{debug, error, info, warn};

/// CI configuration file mutated by the scheduling hacks.
const CI_CONFIG_PATH: &str = "taskcluster/ci/config.yml";

/// Objdir the submission tool expects to exist.
const OBJDIR: &str = "obj-x86_64-pc-linux-gnu";

/// Notification route requested when the tool supports routes.
const NOTIFY_ROUTE: &str = "--route=notify.pulse.wptsync.try-task.on-any";

/// Default fuzzy query, excluding platforms that only add noise.
pub const DEFAULT_QUERY: &str = "web-platform-tests !macosx !shippable !asan !fis";

static REV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"revision=(?P<rev>[0-9a-f]{40})").expect("valid regex"));

/// Selection options for a fuzzy try push.
#[derive(Debug, Clone)]
pub struct FuzzyConfig {
    /// Fuzzy query strings, one `-q` pair each.
    pub queries: Vec<String>,
    /// Include the full task set.
    pub full: bool,
    /// Bypass the CI's default target task filter.
    pub disable_target_task_filter: bool,
    /// Artifact build rather than a full compile.
    pub artifact: bool,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            queries: vec![DEFAULT_QUERY.to_string()],
            full: false,
            disable_target_task_filter: false,
            artifact: true,
        }
    }
}

impl FuzzyConfig {
    /// A config with a single query, the promotion rule for callers that
    /// hold one string.
    pub fn single(query: impl Into<String>) -> Self {
        Self {
            queries: vec![query.into()],
            ..Self::default()
        }
    }
}

/// A staged try submission bound to a worktree.
///
/// Obtained from [`TryCommit::stage`]; dropped values reset the worktree
/// to the head recorded before any mutation.
#[derive(Debug)]
pub struct TryCommit<'a> {
    repo: &'a GitRepo,
    worktree: &'a Worktree,
    tests_by_type: Option<&'a BTreeMap<String, Vec<String>>>,
    rebuild: u32,
    fuzzy: FuzzyConfig,
    max_tests: Option<usize>,
    reset_to: Option<String>,
}

impl<'a> TryCommit<'a> {
    /// Prepare the worktree for submission.
    ///
    /// With `hacks` set, the pre-mutation head is recorded and the
    /// scheduling overrides are committed on top so they ride along with
    /// the push.
    pub fn stage(
        repo: &'a GitRepo,
        worktree: &'a Worktree,
        tests_by_type: Option<&'a BTreeMap<String, Vec<String>>>,
        rebuild: u32,
        hacks: bool,
        fuzzy: FuzzyConfig,
        max_tests: Option<usize>,
    ) -> Result<Self> {
        let mut commit = Self {
            repo,
            worktree,
            tests_by_type,
            rebuild,
            fuzzy,
            max_tests,
            reset_to: None,
        };
        if hacks {
            commit.reset_to = Some(worktree.head_sha()?);
            if commit.apply_hacks()? {
                worktree.commit("Apply task hacks before running try")?;
            }
        }
        Ok(commit)
    }

    /// Empty out the ridealong builds scheduled by default under try.
    ///
    /// Those jobs take hours and say nothing about wpt results. Returns
    /// whether the config file was actually changed.
    fn apply_hacks(&self) -> Result<bool> {
        info!("Removing ridealong builds");
        let path = self.worktree.path().join(CI_CONFIG_PATH);
        if !path.exists() {
            return Ok(false);
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut data: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("failed to parse {CI_CONFIG_PATH}"))?;

        let Some(ridealong) = data
            .get_mut("try")
            .and_then(|t| t.get_mut("ridealong-builds"))
        else {
            return Ok(false);
        };
        *ridealong = serde_yaml::Value::Mapping(Default::default());

        let updated =
            serde_yaml::to_string(&data).context("failed to serialize CI config")?;
        std::fs::write(&path, updated)
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.worktree.add(&[CI_CONFIG_PATH])?;
        Ok(true)
    }

    /// Submit the staged tree to try.
    ///
    /// Returns the remote revision when one could be determined.
    pub fn push(&self, ctx: &Ctx) -> Result<Option<String>> {
        self.worktree.reset_hard(None)?;

        let mach = Mach::new(self.worktree.path());

        // The submission tool fails when no objdir exists, for reasons
        // that only reproduce outside a shell. An empty python invocation
        // forces one into being.
        if !self.worktree.file_exists(OBJDIR) {
            if let Err(err) = mach.python(&["-c", ""], ctx) {
                debug!(error = %err, "objdir bootstrap failed, continuing");
            }
        }

        let help = mach.try_cmd(&["fuzzy", "--help"], ctx)?;
        let can_push_routes = help.combined().contains("--route ");

        let args = self.fuzzy_args(can_push_routes);
        info!(query = %self.fuzzy.queries.join(" | "), "Pushing to try with fuzzy query");

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = mach.try_cmd(&arg_refs, ctx)?;
        self.read_try_rev(&result)
    }

    /// Submission argv after `try`, in the order the tool expects.
    fn fuzzy_args(&self, can_push_routes: bool) -> Vec<String> {
        let mut args = vec!["fuzzy".to_string()];
        for query in &self.fuzzy.queries {
            args.push("-q".to_string());
            args.push(query.clone());
        }
        if self.rebuild > 0 {
            args.push("--rebuild".to_string());
            args.push(self.rebuild.to_string());
        }
        if self.fuzzy.full {
            args.push("--full".to_string());
        }
        if self.fuzzy.disable_target_task_filter {
            args.push("--disable-target-task-filter".to_string());
        }
        if can_push_routes {
            args.push(NOTIFY_ROUTE.to_string());
        }
        if self.fuzzy.artifact {
            args.push("--artifact".to_string());
        } else {
            args.push("--no-artifact".to_string());
        }
        args.extend(self.test_paths());
        args
    }

    /// Deduplicated test paths that exist in the worktree, capped at the
    /// configured maximum (prefix, deterministically).
    fn test_paths(&self) -> Vec<String> {
        let Some(tests_by_type) = self.tests_by_type else {
            return Vec::new();
        };
        let mut paths = Vec::new();
        let mut seen = HashSet::new();
        for values in tests_by_type.values() {
            for item in values {
                if !seen.contains(item) && self.worktree.file_exists(item) {
                    paths.push(item.clone());
                }
                seen.insert(item.clone());
            }
        }
        if let Some(max_tests) = self.max_tests {
            if paths.len() > max_tests {
                warn!(max_tests, "Capping number of affected tests");
                paths.truncate(max_tests);
            }
        }
        paths
    }

    /// Extract the remote revision from the submission output.
    fn read_try_rev(&self, result: &CommandResult) -> Result<Option<String>> {
        let output = result.combined();
        if !result.success {
            error!("Failed to push to try:\n{output}");
            return Err(FerryError::retryable_abort("failed to push to try").into());
        }
        if let Some(captures) = REV_RE.captures(&output) {
            return Ok(Some(captures["rev"].to_string()));
        }

        warn!("No revision found in try output:\n\n{output}\n");
        // The push went through without printing a revision; map the
        // worktree head through the VCS bridge as a last resort.
        let head = self.worktree.head_sha()?;
        let bridge = run_command_in_dir(
            "git",
            &["cinnabar", "git2hg", &head],
            self.repo.path(),
        )?;
        if !bridge.success {
            return Ok(None);
        }
        let rev = bridge.stdout.trim().to_string();
        if rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Some(rev))
        } else {
            Ok(None)
        }
    }
}

impl Drop for TryCommit<'_> {
    fn drop(&mut self) {
        // Reset on all exit paths so shared worktree state never carries
        // the hack commit forward.
        if let Some(reset) = self.reset_to.take() {
            debug!(reset = %reset, "resetting working tree");
            if let Err(err) = self.worktree.reset_hard(Some(&reset)) {
                warn!(error = %err, "failed to reset worktree after try push");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::process::Command;

    use tempfile::tempdir;

    use super::*;

    const FAKE_REV: &str = "0123456789abcdef0123456789abcdef01234567";

    fn git_in(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(output.status.success(), "git {args:?} failed");
    }

    fn init_git_repo(dir: &Path) {
        git_in(dir, &["init", "-q", "-b", "main"]);
        git_in(dir, &["config", "user.email", "test@example.com"]);
        git_in(dir, &["config", "user.name", "Test User"]);
    }

    #[cfg(unix)]
    fn write_mach(dir: &Path, with_route: bool) {
        use std::os::unix::fs::PermissionsExt;

        let help = if with_route {
            "usage: mach try fuzzy [-q QUERY] [--route ROUTE]"
        } else {
            "usage: mach try fuzzy [-q QUERY]"
        };
        let body = format!(
            r#"#!/bin/sh
printf '%s\n' "$*" >> mach-invocations.txt
if [ "$1" = "python" ]; then exit 0; fi
if [ "$2" = "fuzzy" ] && [ "$3" = "--help" ]; then
  echo "{help}"
  exit 0
fi
echo "revision={FAKE_REV}"
"#
        );
        let path = dir.join("mach");
        std::fs::write(&path, body).expect("write mach");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
    }

    #[cfg(unix)]
    fn setup_worktree(dir: &Path, with_route: bool) -> Worktree {
        init_git_repo(dir);
        write_mach(dir, with_route);

        std::fs::create_dir_all(dir.join("taskcluster/ci")).expect("mkdir");
        std::fs::write(
            dir.join(CI_CONFIG_PATH),
            "try:\n  ridealong-builds:\n    android-api-16:\n      - android-test\n",
        )
        .expect("write ci config");

        git_in(dir, &["add", "."]);
        git_in(dir, &["commit", "-q", "-m", "base"]);
        Worktree::new(dir)
    }

    #[cfg(unix)]
    fn last_invocation(dir: &Path) -> String {
        let text =
            std::fs::read_to_string(dir.join("mach-invocations.txt")).expect("invocations");
        text.lines().last().expect("at least one invocation").to_string()
    }

    #[cfg(unix)]
    #[test]
    fn push_returns_scraped_revision() {
        let td = tempdir().expect("tempdir");
        let worktree = setup_worktree(td.path(), true);
        let repo = GitRepo::new(td.path());

        let commit = TryCommit::stage(
            &repo,
            &worktree,
            None,
            0,
            true,
            FuzzyConfig::default(),
            None,
        )
        .expect("stage");
        let rev = commit.push(&Ctx::background()).expect("push");
        assert_eq!(rev.as_deref(), Some(FAKE_REV));
    }

    #[cfg(unix)]
    #[test]
    fn submission_argv_is_ordered() {
        let td = tempdir().expect("tempdir");
        let worktree = setup_worktree(td.path(), true);
        let repo = GitRepo::new(td.path());

        for name in ["t1.html", "t2.html", "t3.html"] {
            std::fs::write(td.path().join(name), "<!doctype html>").expect("write test");
        }
        git_in(td.path(), &["add", "."]);
        git_in(td.path(), &["commit", "-q", "-m", "tests"]);

        let mut tests = BTreeMap::new();
        tests.insert(
            "testharness".to_string(),
            vec!["t1.html".to_string(), "t2.html".to_string(), "t3.html".to_string()],
        );

        let fuzzy = FuzzyConfig {
            full: true,
            disable_target_task_filter: true,
            artifact: false,
            ..FuzzyConfig::default()
        };
        let commit = TryCommit::stage(&repo, &worktree, Some(&tests), 5, false, fuzzy, None)
            .expect("stage");
        commit.push(&Ctx::background()).expect("push");

        assert_eq!(
            last_invocation(td.path()),
            format!(
                "try fuzzy -q {DEFAULT_QUERY} --rebuild 5 --full \
                 --disable-target-task-filter {NOTIFY_ROUTE} --no-artifact \
                 t1.html t2.html t3.html"
            )
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_paths_are_capped_and_deduplicated() {
        let td = tempdir().expect("tempdir");
        let worktree = setup_worktree(td.path(), true);
        let repo = GitRepo::new(td.path());

        let mut names = Vec::new();
        for i in 0..10 {
            let name = format!("t{i}.html");
            std::fs::write(td.path().join(&name), "x").expect("write test");
            names.push(name);
        }
        git_in(td.path(), &["add", "."]);
        git_in(td.path(), &["commit", "-q", "-m", "tests"]);

        let mut tests = BTreeMap::new();
        tests.insert("testharness".to_string(), names.clone());
        // A second type repeating paths plus one that does not exist.
        let mut repeated = names.clone();
        repeated.push("missing.html".to_string());
        tests.insert("wdspec".to_string(), repeated);

        let commit = TryCommit::stage(
            &repo,
            &worktree,
            Some(&tests),
            0,
            false,
            FuzzyConfig::default(),
            Some(3),
        )
        .expect("stage");
        commit.push(&Ctx::background()).expect("push");

        let argv = last_invocation(td.path());
        let paths: Vec<&str> = argv
            .split_whitespace()
            .filter(|a| a.ends_with(".html"))
            .collect();
        assert_eq!(paths, ["t0.html", "t1.html", "t2.html"]);
    }

    #[cfg(unix)]
    #[test]
    fn route_omitted_when_tool_lacks_support() {
        let td = tempdir().expect("tempdir");
        let worktree = setup_worktree(td.path(), false);
        let repo = GitRepo::new(td.path());

        let commit = TryCommit::stage(
            &repo,
            &worktree,
            None,
            0,
            false,
            FuzzyConfig::default(),
            None,
        )
        .expect("stage");
        commit.push(&Ctx::background()).expect("push");

        assert!(!last_invocation(td.path()).contains("--route"));
    }

    #[cfg(unix)]
    #[test]
    fn hacks_are_committed_then_reset_on_drop() {
        let td = tempdir().expect("tempdir");
        let worktree = setup_worktree(td.path(), true);
        let repo = GitRepo::new(td.path());
        let base = worktree.head_sha().expect("head");

        {
            let _commit = TryCommit::stage(
                &repo,
                &worktree,
                None,
                0,
                true,
                FuzzyConfig::default(),
                None,
            )
            .expect("stage");

            // The hack commit is in place with the builds emptied out.
            assert_ne!(worktree.head_sha().expect("head"), base);
            let text = std::fs::read_to_string(td.path().join(CI_CONFIG_PATH)).expect("read");
            let data: serde_yaml::Value = serde_yaml::from_str(&text).expect("yaml");
            let ridealong = data
                .get("try")
                .and_then(|t| t.get("ridealong-builds"))
                .expect("key present");
            assert!(ridealong.as_mapping().expect("mapping").is_empty());
        }

        // Dropping the staged commit restored the pre-hack state.
        assert_eq!(worktree.head_sha().expect("head"), base);
        let text = std::fs::read_to_string(td.path().join(CI_CONFIG_PATH)).expect("read");
        assert!(text.contains("android-api-16"));
    }

    #[cfg(unix)]
    #[test]
    fn hacks_noop_without_config_file() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        write_mach(td.path(), true);
        git_in(td.path(), &["add", "."]);
        git_in(td.path(), &["commit", "-q", "-m", "base"]);
        let worktree = Worktree::new(td.path());
        let repo = GitRepo::new(td.path());
        let base = worktree.head_sha().expect("head");

        let commit = TryCommit::stage(
            &repo,
            &worktree,
            None,
            0,
            true,
            FuzzyConfig::default(),
            None,
        )
        .expect("stage");
        // Nothing to hack, so no commit was created.
        assert_eq!(worktree.head_sha().expect("head"), base);
        drop(commit);
        assert_eq!(worktree.head_sha().expect("head"), base);
    }

    #[cfg(unix)]
    #[test]
    fn failed_submission_is_retryable() {
        use std::os::unix::fs::PermissionsExt;

        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let path = td.path().join("mach");
        std::fs::write(&path, "#!/bin/sh\nif [ \"$3\" = \"--help\" ]; then exit 0; fi\nexit 1\n")
            .expect("write mach");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        git_in(td.path(), &["add", "."]);
        git_in(td.path(), &["commit", "-q", "-m", "base"]);

        let worktree = Worktree::new(td.path());
        let repo = GitRepo::new(td.path());
        let commit = TryCommit::stage(
            &repo,
            &worktree,
            None,
            0,
            false,
            FuzzyConfig::default(),
            None,
        )
        .expect("stage");

        let err = commit.push(&Ctx::background()).unwrap_err();
        assert!(FerryError::is_retryable(&err));
    }

    #[test]
    fn fuzzy_single_promotes_one_query() {
        let fuzzy = FuzzyConfig::single("web-platform-tests !asan");
        assert_eq!(fuzzy.queries, vec!["web-platform-tests !asan".to_string()]);
        assert!(fuzzy.artifact);
    }
}
