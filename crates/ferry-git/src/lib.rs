//! Git operations and ref-backed persistence for ferry.
//!
//! This crate provides the repository plumbing the sync engine runs on:
//! [`GitRepo`] for read-side queries and ref manipulation, [`Worktree`]
//! for operation-scoped checkouts, and [`RefStore`] for persisting JSON
//! payloads as references inside the repository itself.
//!
//! # Example
//!
//! ```no_run
//! use ferry_git::{GitRepo, RefStore};
//! use std::path::Path;
//!
//! let repo = GitRepo::new(Path::new("/srv/gecko"));
//! let store = RefStore::new(&repo);
//! let names = store.list("try/downstream/1234").expect("list");
//! println!("{} try pushes", names.len());
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use ferry_process::{CommandResult, run_command_in_dir, run_command_with_ctx};
use ferry_types::Ctx;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Namespace under which all sync state lives.
pub const REF_PREFIX: &str = "refs/syncs";

/// Local namespace PR head refs are fetched into.
pub const PR_REF_PREFIX: &str = "refs/remotes/origin/pr/";

/// Handle to a local git repository.
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open a repository, verifying that the path actually is one.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let repo = Self::new(path);
        let result = repo.git(&["rev-parse", "--git-dir"])?;
        if !result.success {
            bail!("{} is not a git repository", repo.path.display());
        }
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn git(&self, args: &[&str]) -> Result<CommandResult> {
        run_command_in_dir("git", args, &self.path)
    }

    /// Run git, demanding success, returning trimmed stdout.
    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let result = self.git(args)?;
        if !result.success {
            bail!(
                "git {:?} failed in {}: {}",
                args,
                self.path.display(),
                result.stderr.trim()
            );
        }
        Ok(result.stdout.trim().to_string())
    }

    /// Resolve a revision to a full sha.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        self.git_ok(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
    }

    /// Whether `rev` is an ancestor of `other`.
    pub fn is_ancestor(&self, rev: &str, other: &str) -> Result<bool> {
        let result = self.git(&["merge-base", "--is-ancestor", rev, other])?;
        match result.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!(
                "merge-base --is-ancestor {rev} {other} failed: {}",
                result.stderr.trim()
            ),
        }
    }

    pub fn ref_exists(&self, name: &str) -> Result<bool> {
        let result = self.git(&["show-ref", "--verify", "--quiet", name])?;
        Ok(result.success)
    }

    /// Point `name` at `oid`, creating the ref if needed.
    pub fn update_ref(&self, name: &str, oid: &str) -> Result<()> {
        self.git_ok(&["update-ref", name, oid]).map(|_| ())
    }

    pub fn delete_ref(&self, name: &str) -> Result<()> {
        self.git_ok(&["update-ref", "-d", name]).map(|_| ())
    }

    /// Write `content` into the object database, returning the blob oid.
    pub fn hash_object(&self, content: &[u8]) -> Result<String> {
        let mut child = Command::new("git")
            .args(["hash-object", "-w", "--stdin"])
            .current_dir(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn git hash-object")?;

        child
            .stdin
            .take()
            .context("git hash-object has no stdin")?
            .write_all(content)
            .context("failed to write git hash-object stdin")?;

        let output = child
            .wait_with_output()
            .context("failed to wait for git hash-object")?;
        if !output.status.success() {
            bail!(
                "git hash-object failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Read the blob a ref (or oid) points at.
    pub fn cat_blob(&self, name: &str) -> Result<String> {
        self.git_ok(&["cat-file", "blob", name])
    }

    /// All refs under `prefix` as `(sha, refname)` pairs.
    pub fn refs_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let out = self.git_ok(&[
            "for-each-ref",
            "--format=%(objectname) %(refname)",
            prefix,
        ])?;
        let mut refs = Vec::new();
        for line in out.lines() {
            if let Some((sha, name)) = line.split_once(' ') {
                refs.push((sha.to_string(), name.to_string()));
            }
        }
        Ok(refs)
    }

    /// Fetch a refspec, honoring the context's deadline: fetches hit the
    /// network and are the one git operation that can stall indefinitely.
    pub fn fetch(&self, remote: &str, refspec: &str, ctx: &Ctx) -> Result<()> {
        let result = run_command_with_ctx(
            "git",
            &["fetch", "--quiet", remote, refspec],
            &self.path,
            ctx,
        )?;
        if !result.success {
            bail!(
                "git fetch {remote} {refspec} failed: {}",
                result.stderr.trim()
            );
        }
        Ok(())
    }

    /// Find the PR whose head is `rev`.
    ///
    /// PR head refs are fetched into [`PR_REF_PREFIX`] first, so a status
    /// delivered before the local clone saw the PR still resolves.
    pub fn pr_for_commit(&self, rev: &str, ctx: &Ctx) -> Result<Option<u64>> {
        self.fetch("origin", &format!("+refs/pull/*/head:{PR_REF_PREFIX}*"), ctx)?;
        for (sha, name) in self.refs_with_prefix(PR_REF_PREFIX.trim_end_matches('/'))? {
            if sha == rev {
                let id = name
                    .strip_prefix(PR_REF_PREFIX)
                    .and_then(|tail| tail.parse().ok());
                return Ok(id);
            }
        }
        Ok(None)
    }
}

/// An operation-scoped checkout of a repository.
///
/// Worktrees are handed out by the (external) worktree pool; this type
/// covers the mutations the try-commit builder performs on one.
#[derive(Debug, Clone)]
pub struct Worktree {
    repo: GitRepo,
}

impl Worktree {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            repo: GitRepo::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.repo.path()
    }

    pub fn head_sha(&self) -> Result<String> {
        self.repo.rev_parse("HEAD")
    }

    /// `git reset --hard [rev]`, discarding working tree changes.
    pub fn reset_hard(&self, rev: Option<&str>) -> Result<()> {
        let mut args = vec!["reset", "--hard"];
        if let Some(rev) = rev {
            args.push(rev);
        }
        self.repo.git_ok(&args).map(|_| ())
    }

    pub fn add(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.repo.git_ok(&args).map(|_| ())
    }

    /// Commit staged changes, returning the new head sha.
    pub fn commit(&self, message: &str) -> Result<String> {
        self.repo.git_ok(&["commit", "-m", message])?;
        self.head_sha()
    }

    pub fn file_exists(&self, rel: &str) -> bool {
        self.path().join(rel).exists()
    }
}

/// JSON payloads persisted as refs under `refs/syncs/`.
///
/// A record named `try/downstream/1234/0` is a blob written with
/// `hash-object -w` and pointed at by `refs/syncs/try/downstream/1234/0`.
/// The payload travels with the repository: clones, backups, and fetches
/// of the ref namespace carry the sync state along.
#[derive(Debug, Clone)]
pub struct RefStore<'a> {
    repo: &'a GitRepo,
}

impl<'a> RefStore<'a> {
    pub fn new(repo: &'a GitRepo) -> Self {
        Self { repo }
    }

    /// Fully qualified ref name for a record.
    pub fn ref_name(name: &str) -> String {
        format!("{REF_PREFIX}/{name}")
    }

    /// Persist `value`, overwriting any existing payload under `name`.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value).context("failed to serialize record")?;
        let oid = self.repo.hash_object(&json)?;
        debug!(name, oid = %oid, "writing sync record");
        self.repo.update_ref(&Self::ref_name(name), &oid)
    }

    /// Load the record under `name`, `None` when absent.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let ref_name = Self::ref_name(name);
        if !self.repo.ref_exists(&ref_name)? {
            return Ok(None);
        }
        let content = self.repo.cat_blob(&ref_name)?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse record {name}"))?;
        Ok(Some(value))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        self.repo.ref_exists(&Self::ref_name(name))
    }

    /// Delete the record under `name`. Deleting a missing record is fine.
    pub fn delete(&self, name: &str) -> Result<()> {
        let ref_name = Self::ref_name(name);
        if self.repo.ref_exists(&ref_name)? {
            self.repo.delete_ref(&ref_name)?;
        }
        Ok(())
    }

    /// Record names (relative to the store) under `prefix`.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full = Self::ref_name(prefix);
        let refs = self.repo.refs_with_prefix(&full)?;
        let strip = format!("{REF_PREFIX}/");
        Ok(refs
            .into_iter()
            .filter_map(|(_, name)| name.strip_prefix(&strip).map(String::from))
            .collect())
    }

    /// Next sequence id under `prefix`, scanning existing numeric tails.
    ///
    /// Callers serialize allocation under the per-sync lock, which is what
    /// makes the counter monotonic.
    pub fn next_seq(&self, prefix: &str) -> Result<u64> {
        let names = self.list(prefix)?;
        let max = names
            .iter()
            .filter_map(|name| name.rsplit('/').next())
            .filter_map(|tail| tail.parse::<u64>().ok())
            .max();
        Ok(max.map(|n| n + 1).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use super::*;

    fn git_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(status.status.success(), "git {args:?} failed");
    }

    fn init_git_repo(dir: &Path) {
        git_in(dir, &["init", "-q", "-b", "main"]);
        git_in(dir, &["config", "user.email", "test@example.com"]);
        git_in(dir, &["config", "user.name", "Test User"]);
    }

    fn make_commit(dir: &Path, msg: &str) {
        git_in(dir, &["commit", "--allow-empty", "-m", msg]);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        rev: Option<String>,
        status: String,
    }

    #[test]
    fn open_rejects_non_repo() {
        let td = tempdir().expect("tempdir");
        assert!(GitRepo::open(td.path()).is_err());

        init_git_repo(td.path());
        GitRepo::open(td.path()).expect("open repo");
    }

    #[test]
    fn rev_parse_resolves_head() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "one");

        let repo = GitRepo::new(td.path());
        let sha = repo.rev_parse("HEAD").expect("rev-parse");
        assert_eq!(sha.len(), 40);
        assert!(repo.rev_parse("no-such-rev").is_err());
    }

    #[test]
    fn is_ancestor_distinguishes_branches() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "base");
        let repo = GitRepo::new(td.path());
        let base = repo.rev_parse("HEAD").expect("base");

        make_commit(td.path(), "tip");
        let tip = repo.rev_parse("HEAD").expect("tip");

        assert!(repo.is_ancestor(&base, "HEAD").expect("ancestor"));
        assert!(!repo.is_ancestor(&tip, &base).expect("not ancestor"));
    }

    #[test]
    fn refstore_round_trips() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "one");
        let repo = GitRepo::new(td.path());
        let store = RefStore::new(&repo);

        let record = Record {
            rev: Some("abc".to_string()),
            status: "open".to_string(),
        };
        store.save("try/downstream/1234/0", &record).expect("save");
        assert!(store.exists("try/downstream/1234/0").expect("exists"));

        let loaded: Record = store
            .load("try/downstream/1234/0")
            .expect("load")
            .expect("present");
        assert_eq!(loaded, record);
    }

    #[test]
    fn refstore_load_missing_is_none() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());
        let store = RefStore::new(&repo);

        let loaded: Option<Record> = store.load("try/downstream/9/0").expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn refstore_delete_removes_and_tolerates_missing() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "one");
        let repo = GitRepo::new(td.path());
        let store = RefStore::new(&repo);

        let record = Record {
            rev: None,
            status: "open".to_string(),
        };
        store.save("try/downstream/1/0", &record).expect("save");
        store.delete("try/downstream/1/0").expect("delete");
        assert!(!store.exists("try/downstream/1/0").expect("exists"));

        // Deleting again is not an error.
        store.delete("try/downstream/1/0").expect("delete again");
    }

    #[test]
    fn refstore_list_scopes_to_prefix() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "one");
        let repo = GitRepo::new(td.path());
        let store = RefStore::new(&repo);

        let record = Record {
            rev: None,
            status: "open".to_string(),
        };
        store.save("try/downstream/1/0", &record).expect("save");
        store.save("try/downstream/1/1", &record).expect("save");
        store.save("try/downstream/2/0", &record).expect("save");

        let names = store.list("try/downstream/1").expect("list");
        assert_eq!(
            names,
            vec![
                "try/downstream/1/0".to_string(),
                "try/downstream/1/1".to_string()
            ]
        );

        let all = store.list("try").expect("list all");
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn next_seq_is_monotonic() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "one");
        let repo = GitRepo::new(td.path());
        let store = RefStore::new(&repo);

        assert_eq!(store.next_seq("try/downstream/5").expect("seq"), 0);

        let record = Record {
            rev: None,
            status: "open".to_string(),
        };
        store.save("try/downstream/5/0", &record).expect("save");
        assert_eq!(store.next_seq("try/downstream/5").expect("seq"), 1);

        store.save("try/downstream/5/4", &record).expect("save");
        assert_eq!(store.next_seq("try/downstream/5").expect("seq"), 5);
    }

    #[test]
    fn worktree_reset_discards_changes() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        std::fs::write(td.path().join("file.txt"), "v1").expect("write");
        git_in(td.path(), &["add", "file.txt"]);
        make_commit(td.path(), "one");

        let wt = Worktree::new(td.path());
        let before = wt.head_sha().expect("head");

        std::fs::write(td.path().join("file.txt"), "v2").expect("write");
        wt.add(&["file.txt"]).expect("add");
        let after = wt.commit("two").expect("commit");
        assert_ne!(before, after);

        wt.reset_hard(Some(&before)).expect("reset");
        assert_eq!(wt.head_sha().expect("head"), before);
        assert_eq!(
            std::fs::read_to_string(td.path().join("file.txt")).expect("read"),
            "v1"
        );
    }

    #[test]
    fn pr_for_commit_maps_head_to_pr() {
        let upstream = tempdir().expect("tempdir");
        init_git_repo(upstream.path());
        make_commit(upstream.path(), "base");

        // A PR is a ref under refs/pull/<n>/head in the upstream repo.
        git_in(upstream.path(), &["update-ref", "refs/pull/42/head", "HEAD"]);
        let pr_head = GitRepo::new(upstream.path())
            .rev_parse("HEAD")
            .expect("rev");

        let local = tempdir().expect("tempdir");
        git_in(
            local.path(),
            &[
                "clone",
                "-q",
                upstream.path().to_str().expect("path"),
                ".",
            ],
        );
        let repo = GitRepo::new(local.path());

        let ctx = Ctx::background();
        assert_eq!(repo.pr_for_commit(&pr_head, &ctx).expect("lookup"), Some(42));
        assert_eq!(
            repo.pr_for_commit("0000000000000000000000000000000000000000", &ctx)
                .expect("lookup"),
            None
        );
    }
}
