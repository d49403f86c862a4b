//! Ref-backed secondary indices for ferry.
//!
//! Two lookups have to be fast and durable: commit-sha → try push
//! ([`TryCommitIndex`]) and task-group-id → try push ([`TaskGroupIndex`]).
//! Both are persisted as refs next to the records they point at, one entry
//! per key, valued by the owning process name.
//!
//! Index writes happen strictly after record writes, so a crash between
//! the two leaves at worst a stale entry; lookups detect that (the entry's
//! record no longer exists) and clean it up lazily.

use anyhow::Result;
use ferry_git::{GitRepo, RefStore};
use ferry_types::{FerryError, ProcessName};
use tracing::{debug, warn};

/// Namespace under `refs/syncs/` holding index entries.
const INDEX_PREFIX: &str = "index";

/// Marker payload written by `get_or_create`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct IndexMeta {
    version: u32,
}

/// Generic key → process-name index stored as refs.
#[derive(Debug)]
struct RefIndex<'a> {
    repo: &'a GitRepo,
    name: &'static str,
    /// Shard the key into `<first-two>/<rest>` path components. Used for
    /// 40-hex commit keys so no single ref directory grows unbounded.
    sharded: bool,
}

impl<'a> RefIndex<'a> {
    fn new(repo: &'a GitRepo, name: &'static str, sharded: bool) -> Self {
        Self { repo, name, sharded }
    }

    fn store(&self) -> RefStore<'a> {
        RefStore::new(self.repo)
    }

    fn meta_path(&self) -> String {
        format!("{INDEX_PREFIX}/{}/meta", self.name)
    }

    fn key_path(&self, key: &str) -> String {
        if self.sharded && key.len() > 2 {
            let (head, tail) = key.split_at(2);
            format!("{INDEX_PREFIX}/{}/{head}/{tail}", self.name)
        } else {
            format!("{INDEX_PREFIX}/{}/{key}", self.name)
        }
    }

    fn ensure(&self) -> Result<()> {
        let store = self.store();
        if !store.exists(&self.meta_path())? {
            store.save(&self.meta_path(), &IndexMeta { version: 1 })?;
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<ProcessName>> {
        let store = self.store();
        let path = self.key_path(key);
        let Some(raw) = store.load::<String>(&path)? else {
            return Ok(None);
        };
        let name = ProcessName::parse(&raw)
            .map_err(|e| anyhow::anyhow!("corrupt index entry {path}: {e}"))?;

        // A crash between record deletion and index cleanup leaves the
        // entry dangling; treat it as a miss and drop it.
        if !store.exists(&name.to_string())? {
            warn!(index = self.name, key, entry = %name, "dropping stale index entry");
            store.delete(&path)?;
            return Ok(None);
        }
        Ok(Some(name))
    }

    fn insert(&self, key: &str, name: &ProcessName) -> Result<()> {
        let store = self.store();
        let path = self.key_path(key);
        if let Some(existing) = store.load::<String>(&path)? {
            if existing == name.to_string() {
                return Ok(());
            }
            return Err(FerryError::Value(format!(
                "index {} key {key} already maps to {existing}, refusing {name}",
                self.name
            ))
            .into());
        }
        debug!(index = self.name, key, entry = %name, "inserting index entry");
        store.save(&path, &name.to_string())
    }

    fn delete(&self, key: &str, name: &ProcessName) -> Result<()> {
        let store = self.store();
        let path = self.key_path(key);
        match store.load::<String>(&path)? {
            Some(existing) if existing == name.to_string() => store.delete(&path),
            Some(existing) => {
                warn!(
                    index = self.name,
                    key,
                    entry = %existing,
                    requested = %name,
                    "index entry owned by another record, leaving it"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Commit sha → try push. Enforces try-rev uniqueness.
#[derive(Debug)]
pub struct TryCommitIndex<'a> {
    idx: RefIndex<'a>,
}

impl<'a> TryCommitIndex<'a> {
    pub fn new(repo: &'a GitRepo) -> Self {
        Self {
            idx: RefIndex::new(repo, "try-commit", true),
        }
    }

    /// Open the index, writing its marker record on first use.
    pub fn get_or_create(repo: &'a GitRepo) -> Result<Self> {
        let index = Self::new(repo);
        index.idx.ensure()?;
        Ok(index)
    }

    pub fn get(&self, rev: &str) -> Result<Option<ProcessName>> {
        self.idx.get(rev)
    }

    pub fn insert(&self, rev: &str, name: &ProcessName) -> Result<()> {
        self.idx.insert(rev, name)
    }

    pub fn delete(&self, rev: &str, name: &ProcessName) -> Result<()> {
        self.idx.delete(rev, name)
    }
}

/// Task group id → try push. Enforces taskgroup-id uniqueness.
#[derive(Debug)]
pub struct TaskGroupIndex<'a> {
    idx: RefIndex<'a>,
}

impl<'a> TaskGroupIndex<'a> {
    pub fn new(repo: &'a GitRepo) -> Self {
        Self {
            idx: RefIndex::new(repo, "taskgroup", false),
        }
    }

    /// Open the index, writing its marker record on first use.
    pub fn get_or_create(repo: &'a GitRepo) -> Result<Self> {
        let index = Self::new(repo);
        index.idx.ensure()?;
        Ok(index)
    }

    pub fn get(&self, taskgroup_id: &str) -> Result<Option<ProcessName>> {
        self.idx.get(taskgroup_id)
    }

    pub fn insert(&self, taskgroup_id: &str, name: &ProcessName) -> Result<()> {
        self.idx.insert(taskgroup_id, name)
    }

    pub fn delete(&self, taskgroup_id: &str, name: &ProcessName) -> Result<()> {
        self.idx.delete(taskgroup_id, name)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::process::Command;

    use ferry_git::RefStore;
    use tempfile::tempdir;

    use super::*;

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
        git_in(dir, &["commit", "--allow-empty", "-m", "init"]);
    }

    fn record_for(repo: &GitRepo, name: &ProcessName) {
        RefStore::new(repo)
            .save(&name.to_string(), &serde_json::json!({"status": "open"}))
            .expect("save record");
    }

    const REV: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn insert_then_get_round_trips() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());
        let index = TryCommitIndex::get_or_create(&repo).expect("index");

        let name = ProcessName::new("downstream", 1234, 0);
        record_for(&repo, &name);
        index.insert(REV, &name).expect("insert");

        assert_eq!(index.get(REV).expect("get"), Some(name));
        assert_eq!(index.get("ffffffffff").expect("get"), None);
    }

    #[test]
    fn commit_keys_are_sharded() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());
        let index = TryCommitIndex::get_or_create(&repo).expect("index");

        let name = ProcessName::new("downstream", 1, 0);
        record_for(&repo, &name);
        index.insert(REV, &name).expect("insert");

        let refs = repo
            .refs_with_prefix("refs/syncs/index/try-commit/01")
            .expect("refs");
        assert_eq!(refs.len(), 1);
        assert!(refs[0].1.ends_with(&REV[2..]));
    }

    #[test]
    fn insert_is_idempotent_for_same_owner() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());
        let index = TaskGroupIndex::get_or_create(&repo).expect("index");

        let name = ProcessName::new("downstream", 1, 0);
        record_for(&repo, &name);
        index.insert("AbCdEf123456", &name).expect("insert");
        index.insert("AbCdEf123456", &name).expect("reinsert");
    }

    #[test]
    fn insert_conflicting_owner_is_value_error() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());
        let index = TryCommitIndex::get_or_create(&repo).expect("index");

        let first = ProcessName::new("downstream", 1, 0);
        let second = ProcessName::new("downstream", 2, 0);
        record_for(&repo, &first);
        record_for(&repo, &second);

        index.insert(REV, &first).expect("insert");
        let err = index.insert(REV, &second).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FerryError>(),
            Some(FerryError::Value(_))
        ));
        // Original mapping intact.
        assert_eq!(index.get(REV).expect("get"), Some(first));
    }

    #[test]
    fn delete_requires_matching_owner() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());
        let index = TaskGroupIndex::get_or_create(&repo).expect("index");

        let owner = ProcessName::new("downstream", 1, 0);
        let other = ProcessName::new("downstream", 2, 0);
        record_for(&repo, &owner);
        record_for(&repo, &other);
        index.insert("groupA", &owner).expect("insert");

        // Wrong owner: entry survives.
        index.delete("groupA", &other).expect("delete");
        assert_eq!(index.get("groupA").expect("get"), Some(owner.clone()));

        // Right owner: entry removed; removing again is fine.
        index.delete("groupA", &owner).expect("delete");
        assert_eq!(index.get("groupA").expect("get"), None);
        index.delete("groupA", &owner).expect("delete again");
    }

    #[test]
    fn stale_entry_is_cleaned_on_lookup() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());
        let index = TryCommitIndex::get_or_create(&repo).expect("index");

        let name = ProcessName::new("downstream", 1, 0);
        record_for(&repo, &name);
        index.insert(REV, &name).expect("insert");

        // Simulate a crash that deleted the record but not the entry.
        RefStore::new(&repo)
            .delete(&name.to_string())
            .expect("delete record");

        assert_eq!(index.get(REV).expect("get"), None);
        // The entry itself is gone now too.
        let refs = repo
            .refs_with_prefix("refs/syncs/index/try-commit/01")
            .expect("refs");
        assert!(refs.is_empty());
    }

    #[test]
    fn get_or_create_writes_marker_once() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        let repo = GitRepo::new(td.path());

        TryCommitIndex::get_or_create(&repo).expect("create");
        TryCommitIndex::get_or_create(&repo).expect("reopen");

        let refs = repo
            .refs_with_prefix("refs/syncs/index/try-commit/meta")
            .expect("refs");
        assert_eq!(refs.len(), 1);
    }
}
