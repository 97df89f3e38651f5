//! On-disk store implementation.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde_json::Value;
use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};

use crate::hook::{BeforeHook, Op};

/// An entity the store knows how to persist as a spec/status pair.
pub trait StoredObject: Clone + Send + 'static {
    /// The kind string used as the error subject, e.g. `"machine"`.
    const KIND: &'static str;

    /// Name the object is filed under.
    fn object_name(&self) -> &str;

    /// Serialises the object into its `(spec, status)` documents.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the object cannot be encoded.
    fn to_documents(&self) -> Result<(Value, Value)>;

    /// Rebuilds the object from its persisted documents.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if either document is malformed.
    fn from_documents(name: &str, spec: Value, status: Value) -> Result<Self>;
}

/// Persistent map from name to spec/status pair for one object kind.
pub struct Store<T: StoredObject> {
    root: PathBuf,
    hook: Option<Box<dyn BeforeHook<T>>>,
    // Per-process linearisability; the advisory file lock covers other
    // processes.
    serial: Mutex<()>,
}

impl<T: StoredObject> Store<T> {
    /// Opens (creating if necessary) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| UnikitError::io(&root, e))?;
        Ok(Self {
            root,
            hook: None,
            serial: Mutex::new(()),
        })
    }

    /// Installs a before-hook consulted on every operation.
    #[must_use]
    pub fn with_hook(mut self, hook: Box<dyn BeforeHook<T>>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Root directory of this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetches one object by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names, `Busy` when another process
    /// holds the record lock, and any hook rejection verbatim.
    pub fn get(&self, ctx: &Context, name: &str) -> Result<T> {
        ctx.check()?;
        let _serial = self.serialize()?;
        let _lock = self.lock_record(name)?;
        let obj = self.read_record(name)?;
        match self.run_hook(Op::Get, &obj)? {
            Some(obj) => Ok(obj),
            None => Err(self.not_found(name)),
        }
    }

    /// Lists every object of this kind, sorted by name.
    ///
    /// Records the hook discards are skipped; records that fail to parse
    /// surface as errors rather than being silently dropped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read, or a fatal
    /// error for corrupt records.
    pub fn list(&self, ctx: &Context) -> Result<Vec<T>> {
        ctx.check()?;
        let _serial = self.serialize()?;
        let mut names = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| UnikitError::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| UnikitError::io(&self.root, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "spec") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        let mut objects = Vec::with_capacity(names.len());
        for name in names {
            ctx.check()?;
            let obj = self.read_record(&name)?;
            if let Some(obj) = self.run_hook(Op::List, &obj)? {
                objects.push(obj);
            }
        }
        Ok(objects)
    }

    /// Creates or replaces an object, returning the stored form.
    ///
    /// # Errors
    ///
    /// Returns `Busy` on cross-process contention, a hook rejection
    /// verbatim, or an I/O error if the record cannot be written.
    pub fn upsert(&self, ctx: &Context, obj: &T) -> Result<T> {
        ctx.check()?;
        let _serial = self.serialize()?;
        let obj = match self.run_hook(Op::Upsert, obj)? {
            Some(obj) => obj,
            None => return Err(self.not_found(obj.object_name())),
        };
        let name = obj.object_name().to_string();
        let _lock = self.lock_record(&name)?;
        let (spec, status) = obj.to_documents()?;
        self.write_document(&self.spec_path(&name), &spec)?;
        self.write_document(&self.status_path(&name), &status)?;
        tracing::debug!(kind = T::KIND, name, "record upserted");
        Ok(obj)
    }

    /// Removes an object by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no record exists (idempotent delete surfaces
    /// this without side effects), `Busy` on contention, or a hook
    /// rejection verbatim.
    pub fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        ctx.check()?;
        let _serial = self.serialize()?;
        let _lock = self.lock_record(name)?;
        let obj = self.read_record(name)?;
        if self.run_hook(Op::Delete, &obj)?.is_none() {
            return Err(self.not_found(name));
        }
        for path in [self.spec_path(name), self.status_path(name)] {
            std::fs::remove_file(&path).map_err(|e| UnikitError::io(&path, e))?;
        }
        let _ = std::fs::remove_file(self.lock_path(name));
        tracing::debug!(kind = T::KIND, name, "record deleted");
        Ok(())
    }

    fn serialize(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.serial.lock().map_err(|_| UnikitError::Fatal {
            message: "store mutex poisoned".into(),
        })
    }

    fn run_hook(&self, op: Op, obj: &T) -> Result<Option<T>> {
        match &self.hook {
            Some(hook) => hook.before(op, obj),
            None => Ok(Some(obj.clone())),
        }
    }

    fn read_record(&self, name: &str) -> Result<T> {
        let spec_path = self.spec_path(name);
        if !spec_path.exists() {
            return Err(self.not_found(name));
        }
        let spec = self.read_document(&spec_path)?;
        let status_path = self.status_path(name);
        let status = if status_path.exists() {
            self.read_document(&status_path)?
        } else {
            Value::Null
        };
        T::from_documents(name, spec, status)
    }

    fn read_document(&self, path: &Path) -> Result<Value> {
        let file = File::open(path).map_err(|e| UnikitError::io(path, e))?;
        serde_json::from_reader(file).map_err(|e| UnikitError::Fatal {
            message: format!("corrupt store record {}: {e}", path.display()),
        })
    }

    fn write_document(&self, path: &Path, value: &Value) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| UnikitError::io(&self.root, e))?;
        serde_json::to_writer_pretty(&tmp, value)?;
        let _ = tmp.persist(path).map_err(|e| UnikitError::io(path, e.error))?;
        Ok(())
    }

    // Advisory cross-process lock, non-blocking. Held for the duration of
    // one operation; dropping the guard releases it.
    fn lock_record(&self, name: &str) -> Result<Flock<File>> {
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| UnikitError::io(&path, e))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK || errno == Errno::EAGAIN {
                UnikitError::Busy { name: name.into() }
            } else {
                UnikitError::Fatal {
                    message: format!("cannot lock record {name}: {errno}"),
                }
            }
        })
    }

    fn not_found(&self, name: &str) -> UnikitError {
        UnikitError::NotFound {
            kind: T::KIND,
            id: name.to_string(),
        }
    }

    fn spec_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.spec"))
    }

    fn status_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.status"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.lock"))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ToySpec {
        color: String,
        #[serde(flatten)]
        extra: serde_json::Map<String, Value>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Toy {
        name: String,
        spec: ToySpec,
        status: String,
    }

    impl StoredObject for Toy {
        const KIND: &'static str = "toy";

        fn object_name(&self) -> &str {
            &self.name
        }

        fn to_documents(&self) -> Result<(Value, Value)> {
            Ok((
                serde_json::to_value(&self.spec)?,
                serde_json::to_value(&self.status)?,
            ))
        }

        fn from_documents(name: &str, spec: Value, status: Value) -> Result<Self> {
            Ok(Self {
                name: name.to_string(),
                spec: serde_json::from_value(spec)?,
                status: serde_json::from_value(status)?,
            })
        }
    }

    fn toy(name: &str, color: &str) -> Toy {
        Toy {
            name: name.into(),
            spec: ToySpec {
                color: color.into(),
                extra: serde_json::Map::new(),
            },
            status: "new".into(),
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Store<Toy> = Store::open(dir.path().join("toy")).expect("open");
        let ctx = Context::background();

        let stored = store.upsert(&ctx, &toy("ball", "red")).expect("upsert");
        assert_eq!(stored.spec.color, "red");

        let fetched = store.get(&ctx, "ball").expect("get");
        assert_eq!(fetched, stored);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Store<Toy> = Store::open(dir.path().join("toy")).expect("open");
        let err = store.get(&Context::background(), "ghost").unwrap_err();
        assert!(matches!(err, UnikitError::NotFound { .. }));
    }

    #[test]
    fn list_is_sorted_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Store<Toy> = Store::open(dir.path().join("toy")).expect("open");
        let ctx = Context::background();
        for name in ["zebra", "apple", "mango"] {
            let _ = store.upsert(&ctx, &toy(name, "blue")).expect("upsert");
        }
        let names: Vec<String> = store
            .list(&ctx)
            .expect("list")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn delete_is_idempotent_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Store<Toy> = Store::open(dir.path().join("toy")).expect("open");
        let ctx = Context::background();
        let _ = store.upsert(&ctx, &toy("ball", "red")).expect("upsert");
        store.delete(&ctx, "ball").expect("first delete");
        let err = store.delete(&ctx, "ball").unwrap_err();
        assert!(matches!(err, UnikitError::NotFound { .. }));
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Store<Toy> = Store::open(dir.path().join("toy")).expect("open");
        let ctx = Context::background();

        let mut t = toy("ball", "red");
        let _ = t
            .spec
            .extra
            .insert("future_field".into(), Value::String("kept".into()));
        let _ = store.upsert(&ctx, &t).expect("upsert");

        let fetched = store.get(&ctx, "ball").expect("get");
        assert_eq!(
            fetched.spec.extra.get("future_field"),
            Some(&Value::String("kept".into()))
        );
    }

    struct RejectBlue;

    impl BeforeHook<Toy> for RejectBlue {
        fn before(&self, op: Op, obj: &Toy) -> Result<Option<Toy>> {
            if obj.spec.color == "blue" {
                if op == Op::List {
                    return Ok(None);
                }
                return Err(UnikitError::InvalidInput {
                    message: "blue toys not allowed".into(),
                });
            }
            Ok(Some(obj.clone()))
        }
    }

    #[test]
    fn hook_rejects_writes_and_filters_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unfiltered: Store<Toy> = Store::open(dir.path().join("toy")).expect("open");
        let ctx = Context::background();
        let _ = unfiltered.upsert(&ctx, &toy("sea", "blue")).expect("seed");
        let _ = unfiltered.upsert(&ctx, &toy("sun", "red")).expect("seed");

        let filtered: Store<Toy> = Store::open(dir.path().join("toy"))
            .expect("open")
            .with_hook(Box::new(RejectBlue));

        assert!(filtered.upsert(&ctx, &toy("sky", "blue")).is_err());
        let names: Vec<String> = filtered
            .list(&ctx)
            .expect("list")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["sun"]);
    }

    #[test]
    fn cancelled_context_aborts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Store<Toy> = Store::open(dir.path().join("toy")).expect("open");
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(
            store.get(&ctx, "ball"),
            Err(UnikitError::Canceled)
        ));
    }
}
