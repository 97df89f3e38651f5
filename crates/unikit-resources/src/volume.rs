//! Volume records: host directories mounted into guests.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use unikit_common::config::RuntimeConfig;
use unikit_common::constants::VOLUME_KIND;
use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::validate_dns_label;
use unikit_store::{Store, StoredObject};

/// Binding state of a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    /// Declared but not yet bound to a machine.
    #[default]
    Pending,
    /// Attached to at least one machine.
    Bound,
    /// The host source disappeared.
    Lost,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Bound => write!(f, "Bound"),
            Self::Lost => write!(f, "Lost"),
        }
    }
}

/// Desired state of a volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Driver implementing the mount, e.g. `9pfs`.
    pub driver: String,
    /// Host-side source path.
    pub source: String,
    /// Guest-side mount point.
    pub destination: String,
    /// Mount mode string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    /// Whether the guest sees the volume read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Whether unikit owns the source directory's lifecycle.
    #[serde(default)]
    pub managed: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Observed state of a volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeStatus {
    /// Pending/Bound/Lost.
    pub state: VolumeState,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// A named volume with its spec/status pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume name.
    pub name: String,
    /// Desired state.
    pub spec: VolumeSpec,
    /// Observed state.
    pub status: VolumeStatus,
}

impl StoredObject for Volume {
    const KIND: &'static str = "volume";

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
            status: if status.is_null() {
                VolumeStatus::default()
            } else {
                serde_json::from_value(status)?
            },
        })
    }
}

/// Splits a `host:guest` volume argument into its two parts.
///
/// # Errors
///
/// Returns [`UnikitError::InvalidInput`] unless the string has exactly two
/// non-empty colon-separated parts.
pub fn parse_volume_binding(s: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [source, destination] if !source.is_empty() && !destination.is_empty() => {
            Ok(((*source).to_string(), (*destination).to_string()))
        }
        _ => Err(UnikitError::InvalidInput {
            message: format!("invalid volume specification: {s} (expected host:guest)"),
        }),
    }
}

/// Service owning the volume store.
pub struct VolumeService {
    store: Store<Volume>,
}

impl VolumeService {
    /// Opens the volume store under the runtime directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the store directory cannot be created.
    pub fn open(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            store: Store::open(config.kind_dir(VOLUME_KIND))?,
        })
    }

    /// Creates a volume, or returns the existing one with the same name.
    ///
    /// Volume creation is idempotent by name so callers can re-run without
    /// first checking existence.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for bad names or any store error.
    pub fn create(&self, ctx: &Context, name: &str, spec: VolumeSpec) -> Result<Volume> {
        validate_dns_label(name)?;
        if let Ok(existing) = self.store.get(ctx, name) {
            return Ok(existing);
        }
        let volume = Volume {
            name: name.to_string(),
            spec,
            status: VolumeStatus::default(),
        };
        tracing::debug!(name, source = %volume.spec.source, "volume created");
        self.store.upsert(ctx, &volume)
    }

    /// Fetches a volume by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names.
    pub fn get(&self, ctx: &Context, name: &str) -> Result<Volume> {
        self.store.get(ctx, name)
    }

    /// Lists all volumes.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub fn list(&self, ctx: &Context) -> Result<Vec<Volume>> {
        self.store.list(ctx)
    }

    /// Marks a volume bound to a machine.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names.
    pub fn bind(&self, ctx: &Context, name: &str) -> Result<Volume> {
        let mut volume = self.store.get(ctx, name)?;
        volume.status.state = VolumeState::Bound;
        self.store.upsert(ctx, &volume)
    }

    /// Deletes a volume by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown names.
    pub fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        self.store.delete(ctx, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_binding_happy_path() {
        let (source, destination) = parse_volume_binding("/data:/mnt/data").expect("parse");
        assert_eq!(source, "/data");
        assert_eq!(destination, "/mnt/data");
    }

    #[test]
    fn parse_binding_rejects_wrong_arity() {
        assert!(parse_volume_binding("/data").is_err());
        assert!(parse_volume_binding("/a:/b:/c").is_err());
        assert!(parse_volume_binding(":/b").is_err());
        assert!(parse_volume_binding("/a:").is_err());
    }

    #[test]
    fn create_is_idempotent_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RuntimeConfig::with_runtime_dir(dir.path());
        let service = VolumeService::open(&config).expect("open");
        let ctx = Context::background();

        let spec = VolumeSpec {
            driver: "9pfs".into(),
            source: "/data".into(),
            destination: "/mnt".into(),
            ..VolumeSpec::default()
        };
        let first = service.create(&ctx, "data", spec.clone()).expect("create");

        let mut other = spec;
        other.source = "/other".into();
        let second = service.create(&ctx, "data", other).expect("create again");
        // The original spec wins; repeated create returns the existing volume.
        assert_eq!(second.spec.source, first.spec.source);
    }

    #[test]
    fn bind_transitions_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RuntimeConfig::with_runtime_dir(dir.path());
        let service = VolumeService::open(&config).expect("open");
        let ctx = Context::background();

        let _ = service
            .create(&ctx, "data", VolumeSpec::default())
            .expect("create");
        let bound = service.bind(&ctx, "data").expect("bind");
        assert_eq!(bound.status.state, VolumeState::Bound);
    }
}
