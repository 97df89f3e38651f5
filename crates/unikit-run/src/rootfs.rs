//! Root filesystem handling.
//!
//! The initramfs serializer is an external collaborator; the pipeline only
//! consumes its build contract. A rootfs that is already an archive file is
//! used as the initramfs directly; a directory needs a builder.

use std::path::{Path, PathBuf};

use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};

/// Serialises a root filesystem source into an initramfs archive.
pub trait InitrdBuilder: Send + Sync {
    /// Builds an initramfs from `source`, placing artifacts under
    /// `output_dir`, and returns the archive path.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization fails.
    fn build(&self, ctx: &Context, source: &Path, output_dir: &Path) -> Result<PathBuf>;
}

/// Stand-in used when no serializer is wired up: archive files pass
/// through, directories are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughInitrd;

impl InitrdBuilder for PassthroughInitrd {
    fn build(&self, ctx: &Context, source: &Path, _output_dir: &Path) -> Result<PathBuf> {
        ctx.check()?;
        if source.is_file() {
            return Ok(source.to_path_buf());
        }
        Err(UnikitError::InvalidInput {
            message: format!(
                "rootfs {} is a directory and no initramfs serializer is available",
                source.display()
            ),
        })
    }
}

/// Resolves a rootfs source to an initramfs path.
///
/// # Errors
///
/// Returns `NotFound` when the source does not exist, otherwise whatever
/// the builder reports.
pub fn resolve(
    ctx: &Context,
    builder: &dyn InitrdBuilder,
    source: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    if !source.exists() {
        return Err(UnikitError::NotFound {
            kind: "rootfs",
            id: source.display().to_string(),
        });
    }
    builder.build(ctx, source, output_dir)
}
