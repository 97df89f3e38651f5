//! Archive staging for pulled packages.

use std::path::{Component, Path};

use flate2::read::GzDecoder;
use unikit_common::ctx::Context;
use unikit_common::error::{Result, UnikitError};

/// Unpacks a pulled `.tar` / `.tar.gz` / `.tgz` artifact into `dest`.
///
/// Entries that would escape `dest` (absolute paths, `..` components) are
/// rejected. The destination is created if missing; on failure it is
/// removed again so a retry starts clean.
///
/// # Errors
///
/// Returns a transient I/O error for unreadable or malicious archives.
pub fn unpack(ctx: &Context, archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest).map_err(|e| UnikitError::io(dest, e))?;
    let result = unpack_entries(ctx, archive, dest);
    if result.is_err() {
        let _ = std::fs::remove_dir_all(dest);
    }
    result
}

fn unpack_entries(ctx: &Context, archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive).map_err(|e| UnikitError::io(archive, e))?;

    let gzipped = archive
        .extension()
        .is_some_and(|ext| ext == "gz" || ext == "tgz");
    let reader: Box<dyn std::io::Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut tar = tar::Archive::new(reader);
    let entries = tar.entries().map_err(|e| UnikitError::TransientIo {
        message: format!("unreadable archive {}: {e}", archive.display()),
    })?;

    for entry in entries {
        ctx.check()?;
        let mut entry = entry.map_err(|e| UnikitError::TransientIo {
            message: format!("unreadable archive entry in {}: {e}", archive.display()),
        })?;
        let path = entry
            .path()
            .map_err(|e| UnikitError::TransientIo {
                message: format!("bad entry path in {}: {e}", archive.display()),
            })?
            .into_owned();
        if !is_safe_relative(&path) {
            return Err(UnikitError::TransientIo {
                message: format!(
                    "archive {} escapes destination: {}",
                    archive.display(),
                    path.display()
                ),
            });
        }
        let _ = entry
            .unpack(dest.join(&path))
            .map_err(|e| UnikitError::TransientIo {
                message: format!("cannot unpack {}: {e}", path.display()),
            })?;
    }
    tracing::debug!(archive = %archive.display(), dest = %dest.display(), "archive unpacked");
    Ok(())
}

fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn build_tar_gz(dest: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(dest).expect("create archive");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, *content)
                .expect("append");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip")
            .flush()
            .expect("flush");
    }

    #[test]
    fn unpack_extracts_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("rootfs.tar.gz");
        build_tar_gz(&archive, &[("bin/server", b"ELF"), ("etc/config", b"port=80")]);

        let dest = dir.path().join("unpacked");
        unpack(&Context::background(), &archive, &dest).expect("unpack");
        assert_eq!(std::fs::read(dest.join("bin/server")).expect("read"), b"ELF");
        assert_eq!(
            std::fs::read(dest.join("etc/config")).expect("read"),
            b"port=80"
        );
    }

    #[test]
    fn unpack_rejects_path_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("evil.tar.gz");
        build_tar_gz(&archive, &[("../escape", b"nope")]);

        let dest = dir.path().join("unpacked");
        let err = unpack(&Context::background(), &archive, &dest).unwrap_err();
        assert!(err.is_transient());
        // Failed unpacks clean up after themselves.
        assert!(!dest.exists());
    }

    #[test]
    fn unpack_honours_cancellation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("rootfs.tar.gz");
        build_tar_gz(&archive, &[("file", b"data")]);

        let ctx = Context::background();
        ctx.cancel();
        let dest = dir.path().join("unpacked");
        assert!(matches!(
            unpack(&ctx, &archive, &dest),
            Err(unikit_common::error::UnikitError::Canceled)
        ));
    }
}
