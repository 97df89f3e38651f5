//! SHA-256 digests for pulled artifacts.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use unikit_common::error::{Result, UnikitError};

/// Computes the hex SHA-256 digest of a file.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| UnikitError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| UnikitError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verifies a file against an expected hex digest.
///
/// A mismatch is reported as transient: re-pulling the artifact is the
/// appropriate recovery.
///
/// # Errors
///
/// Returns a transient I/O error on mismatch, or an I/O error if the file
/// cannot be read.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_hex(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(UnikitError::TransientIo {
            message: format!(
                "digest mismatch for {}: expected {expected}, got {actual}",
                path.display()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_known_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello").expect("write");
        assert_eq!(
            sha256_hex(&path).expect("digest"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn verify_accepts_case_insensitive_match() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello").expect("write");
        verify_sha256(
            &path,
            "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824",
        )
        .expect("verify");
    }

    #[test]
    fn verify_rejects_mismatch_as_transient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"hello").expect("write");
        let err = verify_sha256(&path, &"0".repeat(64)).unwrap_err();
        assert!(err.is_transient());
    }
}
