//! ELF probing for runner selection.
//!
//! Two questions are answered here: is a file a Unikraft unikernel image,
//! and is it a dynamic PIE Linux executable that the Linux-ABI loader can
//! host. Architecture is inferred from the ELF machine field.

use std::path::Path;

use object::read::elf::{Dyn, FileHeader, ProgramHeader};
use object::{Endianness, Object, ObjectSection, elf};
use unikit_common::error::{Result, UnikitError};
use unikit_common::types::Architecture;

/// Section name prefix Unikraft's linker scripts emit.
const UNIKRAFT_SECTION_PREFIX: &str = ".uk_";
/// Producer string found in the `.comment` section of Unikraft builds.
const UNIKRAFT_COMMENT: &str = "Unikraft";

/// Probes `path` for a Unikraft unikernel image.
///
/// Returns the inferred architecture when the signature matches, `None`
/// when the file is a well-formed ELF without the signature.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read; a non-ELF file is
/// reported as `Ok(None)` rather than an error.
pub fn detect_unikernel(path: &Path) -> Result<Option<Architecture>> {
    let data = std::fs::read(path).map_err(|e| UnikitError::io(path, e))?;
    let Ok(file) = object::File::parse(&*data) else {
        return Ok(None);
    };

    let mut signature = false;
    for section in file.sections() {
        let Ok(name) = section.name() else { continue };
        if name.starts_with(UNIKRAFT_SECTION_PREFIX) {
            signature = true;
            break;
        }
        if name == ".comment" {
            if let Ok(contents) = section.data() {
                if contents
                    .windows(UNIKRAFT_COMMENT.len())
                    .any(|w| w == UNIKRAFT_COMMENT.as_bytes())
                {
                    signature = true;
                    break;
                }
            }
        }
    }
    if !signature {
        return Ok(None);
    }
    Ok(Some(architecture_of(&data).unwrap_or(Architecture::X86_64)))
}

/// Infers the guest architecture from the ELF machine field.
#[must_use]
pub fn architecture_of(data: &[u8]) -> Option<Architecture> {
    match elf_machine(data)? {
        elf::EM_X86_64 | elf::EM_386 => Some(Architecture::X86_64),
        elf::EM_ARM => Some(Architecture::Arm),
        elf::EM_AARCH64 => Some(Architecture::Arm64),
        _ => None,
    }
}

/// Whether `path` is a dynamic PIE executable suitable for the Linux-ABI
/// loader.
///
/// Follows the Debian `hardening-check` heuristic: an `ET_DYN` image with
/// either `DT_FLAGS_1 & DF_1_PIE` set, or — as a fallback for toolchains
/// that omit the flag — a `PT_PHDR` program header.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read; malformed ELF data is
/// reported as `Ok(false)`.
pub fn is_dynamic_pie_executable(path: &Path) -> Result<bool> {
    let data = std::fs::read(path).map_err(|e| UnikitError::io(path, e))?;
    Ok(pie_probe(&data).unwrap_or(false))
}

fn pie_probe(data: &[u8]) -> Option<bool> {
    match *data.get(4)? {
        elf::ELFCLASS32 => pie_probe_class::<elf::FileHeader32<Endianness>>(data),
        elf::ELFCLASS64 => pie_probe_class::<elf::FileHeader64<Endianness>>(data),
        _ => None,
    }
}

fn pie_probe_class<Elf: FileHeader>(data: &[u8]) -> Option<bool> {
    let header = Elf::parse(data).ok()?;
    let endian = header.endian().ok()?;
    if header.e_type(endian) != elf::ET_DYN {
        return Some(false);
    }

    let mut has_phdr = false;
    for ph in header.program_headers(endian, data).ok()? {
        if ph.p_type(endian) == elf::PT_PHDR {
            has_phdr = true;
        }
        if let Ok(Some(dyns)) = ph.dynamic(endian, data) {
            for entry in dyns {
                let tag: u64 = entry.d_tag(endian).into();
                if tag == u64::from(elf::DT_FLAGS_1) {
                    let value: u64 = entry.d_val(endian).into();
                    return Some(value & u64::from(elf::DF_1_PIE) != 0 || has_phdr);
                }
            }
        }
    }
    Some(has_phdr)
}

fn elf_machine(data: &[u8]) -> Option<u16> {
    match *data.get(4)? {
        elf::ELFCLASS32 => {
            let header = elf::FileHeader32::<Endianness>::parse(data).ok()?;
            let endian = header.endian().ok()?;
            Some(header.e_machine(endian))
        }
        elf::ELFCLASS64 => {
            let header = elf::FileHeader64::<Endianness>::parse(data).ok()?;
            let endian = header.endian().ok()?;
            Some(header.e_machine(endian))
        }
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_field_maps_to_architecture() {
        let x86 = testelf::bare_header(elf::ET_EXEC, elf::EM_X86_64);
        assert_eq!(architecture_of(&x86), Some(Architecture::X86_64));
        let i386 = testelf::bare_header(elf::ET_EXEC, elf::EM_386);
        assert_eq!(architecture_of(&i386), Some(Architecture::X86_64));
        let arm = testelf::bare_header(elf::ET_EXEC, elf::EM_ARM);
        assert_eq!(architecture_of(&arm), Some(Architecture::Arm));
        let arm64 = testelf::bare_header(elf::ET_EXEC, elf::EM_AARCH64);
        assert_eq!(architecture_of(&arm64), Some(Architecture::Arm64));
        let riscv = testelf::bare_header(elf::ET_EXEC, elf::EM_RISCV);
        assert_eq!(architecture_of(&riscv), None);
    }

    #[test]
    fn unikraft_signature_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hello_qemu-x86_64");
        std::fs::write(&path, testelf::unikraft_kernel(elf::EM_X86_64)).expect("write");
        assert_eq!(
            detect_unikernel(&path).expect("probe"),
            Some(Architecture::X86_64)
        );
    }

    #[test]
    fn non_elf_is_not_a_unikernel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("script.sh");
        std::fs::write(&path, b"#!/bin/sh\necho hi\n").expect("write");
        assert_eq!(detect_unikernel(&path).expect("probe"), None);
    }

    #[test]
    fn et_exec_is_not_pie() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("static");
        std::fs::write(&path, testelf::bare_header(elf::ET_EXEC, elf::EM_X86_64))
            .expect("write");
        assert!(!is_dynamic_pie_executable(&path).expect("probe"));
    }

    #[test]
    fn et_dyn_with_phdr_is_pie_by_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pie");
        std::fs::write(
            &path,
            testelf::with_program_header(elf::ET_DYN, elf::EM_X86_64, elf::PT_PHDR),
        )
        .expect("write");
        assert!(is_dynamic_pie_executable(&path).expect("probe"));
    }

    #[test]
    fn et_dyn_without_markers_is_not_pie() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lib");
        std::fs::write(
            &path,
            testelf::with_program_header(elf::ET_DYN, elf::EM_X86_64, elf::PT_LOAD),
        )
        .expect("write");
        assert!(!is_dynamic_pie_executable(&path).expect("probe"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            detect_unikernel(Path::new("/nonexistent/kernel")),
            Err(UnikitError::Io { .. })
        ));
    }
}
