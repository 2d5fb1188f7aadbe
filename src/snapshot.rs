//! Process-state snapshot comparison.
//!
//! Snapshots are core files written by the debugger. Two snapshots are compared
//! section by section over their ELF64 `PROGBITS` sections in 16-byte windows;
//! files that are not ELF64 little-endian are compared as raw bytes instead.
use crate::util::sha256_hex;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const DIFF_WINDOW: usize = 16;
const SECTION_HEADER_SIZE: usize = 64;
const SHT_PROGBITS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section<'a> {
    addr: u64,
    data: &'a [u8],
}

/// `PROGBITS` sections of an ELF64 little-endian image, ordered by address.
///
/// Returns `None` when `image` is not such a file or its headers are truncated.
fn progbits_sections(image: &[u8]) -> Option<Vec<Section<'_>>> {
    if image.len() < 64 || &image[..4] != b"\x7fELF" || image[4] != 2 || image[5] != 1 {
        return None;
    }
    let shoff = usize::try_from(read_u64(image, 0x28)?).ok()?;
    let shentsize = usize::from(read_u16(image, 0x3a)?);
    let shnum = usize::from(read_u16(image, 0x3c)?);
    if shentsize < SECTION_HEADER_SIZE {
        return None;
    }
    let mut sections = Vec::new();
    for index in 0..shnum {
        let header = shoff.checked_add(index.checked_mul(shentsize)?)?;
        let sh_type = read_u32(image, header + 4)?;
        if sh_type != SHT_PROGBITS {
            continue;
        }
        let addr = read_u64(image, header + 16)?;
        let offset = usize::try_from(read_u64(image, header + 24)?).ok()?;
        let size = usize::try_from(read_u64(image, header + 32)?).ok()?;
        let data = image.get(offset..offset.checked_add(size)?)?;
        sections.push(Section { addr, data });
    }
    sections.sort_by_key(|section| section.addr);
    Some(sections)
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Textual diff of two snapshot images.
///
/// Each differing window contributes one line with its address and the
/// per-byte wrapping delta; sections present on one side only contribute their
/// first window prefixed with `-` or `+`. Identical images yield an empty diff.
pub fn diff_images(before: &[u8], after: &[u8]) -> String {
    match (progbits_sections(before), progbits_sections(after)) {
        (Some(old), Some(new)) => diff_sections(&old, &new),
        _ => {
            let mut out = String::new();
            if before.len() != after.len() {
                let _ = writeln!(out, "size {} {}", before.len(), after.len());
            }
            diff_windows(&mut out, 0, before, after);
            out
        }
    }
}

fn diff_sections(old: &[Section<'_>], new: &[Section<'_>]) -> String {
    let mut out = String::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        match (old.get(i), new.get(j)) {
            (Some(a), Some(b)) if a.addr == b.addr => {
                diff_windows(&mut out, a.addr, a.data, b.data);
                i += 1;
                j += 1;
            }
            (Some(a), Some(b)) if a.addr < b.addr => {
                one_sided(&mut out, '-', a);
                i += 1;
            }
            (Some(_), Some(b)) => {
                one_sided(&mut out, '+', b);
                j += 1;
            }
            (Some(a), None) => {
                one_sided(&mut out, '-', a);
                i += 1;
            }
            (None, Some(b)) => {
                one_sided(&mut out, '+', b);
                j += 1;
            }
            (None, None) => break,
        }
    }
    out
}

fn diff_windows(out: &mut String, base: u64, old: &[u8], new: &[u8]) {
    let len = old.len().min(new.len());
    for start in (0..len).step_by(DIFF_WINDOW) {
        let end = (start + DIFF_WINDOW).min(len);
        if old[start..end] == new[start..end] {
            continue;
        }
        let _ = write!(out, "{:016x}", base + start as u64);
        for (a, b) in old[start..end].iter().zip(&new[start..end]) {
            let _ = write!(out, " {:02x}", b.wrapping_sub(*a));
        }
        out.push('\n');
    }
}

fn one_sided(out: &mut String, mode: char, section: &Section<'_>) {
    let _ = write!(out, "{mode} {:016x}", section.addr);
    for byte in section.data.iter().take(DIFF_WINDOW) {
        let _ = write!(out, " {byte:02x}");
    }
    out.push('\n');
}

/// Signature of the state change between two snapshot files.
///
/// Returns `Ok(None)` when either snapshot is missing.
pub fn signature(before: &Path, after: &Path) -> Result<Option<String>> {
    if !before.is_file() || !after.is_file() {
        return Ok(None);
    }
    let old = fs::read(before).with_context(|| format!("read {}", before.display()))?;
    let new = fs::read(after).with_context(|| format!("read {}", after.display()))?;
    let diff = diff_images(&old, &new);
    Ok(Some(sha256_hex(diff.as_bytes())))
}

/// Whether two snapshot files hold the same state.
pub fn same_state(left: &Path, right: &Path) -> Result<bool> {
    if !left.is_file() || !right.is_file() {
        return Ok(false);
    }
    let a = fs::read(left).with_context(|| format!("read {}", left.display()))?;
    let b = fs::read(right).with_context(|| format!("read {}", right.display()))?;
    Ok(diff_images(&a, &b).is_empty())
}

/// Digest recorded in cache markers for an after-state snapshot.
pub fn file_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}
