use std::io::Read;

use crate::package::XlsxError;

/// Default maximum uncompressed size permitted for any single ZIP part inflated into memory.
///
/// Guards against ZIP bombs (tiny compressed size, huge uncompressed size) and forged ZIP
/// metadata (e.g. an incorrect `uncompressed_size` field).
pub(crate) const DEFAULT_MAX_ZIP_PART_BYTES: u64 = 256 * 1024 * 1024; // 256MiB

/// Default maximum total uncompressed bytes permitted across a whole package.
pub(crate) const DEFAULT_MAX_ZIP_TOTAL_BYTES: u64 = 512 * 1024 * 1024; // 512MiB

/// Compare two part names the way producers actually spell them: case-insensitive, `\` treated
/// as `/`, leading separators ignored.
pub(crate) fn zip_part_names_equivalent(a: &str, b: &str) -> bool {
    fn normalized(s: &str) -> impl Iterator<Item = u8> + '_ {
        s.trim_start_matches(['/', '\\'])
            .bytes()
            .map(|b| if b == b'\\' { b'/' } else { b.to_ascii_lowercase() })
    }

    normalized(a).eq(normalized(b))
}

#[derive(Debug, Clone)]
pub(crate) struct ZipInflateBudget {
    max_total_bytes: u64,
    used_bytes: u64,
}

impl ZipInflateBudget {
    pub(crate) fn new(max_total_bytes: u64) -> Self {
        Self {
            max_total_bytes,
            used_bytes: 0,
        }
    }

    fn remaining_bytes(&self) -> u64 {
        self.max_total_bytes.saturating_sub(self.used_bytes)
    }

    fn consume(&mut self, bytes: u64) -> Result<(), XlsxError> {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
        if self.used_bytes > self.max_total_bytes {
            return Err(XlsxError::PackageTooLarge {
                total: self.used_bytes,
                max: self.max_total_bytes,
            });
        }
        Ok(())
    }
}

/// Read a ZIP entry into memory while enforcing a per-part limit and a shared total budget.
///
/// This does **not** trust ZIP metadata alone. It:
/// - checks the declared uncompressed size as a fast-path;
/// - reads via `Read::take(max + 1)` to guard against forged metadata;
/// - and errors deterministically if more than the limit is observed.
pub(crate) fn read_entry_with_budget<R: Read>(
    entry: R,
    declared_size: u64,
    part: &str,
    max_part_bytes: u64,
    budget: &mut ZipInflateBudget,
) -> Result<Vec<u8>, XlsxError> {
    if declared_size > max_part_bytes {
        return Err(XlsxError::PartTooLarge {
            part: part.to_string(),
            size: declared_size,
            max: max_part_bytes,
        });
    }

    let remaining_total = budget.remaining_bytes();
    if declared_size > remaining_total {
        return Err(XlsxError::PackageTooLarge {
            total: budget.used_bytes.saturating_add(declared_size),
            max: budget.max_total_bytes,
        });
    }

    let effective_max = max_part_bytes.min(remaining_total);
    let mut buf = Vec::new();
    entry
        .take(effective_max.saturating_add(1))
        .read_to_end(&mut buf)?;

    let observed = buf.len() as u64;
    if observed > max_part_bytes {
        return Err(XlsxError::PartTooLarge {
            part: part.to_string(),
            size: observed,
            max: max_part_bytes,
        });
    }
    budget.consume(observed)?;

    Ok(buf)
}
