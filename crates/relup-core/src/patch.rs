//! Binary delta codec in the BSDIFF40 format.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//! 0       8     magic "BSDIFF40"
//! 8       8     compressed length of the control block
//! 16      8     compressed length of the diff block
//! 24      8     size of the reconstructed output
//! 32      ..    bzip2(control) ‖ bzip2(diff) ‖ bzip2(extra)
//! ```
//!
//! Integers are 8 bytes, little-endian magnitude with the sign in the
//! high bit of the last byte. The control block is a sequence of
//! `(copy, extra, seek)` triples: add `copy` diff bytes to the old data,
//! append `extra` literal bytes, then move the old cursor by `seek`.
//!
//! [`apply`] does not depend on [`diff`]; a client only ever needs the
//! former. The magic is written but not required on read.

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use crate::error::PatchError;

/// Patch file magic.
pub const MAGIC: &[u8; 8] = b"BSDIFF40";

const HEADER_LEN: usize = 32;
const CONTROL_ENTRY_LEN: usize = 24;

/// Compute a patch turning `old` into `new`.
pub fn diff(old: &[u8], new: &[u8]) -> Result<Vec<u8>, PatchError> {
    let suffixes = suffix_array(old);
    let delta = Delta::compute(old, new, &suffixes);

    let mut control = Vec::with_capacity(delta.control.len() * CONTROL_ENTRY_LEN);
    for (copy, extra, seek) in &delta.control {
        control.extend_from_slice(&encode_offset(*copy));
        control.extend_from_slice(&encode_offset(*extra));
        control.extend_from_slice(&encode_offset(*seek));
    }

    let control = compress(&control)?;
    let diff_block = compress(&delta.diff)?;
    let extra_block = compress(&delta.extra)?;

    let mut patch = Vec::with_capacity(HEADER_LEN + control.len() + diff_block.len() + extra_block.len());
    patch.extend_from_slice(MAGIC);
    patch.extend_from_slice(&encode_offset(control.len() as i64));
    patch.extend_from_slice(&encode_offset(diff_block.len() as i64));
    patch.extend_from_slice(&encode_offset(new.len() as i64));
    patch.extend_from_slice(&control);
    patch.extend_from_slice(&diff_block);
    patch.extend_from_slice(&extra_block);

    tracing::debug!(
        old = old.len(),
        new = new.len(),
        patch = patch.len(),
        triples = delta.control.len(),
        "computed binary diff"
    );
    Ok(patch)
}

/// [`diff`] two files on disk.
pub fn diff_files(old_path: &Path, new_path: &Path) -> Result<Vec<u8>, PatchError> {
    let old = std::fs::read(old_path)?;
    let new = std::fs::read(new_path)?;
    diff(&old, &new)
}

/// Reconstruct the target bytes from `base` and `patch`.
pub fn apply(base: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
    if patch.len() < HEADER_LEN {
        return Err(PatchError::Truncated("header"));
    }
    if &patch[..8] != MAGIC {
        tracing::debug!("patch has no BSDIFF40 magic, reading header anyway");
    }

    let control_len = header_length(&patch[8..16], "control length")?;
    let diff_len = header_length(&patch[16..24], "diff length")?;
    let new_size = header_length(&patch[24..32], "output size")?;

    let body = &patch[HEADER_LEN..];
    if body.len() < control_len.saturating_add(diff_len) {
        return Err(PatchError::Truncated("compressed blocks"));
    }
    let control = decompress(&body[..control_len])?;
    let diff_block = decompress(&body[control_len..control_len + diff_len])?;
    let extra_block = decompress(&body[control_len + diff_len..])?;

    if control.len() % CONTROL_ENTRY_LEN != 0 {
        return Err(PatchError::Corrupt(format!(
            "control block of {} bytes is not a whole number of triples",
            control.len()
        )));
    }

    // Every output byte comes from the diff or the extra block.
    if new_size > diff_block.len().saturating_add(extra_block.len()) {
        return Err(PatchError::Corrupt(format!(
            "output size {new_size} exceeds the {} bytes of diff and extra data",
            diff_block.len() + extra_block.len()
        )));
    }

    let mut output = vec![0u8; new_size];
    let mut diff_cursor = 0usize;
    let mut extra_cursor = 0usize;
    let mut new_pos = 0usize;
    let mut old_pos: i64 = 0;

    for triple in control.chunks_exact(CONTROL_ENTRY_LEN) {
        if new_pos >= new_size {
            break;
        }
        let copy = decode_offset(&triple[0..8]);
        let extra = decode_offset(&triple[8..16]);
        let seek = decode_offset(&triple[16..24]);
        if copy < 0 || extra < 0 {
            return Err(PatchError::Corrupt("negative copy or extra length".to_string()));
        }
        let (copy, extra) = (copy as usize, extra as usize);

        if copy > new_size - new_pos {
            return Err(PatchError::Corrupt("copy runs past the output".to_string()));
        }
        let diff_bytes = diff_block
            .get(diff_cursor..diff_cursor + copy)
            .ok_or(PatchError::Truncated("diff block"))?;
        for (i, delta) in diff_bytes.iter().enumerate() {
            let old_byte = old_pos
                .checked_add(i as i64)
                .and_then(|index| usize::try_from(index).ok())
                .and_then(|index| base.get(index).copied())
                .unwrap_or(0);
            output[new_pos + i] = delta.wrapping_add(old_byte);
        }
        diff_cursor += copy;
        new_pos += copy;
        old_pos = offset(old_pos, copy as i64)?;

        if extra > new_size - new_pos {
            return Err(PatchError::Corrupt("extra runs past the output".to_string()));
        }
        let extra_bytes = extra_block
            .get(extra_cursor..extra_cursor + extra)
            .ok_or(PatchError::Truncated("extra block"))?;
        output[new_pos..new_pos + extra].copy_from_slice(extra_bytes);
        extra_cursor += extra;
        new_pos += extra;
        old_pos = offset(old_pos, seek)?;
    }

    if new_pos != new_size {
        return Err(PatchError::Corrupt(format!(
            "control block produced {new_pos} of {new_size} bytes"
        )));
    }
    Ok(output)
}

/// Apply `patches` to `base` strictly in the given order.
///
/// The first failure aborts the chain; no intermediate result escapes.
pub fn apply_chain<'a, I>(base: &[u8], patches: I) -> Result<Vec<u8>, PatchError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut current = base.to_vec();
    for (step, patch) in patches.into_iter().enumerate() {
        current = apply(&current, patch).map_err(|e| {
            tracing::error!(step, error = %e, "patch chain aborted");
            e
        })?;
        tracing::debug!(step, size = current.len(), "applied patch");
    }
    Ok(current)
}

fn offset(position: i64, delta: i64) -> Result<i64, PatchError> {
    position
        .checked_add(delta)
        .ok_or_else(|| PatchError::Corrupt("old file position overflows".to_string()))
}

fn header_length(bytes: &[u8], field: &'static str) -> Result<usize, PatchError> {
    let value = decode_offset(bytes);
    usize::try_from(value).map_err(|_| PatchError::Corrupt(format!("negative {field}")))
}

/// Sign-magnitude little-endian 64-bit integer.
fn encode_offset(value: i64) -> [u8; 8] {
    let mut bytes = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        bytes[7] |= 0x80;
    }
    bytes
}

fn decode_offset(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    let negative = raw[7] & 0x80 != 0;
    raw[7] &= 0x7f;
    let magnitude = u64::from_le_bytes(raw) as i64;
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut out = Vec::new();
    BzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Sorted suffix start positions of `data`, including the empty suffix
/// (which sorts first). Prefix doubling over rank pairs.
fn suffix_array(data: &[u8]) -> Vec<usize> {
    let n = data.len();
    let mut suffixes: Vec<usize> = (0..=n).collect();
    // Rank 0 is reserved for the empty suffix and for reads past the end.
    let mut rank: Vec<usize> = data.iter().map(|&b| b as usize + 1).chain(Some(0)).collect();
    let mut next_rank = vec![0usize; n + 1];
    let mut step = 1;

    loop {
        let key = |i: usize| (rank[i], rank.get(i + step).copied().unwrap_or(0));
        suffixes.sort_unstable_by_key(|&i| key(i));

        next_rank[suffixes[0]] = 0;
        for w in 1..=n {
            let bump = usize::from(key(suffixes[w - 1]) < key(suffixes[w]));
            next_rank[suffixes[w]] = next_rank[suffixes[w - 1]] + bump;
        }
        rank.copy_from_slice(&next_rank);

        if rank[suffixes[n]] == n || step > n {
            break;
        }
        step *= 2;
    }
    suffixes
}

fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Longest match of `target` against suffixes of `old`: `(position, length)`.
fn search(suffixes: &[usize], old: &[u8], target: &[u8]) -> (usize, usize) {
    let mut start = 0;
    let mut end = suffixes.len() - 1;

    while end - start >= 2 {
        let mid = start + (end - start) / 2;
        let candidate = &old[suffixes[mid]..];
        let n = candidate.len().min(target.len());
        if candidate[..n].cmp(&target[..n]) == Ordering::Less {
            start = mid;
        } else {
            end = mid;
        }
    }

    let first = match_len(&old[suffixes[start]..], target);
    let second = match_len(&old[suffixes[end]..], target);
    if first > second {
        (suffixes[start], first)
    } else {
        (suffixes[end], second)
    }
}

/// The three uncompressed streams of a patch.
struct Delta {
    control: Vec<(i64, i64, i64)>,
    diff: Vec<u8>,
    extra: Vec<u8>,
}

impl Delta {
    fn compute(old: &[u8], new: &[u8], suffixes: &[usize]) -> Self {
        let old_size = old.len() as i64;
        let new_size = new.len() as i64;
        let old_at = |i: i64| old[i as usize];
        let new_at = |i: i64| new[i as usize];

        let mut delta = Delta {
            control: Vec::new(),
            diff: Vec::with_capacity(new.len()),
            extra: Vec::new(),
        };

        let mut scan: i64 = 0;
        let mut len: i64 = 0;
        let mut pos: i64 = 0;
        let mut last_scan: i64 = 0;
        let mut last_pos: i64 = 0;
        let mut last_offset: i64 = 0;

        while scan < new_size {
            let mut old_score: i64 = 0;
            scan += len;
            let mut scsc = scan;

            while scan < new_size {
                let (found_pos, found_len) = search(suffixes, old, &new[scan as usize..]);
                pos = found_pos as i64;
                len = found_len as i64;

                while scsc < scan + len {
                    let o = scsc + last_offset;
                    if o >= 0 && o < old_size && old_at(o) == new_at(scsc) {
                        old_score += 1;
                    }
                    scsc += 1;
                }

                if (len == old_score && len != 0) || len > old_score + 8 {
                    break;
                }

                let o = scan + last_offset;
                if o >= 0 && o < old_size && old_at(o) == new_at(scan) {
                    old_score -= 1;
                }
                scan += 1;
            }

            if len == old_score && scan != new_size {
                continue;
            }

            // Extend the previous match forwards.
            let mut score = 0;
            let mut best_forward = 0;
            let mut len_forward = 0;
            let mut i = 0;
            while last_scan + i < scan && last_pos + i < old_size {
                if old_at(last_pos + i) == new_at(last_scan + i) {
                    score += 1;
                }
                i += 1;
                if score * 2 - i > best_forward * 2 - len_forward {
                    best_forward = score;
                    len_forward = i;
                }
            }

            // Extend the new match backwards.
            let mut len_backward = 0;
            if scan < new_size {
                let mut score = 0;
                let mut best_backward = 0;
                let mut i = 1;
                while scan >= last_scan + i && pos >= i {
                    if old_at(pos - i) == new_at(scan - i) {
                        score += 1;
                    }
                    if score * 2 - i > best_backward * 2 - len_backward {
                        best_backward = score;
                        len_backward = i;
                    }
                    i += 1;
                }
            }

            // Split any overlap where it scores best.
            if last_scan + len_forward > scan - len_backward {
                let overlap = (last_scan + len_forward) - (scan - len_backward);
                let mut score = 0;
                let mut best = 0;
                let mut len_split = 0;
                for i in 0..overlap {
                    if new_at(last_scan + len_forward - overlap + i)
                        == old_at(last_pos + len_forward - overlap + i)
                    {
                        score += 1;
                    }
                    if new_at(scan - len_backward + i) == old_at(pos - len_backward + i) {
                        score -= 1;
                    }
                    if score > best {
                        best = score;
                        len_split = i + 1;
                    }
                }
                len_forward += len_split - overlap;
                len_backward -= len_split;
            }

            for i in 0..len_forward {
                delta
                    .diff
                    .push(new_at(last_scan + i).wrapping_sub(old_at(last_pos + i)));
            }
            let extra_len = (scan - len_backward) - (last_scan + len_forward);
            let extra_start = (last_scan + len_forward) as usize;
            delta
                .extra
                .extend_from_slice(&new[extra_start..extra_start + extra_len as usize]);

            delta.control.push((
                len_forward,
                extra_len,
                (pos - len_backward) - (last_pos + len_forward),
            ));

            last_scan = scan - len_backward;
            last_pos = pos - len_backward;
            last_offset = pos - scan;
        }

        delta
    }
}
