use std::io;

use thiserror::Error;

use crate::enc::decode_off;

/// Errors raised while applying a delta payload.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("I/O error decoding a payload block")]
    Io(#[from] io::Error),
    #[error("truncated {0} stream")]
    Truncated(&'static str),
    #[error("instruction exceeds input bounds")]
    Corrupt,
}

/// Rebuild the target from the reference and the three compressed payload
/// blocks produced by [`make_diff`](crate::make_diff).
pub fn apply(
    old: &[u8],
    instr_block: &[u8],
    add_block: &[u8],
    extra_block: &[u8],
) -> Result<Vec<u8>, ApplyError> {
    let instr = decode_block(instr_block)?;
    let add = decode_block(add_block)?;
    let extra = decode_block(extra_block)?;
    apply_raw(old, &instr, &add, &extra)
}

fn decode_block(block: &[u8]) -> Result<Vec<u8>, ApplyError> {
    if block.is_empty() {
        return Ok(Vec::new());
    }
    Ok(zstd::stream::decode_all(block)?)
}

/// Walk the 24-byte instruction records over the uncompressed streams.
fn apply_raw(old: &[u8], instr: &[u8], add: &[u8], extra: &[u8]) -> Result<Vec<u8>, ApplyError> {
    if instr.len() % 24 != 0 {
        return Err(ApplyError::Truncated("instruction"));
    }
    let mut out = Vec::new();
    let mut oldpos: i64 = 0;
    let mut addpos = 0usize;
    let mut extrapos = 0usize;

    for rec in instr.chunks_exact(24) {
        let copyout = decode_off(rec[0..8].try_into().expect("8-byte field"));
        let copyin = decode_off(rec[8..16].try_into().expect("8-byte field"));
        let seek = decode_off(rec[16..24].try_into().expect("8-byte field"));
        if copyout < 0 || copyin < 0 {
            return Err(ApplyError::Corrupt);
        }
        let copyout = usize::try_from(copyout).map_err(|_| ApplyError::Corrupt)?;
        let copyin = usize::try_from(copyin).map_err(|_| ApplyError::Corrupt)?;

        let base = usize::try_from(oldpos).map_err(|_| ApplyError::Corrupt)?;
        let old_end = base.checked_add(copyout).ok_or(ApplyError::Corrupt)?;
        if old_end > old.len() {
            return Err(ApplyError::Corrupt);
        }
        if addpos + copyout > add.len() {
            return Err(ApplyError::Truncated("add"));
        }
        for i in 0..copyout {
            out.push(old[base + i].wrapping_add(add[addpos + i]));
        }
        addpos += copyout;

        if extrapos + copyin > extra.len() {
            return Err(ApplyError::Truncated("extra"));
        }
        out.extend_from_slice(&extra[extrapos..extrapos + copyin]);
        extrapos += copyin;

        oldpos = oldpos
            .checked_add(copyout as i64)
            .and_then(|p| p.checked_add(seek))
            .ok_or(ApplyError::Corrupt)?;
    }
    Ok(out)
}
