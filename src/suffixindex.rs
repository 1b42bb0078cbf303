use std::cmp::{Ordering, min};

use tracing::debug;

use crate::common_prefix_len;
use crate::error::Error;

/// Inputs at or above this size get 24-bit initial keys instead of 16-bit.
const WIDE_KEY_THRESHOLD: usize = 0x0100_0000;

/// A suffix-array match index over the reference.
///
/// The reference is conceptually padded with one or two zero sentinel bytes
/// that sort below everything, then suffix-sorted with a doubling sort: a
/// counting presort on two- or three-byte keys, followed by log(n) rounds of
/// three-way-partition refinement on rank pairs. During the sort `i` holds
/// sign-tagged state (a negative entry `-l` marks a fully sorted run of
/// length `l`); after the final inversion it is the suffix array proper.
pub struct SuffixIndex {
    /// Rank -> suffix start, over the sentinel-padded reference.
    i: Vec<isize>,
    /// `f[b] + 1` is the first rank whose suffix begins with byte `b`,
    /// `f[b + 1]` the last.
    f: [usize; 257],
}

impl SuffixIndex {
    pub fn new(old: &[u8]) -> Result<Self, Error> {
        let ulen = old.len();
        if ulen == 0 {
            return Ok(Self {
                i: Vec::new(),
                f: [0; 257],
            });
        }
        let mut v = alloc_signed(ulen + 3)?;
        let mut i_arr = alloc_signed(ulen + 3)?;
        let mut f = [0usize; 257];

        let len;
        let buckets;
        let mut h;
        if ulen >= WIDE_KEY_THRESHOLD {
            buckets = 0x0100_0002;
            f[old[0] as usize] += 1;
            f[old[1] as usize] += 1;
            let mut key = (old[0] as isize) << 8 | old[1] as isize;
            for idx in 2..ulen {
                f[old[idx] as usize] += 1;
                key = (key & 0xffff) << 8 | old[idx] as isize;
                v[idx - 2] = key + 2;
            }
            key = (key & 0xffff) << 8;
            v[ulen - 2] = key + 2;
            key = (key & 0xffff) << 8;
            v[ulen - 1] = key + 2;
            len = ulen + 2;
            v[len - 2] = 1;
            v[len - 1] = 0;
            h = 3;
        } else {
            buckets = 0x0001_0001;
            f[old[0] as usize] += 1;
            let mut key = old[0] as isize;
            for idx in 1..ulen {
                f[old[idx] as usize] += 1;
                key = (key & 0xff) << 8 | old[idx] as isize;
                v[idx - 1] = key + 1;
            }
            key = (key & 0xff) << 8;
            v[ulen - 1] = key + 1;
            len = ulen + 1;
            v[len - 1] = 0;
            h = 2;
        }

        // turn the per-byte counts into cumulative bucket bounds, in place
        let mut acc = len;
        for c in (1..=256).rev() {
            let count = f[c - 1];
            f[c] = acc;
            acc -= count;
        }
        f[0] = acc;

        bucket_sort(&mut v, &mut i_arr, len, buckets)?;

        while i_arr[0] != -(len as isize + 1) {
            let mut run: isize = 0;
            let mut idx: isize = 0;
            while idx < len as isize + 1 {
                let e = i_arr[idx as usize];
                if e < 0 {
                    run -= e;
                    idx -= e;
                } else {
                    if run != 0 {
                        i_arr[(idx - run) as usize] = -run;
                    }
                    let glen = v[e as usize] + 1 - idx;
                    split(&mut i_arr, &mut v, idx as usize, glen as usize, h);
                    idx += glen;
                    run = 0;
                }
            }
            if run != 0 {
                i_arr[(idx - run) as usize] = -run;
            }
            h += h;
        }

        for idx in 0..=len {
            i_arr[v[idx] as usize] = idx as isize;
        }
        debug!(oldlen = ulen, "built suffix index");
        Ok(Self { i: i_arr, f })
    }

    /// Binary search for the longest prefix of `needle` among the suffixes
    /// in ranks `[st, en]`, returning `(len, pos)`.
    fn bsearch(&self, old: &[u8], needle: &[u8], mut st: usize, mut en: usize) -> (usize, usize) {
        if st > en {
            return (0, 0);
        }
        while en - st >= 2 {
            let x = st + (en - st) / 2;
            let sp = self.i[x] as usize;
            let n = min(old.len() - sp, needle.len());
            if old[sp..sp + n] < needle[..n] {
                st = x;
            } else {
                en = x;
            }
        }
        let sp = self.i[st] as usize;
        let ep = self.i[en] as usize;
        let x = common_prefix_len(&old[sp..], needle);
        let y = common_prefix_len(&old[ep..], needle);
        if x > y { (x, sp) } else { (y, ep) }
    }

    /// Scan forward from `scan` for the next usable match of `new` against
    /// the reference, returning `(scan, pos, len)`.
    pub fn find_next(
        &self,
        old: &[u8],
        new: &[u8],
        lastoffset: usize,
        mut scan: usize,
    ) -> (usize, usize, usize) {
        let oldlen = old.len();
        let newlen = new.len();
        let mut pos = 0usize;
        let mut len = 0usize;
        let mut scsc = scan;
        let mut oldscore = 0usize;

        while scan < newlen {
            let b = new[scan] as usize;
            let (l, p) = self.bsearch(old, &new[scan..], self.f[b] + 1, self.f[b + 1]);
            len = l;
            pos = p;

            while scsc < scan + len {
                let oi = scsc.wrapping_add(lastoffset);
                if oi < oldlen && old[oi] == new[scsc] {
                    oldscore += 1;
                }
                scsc += 1;
            }
            if len != 0 && len == oldscore {
                // the previous copy window already covers this match whole
                scan += len;
                scsc = scan;
                oldscore = 0;
                continue;
            }
            if len > oldscore.wrapping_add(32) {
                break;
            }
            let oi = scan.wrapping_add(lastoffset);
            if oi < oldlen && old[oi] == new[scan] {
                oldscore = oldscore.wrapping_sub(1);
            }
            scan += 1;
        }
        (scan, pos, len)
    }
}

/// Counting presort. `v` holds the initial keys on entry; on exit `v[p]` is
/// the highest rank in suffix `p`'s equivalence class and `i_arr` holds the
/// rank order with singletons tagged `-1`.
fn bucket_sort(v: &mut [isize], i_arr: &mut [isize], n: usize, buckets: usize) -> Result<(), Error> {
    let mut heads = alloc_signed(buckets)?;
    // thread each key's positions into a chain rooted at its bucket head
    for idx in (0..n).rev() {
        let c = v[idx] as usize;
        v[idx] = heads[c];
        heads[c] = idx as isize + 1;
    }
    let mut i = n;
    let mut j = buckets;
    while i != 0 {
        j -= 1;
        let mut d = heads[j];
        let g = i as isize;
        while d != 0 {
            let c = (d - 1) as usize;
            d = v[c];
            v[c] = g;
            i_arr[i] = if d == 0 && g == i as isize { -1 } else { c as isize };
            i -= 1;
        }
    }
    v[n] = 0;
    i_arr[0] = -1;
    Ok(())
}

struct SplitRange {
    start: usize,
    len: usize,
}

fn split(i_arr: &mut [isize], v: &mut [isize], start: usize, len: usize, h: usize) {
    let mut next = Some(SplitRange { start, len });
    while let Some(r) = next {
        next = split_step(i_arr, v, r.start, r.len, h);
    }
}

/// One refinement of the group `[start, start + len)` on the rank `h`
/// positions ahead. Returns the right-hand partition for the caller's loop
/// instead of recursing on it.
fn split_step(
    i_arr: &mut [isize],
    v: &mut [isize],
    start: usize,
    len: usize,
    h: usize,
) -> Option<SplitRange> {
    if len < 16 {
        // selection sort, pulling each minimal equivalence class to the front
        let mut k = start;
        while k < start + len {
            let mut j = 1usize;
            let mut x = v[(i_arr[k] + h as isize) as usize];
            let mut t = 1usize;
            while k + t < start + len {
                let val = v[(i_arr[k + t] + h as isize) as usize];
                if val < x {
                    x = val;
                    j = 0;
                }
                if val == x {
                    i_arr.swap(k + j, k + t);
                    j += 1;
                }
                t += 1;
            }
            for idx in k..k + j {
                v[i_arr[idx] as usize] = (k + j) as isize - 1;
            }
            if j == 1 {
                i_arr[k] = -1;
            }
            k += j;
        }
        return None;
    }

    let x = v[(i_arr[start + len / 2] + h as isize) as usize];
    let mut jj = 0usize;
    let mut kk = 0usize;
    for idx in start..start + len {
        let val = v[(i_arr[idx] + h as isize) as usize];
        if val < x {
            jj += 1;
        }
        if val == x {
            kk += 1;
        }
    }
    let jj = jj + start;
    let kk = kk + jj;

    let mut i = start;
    let mut j = 0usize;
    let mut k = 0usize;
    while i < jj {
        match v[(i_arr[i] + h as isize) as usize].cmp(&x) {
            Ordering::Less => i += 1,
            Ordering::Equal => {
                i_arr.swap(i, jj + j);
                j += 1;
            }
            Ordering::Greater => {
                i_arr.swap(i, kk + k);
                k += 1;
            }
        }
    }
    while jj + j < kk {
        if v[(i_arr[jj + j] + h as isize) as usize] == x {
            j += 1;
        } else {
            i_arr.swap(jj + j, kk + k);
            k += 1;
        }
    }

    if jj > start {
        split(i_arr, v, start, jj - start, h);
    }

    for idx in jj..kk {
        v[i_arr[idx] as usize] = kk as isize - 1;
    }
    if jj == kk - 1 {
        i_arr[jj] = -1;
    }

    if start + len > kk {
        Some(SplitRange {
            start: kk,
            len: start + len - kk,
        })
    } else {
        None
    }
}

fn alloc_signed(n: usize) -> Result<Vec<isize>, Error> {
    let mut v = Vec::new();
    v.try_reserve_exact(n).map_err(|_| Error::OutOfMemory)?;
    v.resize(n, 0);
    Ok(v)
}
