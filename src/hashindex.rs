use tracing::debug;

use crate::common_prefix_len;
use crate::error::Error;

/// Width of the content blocks the hash index is built over. Part of the
/// delta format: changing it changes which matches are found.
pub const BLOCK_SIZE: usize = 16;

/// Buzhash seed. Chosen so that `UNROLL` below is its single-bit rotation,
/// which is what makes the one-byte rolling update line up with a fresh
/// hash of the shifted window.
const SEED: u32 = 0x83d31df4;

/// XOR-ed into the outgoing byte's noise word when the window slides.
const UNROLL: u32 = SEED ^ 0x07a63be9;

/// 256 random numbers generated by a quantum source.
static NOISE: [u32; 256] = [
    0x9be502a4, 0xba7180ea, 0x324e474f, 0x0aab8451, 0x0ced3810,
    0x2158a968, 0x6bbd3771, 0x75a02529, 0x41f05c14, 0xc2264b87,
    0x1f67b359, 0xcd2d031d, 0x49dc0c04, 0xa04ae45c, 0x6ade28a7,
    0x2d0254ff, 0xdec60c7c, 0xdef5c084, 0x0f77ffc8, 0x112021f6,
    0x5f6d581e, 0xe35ea3df, 0x3216bfb4, 0xd5a3083d, 0x7e63e9cd,
    0xaa9208f6, 0xda3f3978, 0xfe0e2547, 0x09dfb020, 0xd97472c5,
    0xbbce2ede, 0x121aebd2, 0x0e9fdbeb, 0x7b6f5d9c, 0x84938e43,
    0x30694f2d, 0x86b7a7f8, 0xefaf5876, 0x263812e6, 0xb6e48ddf,
    0xce8ed980, 0x4df591e1, 0x75257b35, 0x2f88dcff, 0xa461fe44,
    0xca613b4d, 0xd9803f73, 0xea056205, 0xccca7a89, 0x0f2dbb07,
    0xc53e359e, 0xe80d0137, 0x2b2d2a5d, 0xcfc1391a, 0x2bb3b6c5,
    0xb66aea3c, 0x00ea419e, 0xce5ada84, 0xae1d6712, 0x12f576ba,
    0x117fcbc4, 0xa9d4c775, 0x25b3d616, 0xefda65a8, 0xaff3ef5b,
    0x00627e68, 0x668d1e99, 0x088d0eef, 0xf8fac24d, 0xe77457c7,
    0x68d3beb4, 0x921d2acb, 0x9410eac9, 0xd7f24399, 0xcbdec497,
    0x98c99ae1, 0x65802b2c, 0x81e1c3c4, 0xa130bb09, 0x17a87bad,
    0xa70367d6, 0x148658d4, 0x02f33377, 0x8620d8b6, 0xbdac25bd,
    0xb0a6de51, 0xd64c4571, 0xa4185ba0, 0xa342d70f, 0x3f1dc4c1,
    0x042dc3ce, 0x0de89f43, 0xa69b1867, 0x3c064e11, 0xad1e2c3e,
    0x9660e8cd, 0xd36b09ca, 0x4888f228, 0x61a9ac3c, 0xd9561118,
    0x3532797e, 0x71a35c22, 0xecc1376c, 0xab31e656, 0x88bd0d35,
    0x423b20dd, 0x38e4651c, 0x3c6397a4, 0x4a7b12d9, 0x08b1cf33,
    0xd0604137, 0xb035fdb8, 0x4916da23, 0xa9349493, 0xd83daa9b,
    0x145f7d95, 0x868531d6, 0xacb18f17, 0x9cd33b6f, 0x193e42b9,
    0x26dfdc42, 0x5069d8fa, 0x5bee24ee, 0x5475d4c6, 0x315b2c0c,
    0xf764ef45, 0x01b6f4eb, 0x60ba3225, 0x8a16777c, 0x4c05cd28,
    0x53e8c1d2, 0xc8a76ce5, 0x8045c1e6, 0x61328752, 0x2ebad322,
    0x3444f3e2, 0x91b8af11, 0xb0cee675, 0x55dbff5a, 0xf7061ee0,
    0x27d7d639, 0xa4aef8c9, 0x42ff0e4f, 0x62755468, 0x1c6ca3f3,
    0xe4f522d1, 0x2765fcb3, 0xe20c8a95, 0x3a69aea7, 0x56ab2c4f,
    0x8551e688, 0xe0bc14c2, 0x278676bf, 0x893b6102, 0xb4f0ab3b,
    0xb55ddda9, 0xa04c521f, 0xc980088e, 0x912aeac1, 0x08519bad,
    0x991302d3, 0x5b91a25b, 0x696d9854, 0x9ad8b4bf, 0x41cb7e21,
    0xa65d1e03, 0x85791d29, 0x89478aa7, 0x4581e337, 0x59bae0b1,
    0xe0fc9df3, 0x45d9002c, 0x7837464f, 0xda22de3a, 0x1dc544bd,
    0x601d8bad, 0x668b0abc, 0x7a5ebfb1, 0x3ac0b624, 0x5ee16d7d,
    0x9bfac387, 0xbe8ef20c, 0x8d2ae384, 0x819dc7d5, 0x7c4951e7,
    0xe60da716, 0x0c5b0073, 0xb43b3d97, 0xce9974ed, 0x0f691da9,
    0x4b616d60, 0x8fa9e819, 0x3f390333, 0x6f62fad6, 0x5a32b67c,
    0x3be6f1c3, 0x05851103, 0xff28828d, 0xaa43a56a, 0x075d7dd5,
    0x248c4b7e, 0x52fde3eb, 0xf72e2eda, 0x5da6f75f, 0x2f5148d9,
    0xcae2aeae, 0xfda6f3e5, 0xff60d8ff, 0x2adc02d2, 0x1dbdbd4c,
    0xd410ad7c, 0x8c284aae, 0x392ef8e0, 0x37d48b3a, 0x6792fe9d,
    0xad32ddfa, 0x1545f24e, 0x3a260f73, 0xb724ca36, 0xc510d751,
    0x4f8df992, 0x000b8b37, 0x292e9b3d, 0xa32f250f, 0x8263d144,
    0xfcae0516, 0x1eae2183, 0xd4af2027, 0xc64afae3, 0xe7b34fe4,
    0xdf864aea, 0x80cc71c5, 0x0e814df3, 0x66cc5f41, 0x853a497a,
    0xa2886213, 0x5e34a2ea, 0x0f53ba47, 0x718c484a, 0xfa0f0b12,
    0x33cc59ff, 0x72b48e07, 0x8b6f57bc, 0x29cf886d, 0x1950955b,
    0xcd52910c, 0x4cecef65, 0x05c2cbfe, 0x49df4f6a, 0x1f4c3f34,
    0xfadc1a09, 0xf2d65a24, 0x117f5594, 0xde3a84e6, 0x48db3024,
    0xd10ca9b5,
];

/// Table sizes tried in order; the last entry is a sentinel, not a prime.
static PRIMES: [u32; 27] = [
    65537, 98317, 147481, 221227, 331841, 497771, 746659, 1120001,
    1680013, 2520031, 3780053, 5670089, 8505137, 12757739, 19136609,
    28704913, 43057369, 64586087, 96879131, 145318741, 217978121,
    326967209, 490450837, 735676303, 1103514463, 1655271719,
    0xffffffff,
];

/// Buzhash (Uzgalis): cyclic rotate-XOR over one block.
fn buzhash(buf: &[u8]) -> u32 {
    let mut x = SEED;
    for &b in &buf[..BLOCK_SIZE] {
        x = x.rotate_left(1) ^ NOISE[b as usize];
    }
    x
}

/// A content-hash match index over the reference.
///
/// Every block-aligned 16-byte block of the reference hashes to a slot that
/// stores `offset + 1` (0 means empty). Collisions get exactly one linear
/// probe; beyond that the block is simply not indexed. This trades recall
/// for a small, one-pass build, and the search's re-hash three blocks ahead
/// recovers long matches whose leading block lost its slot.
pub struct HashIndex {
    hash: Vec<usize>,
    prime: u32,
}

impl HashIndex {
    pub fn new(old: &[u8]) -> Result<Self, Error> {
        let oldlen = old.len();
        // 16 GiB addressing limit for 16-byte blocks
        if oldlen as u64 >= (0xffff_ffff_u64 / 4) << 4 {
            return Err(Error::InputTooLarge(oldlen));
        }
        let num = oldlen.div_ceil(BLOCK_SIZE) as u32;
        let target = num.wrapping_mul(4);
        let prime = PRIMES[..PRIMES.len() - 1]
            .iter()
            .copied()
            .find(|&p| target < p)
            .unwrap_or(PRIMES[PRIMES.len() - 1]);

        // One slot past `prime` absorbs the stray probe described in
        // `find_next`; it is never written and so stays empty.
        let mut hash = alloc_slots(prime as usize + 1)?;
        let mut off = 0;
        while oldlen - off >= BLOCK_SIZE {
            let block = &old[off..off + BLOCK_SIZE];
            let mut s = (buzhash(block) % prime) as usize;
            if hash[s] != 0 {
                let next = if s == prime as usize - 1 { 0 } else { s + 1 };
                if hash[next] != 0 {
                    off += BLOCK_SIZE;
                    continue;
                }
                if &old[hash[s] - 1..hash[s] - 1 + BLOCK_SIZE] == block {
                    off += BLOCK_SIZE;
                    continue;
                }
                s = next;
            }
            hash[s] = off + 1;
            off += BLOCK_SIZE;
        }
        debug!(oldlen, prime, "built hash index");
        Ok(Self { hash, prime })
    }

    /// Scan forward from `scan` for the next usable match of `new` against
    /// the reference, returning `(scan, pos, len)`. `(newlen, 0, 0)` means
    /// the window ran off the end without committing to anything.
    pub fn find_next(
        &self,
        old: &[u8],
        new: &[u8],
        lastoffset: usize,
        mut scan: usize,
    ) -> (usize, usize, usize) {
        let hash = &self.hash;
        let prime = self.prime as usize;
        let oldlen = old.len();
        let newlen = new.len();

        let mut scanstart = scan;
        let mut oldscore = 0usize;
        let mut oldscorestart = 0usize;
        let mut oldscorenum = 0usize;
        let mut ssx = if scan + BLOCK_SIZE <= newlen {
            buzhash(&new[scan..])
        } else {
            0
        };
        let mut pos;
        let mut len;
        let (mut lscan, mut lpos, mut llen) = (0usize, 0usize, 0usize);

        loop {
            if scan + BLOCK_SIZE >= newlen {
                if llen < 32 {
                    return (newlen, 0, 0);
                }
                // fall through and commit the tracked match
            } else {
                let ss = ssx as usize % prime;
                let mut found = None;
                if hash[ss] != 0 {
                    let cand = hash[ss] - 1;
                    if old[cand..cand + BLOCK_SIZE] == new[scan..scan + BLOCK_SIZE] {
                        found = Some(cand);
                    } else {
                        let next = if ss == prime - 1 { 0 } else { ss + 1 };
                        if hash[next] != 0 {
                            let cand = hash[next] - 1;
                            if old[cand..cand + BLOCK_SIZE] == new[scan..scan + BLOCK_SIZE] {
                                found = Some(cand);
                            }
                        }
                    }
                }
                if let Some(p) = found {
                    pos = p;
                    len = common_prefix_len(&old[pos + BLOCK_SIZE..], &new[scan + BLOCK_SIZE..])
                        + BLOCK_SIZE;
                    // Re-hash the block three blocks ahead directly. A slot
                    // collision on the current block can hide a longer match
                    // whose interior blocks are still indexed.
                    if scan + BLOCK_SIZE * 4 <= newlen {
                        let mut ss2 = (buzhash(&new[scan + BLOCK_SIZE * 3..]) % self.prime) as usize;
                        let mut p2 = hash[ss2];
                        if p2 != 0
                            && new[scan + BLOCK_SIZE * 3..scan + BLOCK_SIZE * 4]
                                != old[p2 - 1..p2 - 1 + BLOCK_SIZE]
                        {
                            // The wrap test here is `== prime`, not `prime - 1`:
                            // a historical off-by-one kept for delta
                            // compatibility. The probe can land on the extra
                            // permanently-empty slot at the end of the table.
                            ss2 = if ss2 == prime { 0 } else { ss2 + 1 };
                            p2 = hash[ss2];
                        }
                        if p2 > 1 + BLOCK_SIZE * 3 {
                            let pos2 = p2 - 1 - BLOCK_SIZE * 3;
                            if pos2 != pos {
                                let len2 = common_prefix_len(&old[pos2..], &new[scan..]);
                                if len2 > len {
                                    pos = pos2;
                                    len = len2;
                                }
                            }
                        }
                    }
                    if len > llen {
                        llen = len;
                        lpos = pos;
                        lscan = scan;
                    }
                }
                if llen < 32 || scan - lscan < BLOCK_SIZE {
                    // slide the window one byte
                    ssx = ssx.rotate_left(1) ^ NOISE[new[scan + BLOCK_SIZE] as usize];
                    let outc = NOISE[new[scan] as usize] ^ UNROLL;
                    ssx ^= outc.rotate_left((BLOCK_SIZE % 32) as u32);
                    scan += 1;
                    continue;
                }
            }

            // commit the tracked best match
            scan = lscan;
            len = llen;
            pos = lpos;
            if scan.wrapping_add(lastoffset) == pos {
                // pure continuation of the previous copy window; skip it whole
                scan += len;
                scanstart = scan;
                if scan + BLOCK_SIZE < newlen {
                    ssx = buzhash(&new[scan..]);
                }
                llen = 0;
                continue;
            }

            // extend left through equal bytes, bounded by the last restart point
            let mut room = scan - scanstart;
            while room > 0 && pos > 0 && scan > 0 && old[pos - 1] == new[scan - 1] {
                len += 1;
                pos -= 1;
                scan -= 1;
                room -= 1;
            }

            if oldscorestart + 1 != scan || oldscorenum == 0 || oldscorenum - 1 > len {
                oldscore = 0;
                for scsc in scan..scan + len {
                    let oi = scsc.wrapping_add(lastoffset);
                    if oi < oldlen && old[oi] == new[scsc] {
                        oldscore += 1;
                    }
                }
                oldscorestart = scan;
                oldscorenum = len;
            } else {
                let oi = oldscorestart.wrapping_add(lastoffset);
                if oi < oldlen && old[oi] == new[oldscorestart] {
                    oldscore = oldscore.wrapping_sub(1);
                }
                oldscorestart += 1;
                oldscorenum -= 1;
                let mut scsc = oldscorestart + oldscorenum;
                while oldscorenum < len {
                    let oi = scsc.wrapping_add(lastoffset);
                    if oi < oldlen && old[oi] == new[scsc] {
                        oldscore = oldscore.wrapping_add(1);
                    }
                    oldscorenum += 1;
                    scsc += 1;
                }
            }
            if len.wrapping_sub(oldscore) >= 32 {
                return (scan, pos, len);
            }

            // not enough of the match is new; fast-forward past the bulk of it
            if len > BLOCK_SIZE * 3 + 32 {
                scan += len - (BLOCK_SIZE * 3 + 32);
            }
            if scan <= lscan {
                scan = lscan + 1;
            }
            scanstart = scan;
            if scan + BLOCK_SIZE < newlen {
                ssx = buzhash(&new[scan..]);
            }
            llen = 0;
        }
    }
}

fn alloc_slots(n: usize) -> Result<Vec<usize>, Error> {
    let mut v = Vec::new();
    v.try_reserve_exact(n).map_err(|_| Error::OutOfMemory)?;
    v.resize(n, 0);
    Ok(v)
}
