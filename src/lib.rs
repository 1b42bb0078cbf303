use std::cmp::min;

use tracing::debug;

pub mod enc;
mod error;
pub mod hashindex;
pub mod patch;
pub mod suffixindex;

pub use error::Error;
pub use hashindex::{BLOCK_SIZE, HashIndex};
pub use suffixindex::SuffixIndex;

use enc::BlockSink;

/// Offset type used throughout the API. The platform word is the
/// compile-time 32/64-bit offset-width choice.
pub type Off = usize;

/// One delta instruction.
///
/// Reconstruction appends `copyout` bytes of `old[copyoutoff..]` summed
/// modulo 256 with the add stream, then `copyin` literal bytes from the
/// extra stream. `copyinoff` is where the instruction's output starts in
/// `new`; consecutive instructions tile `new` without gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub copyout: Off,
    pub copyin: Off,
    pub copyoutoff: Off,
    pub copyinoff: Off,
}

/// Index selection, as an integer mode word with an OR-able flag bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(u32);

impl Mode {
    /// Exact suffix-array index. Best deltas, ~16 bytes of index per
    /// reference byte.
    pub const SUFFIX: Mode = Mode(0);

    /// Approximate content-hash index. Slightly larger deltas, a fraction
    /// of the memory.
    pub const HASH: Mode = Mode(1);

    /// Flag bit: never emit diff-copy regions, so no add stream is needed
    /// and every instruction is a verbatim literal run.
    pub const NOADDBLK: u32 = 0x100;

    /// Validate a raw mode word.
    pub fn from_bits(bits: u32) -> Result<Mode, Error> {
        match bits & !Mode::NOADDBLK {
            0 | 1 => Ok(Mode(bits)),
            _ => Err(Error::Unsupported(bits)),
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn no_add_block(self) -> Mode {
        Mode(self.0 | Mode::NOADDBLK)
    }

    fn split(self) -> (IndexKind, bool) {
        let kind = if self.0 & !Mode::NOADDBLK == Mode::HASH.0 {
            IndexKind::Hash
        } else {
            IndexKind::Suffix
        };
        (kind, self.0 & Mode::NOADDBLK != 0)
    }
}

#[derive(Debug, Clone, Copy)]
enum IndexKind {
    Suffix,
    Hash,
}

/// Which outputs `make_diff` should produce. Unrequested outputs cost
/// nothing: their sinks are never opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Parts {
    pub instructions: bool,
    pub instr_block: bool,
    pub add_block: bool,
    pub extra_block: bool,
}

impl Parts {
    pub const fn all() -> Self {
        Self {
            instructions: true,
            instr_block: true,
            add_block: true,
            extra_block: true,
        }
    }

    pub const fn instructions_only() -> Self {
        Self {
            instructions: true,
            instr_block: false,
            add_block: false,
            extra_block: false,
        }
    }

    pub const fn blocks_only() -> Self {
        Self {
            instructions: false,
            instr_block: true,
            add_block: true,
            extra_block: true,
        }
    }
}

/// The outputs of a one-shot diff. Fields are `Some` exactly for the
/// requested parts, except that `add_block` stays `None` under
/// [`Mode::NOADDBLK`].
#[derive(Debug, Default)]
pub struct Delta {
    pub instructions: Option<Vec<Instr>>,
    pub instr_block: Option<Vec<u8>>,
    pub add_block: Option<Vec<u8>>,
    pub extra_block: Option<Vec<u8>>,
}

enum MatchIndex {
    Suffix(SuffixIndex),
    Hash(HashIndex),
}

impl MatchIndex {
    fn build(kind: IndexKind, old: &[u8]) -> Result<Self, Error> {
        match kind {
            IndexKind::Suffix => Ok(MatchIndex::Suffix(SuffixIndex::new(old)?)),
            IndexKind::Hash => Ok(MatchIndex::Hash(HashIndex::new(old)?)),
        }
    }

    fn find_next(
        &self,
        old: &[u8],
        new: &[u8],
        lastoffset: usize,
        scan: usize,
    ) -> (usize, usize, usize) {
        match self {
            MatchIndex::Suffix(ix) => ix.find_next(old, new, lastoffset, scan),
            MatchIndex::Hash(ix) => ix.find_next(old, new, lastoffset, scan),
        }
    }
}

/// Count matching leading bytes of two slices, eight at a time.
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let n = min(a.len(), b.len());
    let mut i = 0;
    while i + 8 <= n {
        let ax = u64::from_le_bytes(a[i..i + 8].try_into().expect("8-byte chunk"));
        let bx = u64::from_le_bytes(b[i..i + 8].try_into().expect("8-byte chunk"));
        let x = ax ^ bx;
        if x != 0 {
            return i + (x.trailing_zeros() / 8) as usize;
        }
        i += 8;
    }
    while i < n {
        if a[i] != b[i] {
            return i;
        }
        i += 1;
    }
    n
}

/// What one shaping step decided: the accepted match and how far the
/// previous copy window was extended toward it.
struct Shaped {
    scan: usize,
    pos: usize,
    len: usize,
    lenf: usize,
    lenb: usize,
}

fn shape_next(
    index: &MatchIndex,
    old: &[u8],
    new: &[u8],
    noaddblk: bool,
    scan: usize,
    lastscan: usize,
    lastpos: usize,
) -> Shaped {
    let oldlen = old.len();
    let newlen = new.len();

    // with diff-copies disabled, an out-of-range offset keeps the
    // continuation score at zero so the index reports plain matches
    let lastoffset = if noaddblk {
        oldlen
    } else {
        lastpos.wrapping_sub(lastscan)
    };
    let (scan, pos, len) = index.find_next(old, new, lastoffset, scan);

    if noaddblk {
        // literal-only output: the whole region up to the match is extra
        return Shaped {
            scan,
            pos,
            len,
            lenf: 0,
            lenb: 0,
        };
    }

    // extend the previous copy window forward while the matching density
    // stays ahead of the mismatches
    let mut lenf = 0usize;
    {
        let (mut s, mut sf) = (0usize, 0usize);
        let mut i = 0usize;
        while lastscan + i < scan && lastpos + i < oldlen {
            if old[lastpos + i] == new[lastscan + i] {
                s += 1;
                i += 1;
                if s >= sf + (i - s) {
                    sf = 2 * s - i;
                    lenf = i;
                }
            } else {
                i += 1;
            }
        }
    }

    // symmetric backward extension of the current match
    let mut lenb = 0usize;
    if scan < newlen {
        let (mut s, mut sb) = (0usize, 0usize);
        let mut i = 1usize;
        while scan >= lastscan + i && pos >= i {
            if old[pos - i] == new[scan - i] {
                s += 1;
                if s >= sb + (i - s) {
                    sb = 2 * s - i;
                    lenb = i;
                }
            }
            i += 1;
        }
    }

    // the two extensions may claim the same bytes; give each overlap byte
    // to whichever side matches better
    if lastscan + lenf > scan - lenb {
        let overlap = (lastscan + lenf) - (scan - lenb);
        let (mut s, mut sb, mut ss, mut lens) = (0usize, 0usize, 0usize, 0usize);
        for i in 0..overlap {
            if new[lastscan + lenf - overlap + i] == old[lastpos + lenf - overlap + i] {
                s += 1;
            }
            if new[scan - lenb + i] == old[pos - lenb + i] {
                sb += 1;
            }
            if s > sb && s - sb > ss {
                ss = s - sb;
                lens = i + 1;
            }
        }
        lenf -= overlap - lens;
        lenb -= lens;
    }

    Shaped {
        scan,
        pos,
        len,
        lenf,
        lenb,
    }
}

/// Produce a delta turning `old` into `new` in one call.
///
/// Builds the index selected by `mode`, runs the shaping loop over `new`,
/// and returns the requested [`Parts`]. The index is dropped before
/// returning; use [`Stepper`] to amortize it over several calls.
pub fn make_diff(mode: Mode, old: &[u8], new: &[u8], parts: Parts) -> Result<Delta, Error> {
    let (kind, noaddblk) = mode.split();
    let index = MatchIndex::build(kind, old)?;

    let mut instructions = if parts.instructions {
        Some(Vec::new())
    } else {
        None
    };
    let mut instr_sink = if parts.instr_block {
        Some(BlockSink::new(enc::DEFAULT_LEVEL)?)
    } else {
        None
    };
    let mut add_sink = if parts.add_block && !noaddblk {
        Some(BlockSink::new(enc::DEFAULT_LEVEL)?)
    } else {
        None
    };
    let mut extra_sink = if parts.extra_block {
        Some(BlockSink::new(enc::DEFAULT_LEVEL)?)
    } else {
        None
    };

    let newlen = new.len();
    let mut scan = 0usize;
    let mut lastscan = 0usize;
    let mut lastpos = 0usize;

    while lastscan < newlen {
        let m = shape_next(&index, old, new, noaddblk, scan, lastscan, lastpos);
        let copyin = (m.scan - m.lenb) - (lastscan + m.lenf);

        if let Some(list) = instructions.as_mut() {
            list.push(Instr {
                copyout: m.lenf,
                copyin,
                copyoutoff: lastpos,
                copyinoff: lastscan,
            });
        }
        if let Some(sink) = instr_sink.as_mut() {
            enc::put_off(sink, m.lenf as i64)?;
            enc::put_off(sink, copyin as i64)?;
            enc::put_off(sink, (m.pos - m.lenb) as i64 - (lastpos + m.lenf) as i64)?;
        }
        if let Some(sink) = extra_sink.as_mut() {
            let mut at = lastscan + m.lenf;
            let mut left = copyin;
            while left > 0 {
                let step = left.min(enc::EXTRA_CHUNK);
                sink.write(&new[at..at + step])?;
                at += step;
                left -= step;
            }
        }
        if let Some(sink) = add_sink.as_mut() {
            let mut buf = [0u8; enc::ADD_CHUNK];
            let mut done = 0usize;
            while done < m.lenf {
                let step = (m.lenf - done).min(enc::ADD_CHUNK);
                for i in 0..step {
                    buf[i] = new[lastscan + done + i].wrapping_sub(old[lastpos + done + i]);
                }
                sink.write(&buf[..step])?;
                done += step;
            }
        }

        lastscan = m.scan - m.lenb;
        lastpos = m.pos - m.lenb;
        scan = m.scan + m.len;
    }
    debug!(
        oldlen = old.len(),
        newlen,
        instructions = instructions.as_ref().map(Vec::len),
        "diff complete"
    );

    Ok(Delta {
        instructions,
        instr_block: instr_sink.map(BlockSink::finish).transpose()?,
        add_block: add_sink.map(BlockSink::finish).transpose()?,
        extra_block: extra_sink.map(BlockSink::finish).transpose()?,
    })
}

/// Cursor state owned by the caller of [`Stepper::step`]. Start at zero;
/// the stream is complete once `lastscan` reaches `new.len()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepState {
    pub scan: Off,
    pub lastscan: Off,
    pub lastpos: Off,
}

/// Stepwise diff driver: one instruction per [`step`](Stepper::step) call,
/// with the caller owning the loop, the cursor, and the sinks.
pub struct Stepper {
    kind: IndexKind,
    noaddblk: bool,
    index: Option<MatchIndex>,
}

impl Stepper {
    pub fn new(mode: Mode) -> Self {
        let (kind, noaddblk) = mode.split();
        Self {
            kind,
            noaddblk,
            index: None,
        }
    }

    /// Emit the next instruction. The index over `old` is built on the
    /// first call; callers must keep passing the same buffers.
    pub fn step(&mut self, old: &[u8], new: &[u8], state: &mut StepState) -> Result<Instr, Error> {
        if self.index.is_none() {
            self.index = Some(MatchIndex::build(self.kind, old)?);
        }
        let index = self.index.as_ref().expect("index built above");

        let m = shape_next(
            index,
            old,
            new,
            self.noaddblk,
            state.scan,
            state.lastscan,
            state.lastpos,
        );
        let instr = Instr {
            copyout: m.lenf,
            copyin: (m.scan - m.lenb) - (state.lastscan + m.lenf),
            copyoutoff: state.lastpos,
            copyinoff: state.lastscan,
        };

        state.scan = m.scan + m.len;
        state.lastscan = m.scan - m.lenb;
        state.lastpos = if m.scan == new.len() {
            // terminal step: keep the cursor at the end of its own copy run
            instr.copyoutoff + m.lenf
        } else {
            m.pos - m.lenb
        };
        Ok(instr)
    }

    /// Release the index while keeping the stepper reusable. The next
    /// `step` call rebuilds it.
    pub fn free_index(&mut self) {
        self.index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Check the instruction-list invariants and rebuild `new` from them.
    fn check_instructions(old: &[u8], new: &[u8], instrs: &[Instr]) {
        let mut out = Vec::new();
        for ins in instrs {
            assert_eq!(ins.copyinoff, out.len(), "instructions must tile new");
            assert!(ins.copyoutoff + ins.copyout <= old.len());
            assert!(ins.copyinoff + ins.copyout + ins.copyin <= new.len());
            for i in 0..ins.copyout {
                let delta = new[ins.copyinoff + i].wrapping_sub(old[ins.copyoutoff + i]);
                out.push(old[ins.copyoutoff + i].wrapping_add(delta));
            }
            out.extend_from_slice(
                &new[ins.copyinoff + ins.copyout..ins.copyinoff + ins.copyout + ins.copyin],
            );
        }
        assert_eq!(out, new, "instructions must reconstruct new");
    }

    /// Full diff with all parts, invariant check, and block round-trip.
    fn roundtrip(mode: Mode, old: &[u8], new: &[u8]) -> Vec<Instr> {
        let delta = make_diff(mode, old, new, Parts::all()).unwrap();
        let instrs = delta.instructions.clone().unwrap();
        check_instructions(old, new, &instrs);
        if mode.bits() & Mode::NOADDBLK != 0 {
            assert!(delta.add_block.is_none());
            for ins in &instrs {
                assert_eq!(ins.copyout, 0, "literal-only delta may not copy");
            }
        }
        let rebuilt = patch::apply(
            old,
            delta.instr_block.as_deref().unwrap(),
            delta.add_block.as_deref().unwrap_or(&[]),
            delta.extra_block.as_deref().unwrap(),
        )
        .unwrap();
        assert_eq!(rebuilt, new, "block streams must reconstruct new");
        instrs
    }

    fn xorshift_bytes(n: usize, mut seed: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            out.push(seed as u8);
        }
        out
    }

    /// Derive a plausibly-related `new` from `old` and a mutation script.
    fn mutate(old: &[u8], script: &[u8]) -> Vec<u8> {
        let mut new = old.to_vec();
        for op in script.chunks(2) {
            if op.len() != 2 {
                break;
            }
            let (what, arg) = (op[0], op[1]);
            if new.is_empty() {
                new.push(arg);
                continue;
            }
            if what < 128 {
                // duplicate a window from what we have so far
                let at = what as usize % new.len();
                let end = min(at + arg as usize, new.len());
                let window = new[at..end].to_vec();
                new.extend_from_slice(&window);
            } else if what < 192 {
                // insert a run
                for _ in 0..(what - 128) / 8 {
                    new.push(arg);
                }
            } else {
                // flip one byte in place
                let at = arg as usize % new.len();
                new[at] ^= what;
            }
        }
        new
    }

    #[test]
    fn empty_reference_yields_one_literal_instruction() {
        for mode in [Mode::SUFFIX, Mode::HASH] {
            let delta = make_diff(mode, b"", b"hello", Parts::all()).unwrap();
            assert_eq!(
                delta.instructions.unwrap(),
                vec![Instr {
                    copyout: 0,
                    copyin: 5,
                    copyoutoff: 0,
                    copyinoff: 0
                }]
            );
            let extra = zstd::stream::decode_all(&delta.extra_block.unwrap()[..]).unwrap();
            assert_eq!(extra, b"hello");
        }
    }

    #[test]
    fn identical_inputs_yield_one_copy_instruction() {
        for mode in [Mode::SUFFIX, Mode::HASH] {
            let delta = make_diff(mode, b"hello", b"hello", Parts::all()).unwrap();
            assert_eq!(
                delta.instructions.unwrap(),
                vec![Instr {
                    copyout: 5,
                    copyin: 0,
                    copyoutoff: 0,
                    copyinoff: 0
                }]
            );
            let add = zstd::stream::decode_all(&delta.add_block.unwrap()[..]).unwrap();
            assert_eq!(add, vec![0u8; 5]);
        }
    }

    #[test]
    fn insertion_in_the_middle_reconstructs() {
        let old = b"abcdefghijklmnop";
        let new = b"abcdXXXXefghijklmnop";
        for mode in [Mode::SUFFIX, Mode::HASH] {
            let instrs = roundtrip(mode, old, new);
            let total: usize = instrs.iter().map(|i| i.copyout + i.copyin).sum();
            assert_eq!(total, new.len());
        }
    }

    #[test]
    fn swapped_halves_reconstruct() {
        let mut old = b"abcdefghijklmnopqrstuvwxyz".to_vec();
        old.extend_from_slice(&[b'A'; 32]);
        let mut new = vec![b'A'; 32];
        new.extend_from_slice(b"abcdefghijklmnopqrstuvwxyz");
        for mode in [Mode::SUFFIX, Mode::HASH] {
            roundtrip(mode, &old, &new);
        }
    }

    #[test]
    fn sparse_edit_of_a_large_input_stays_one_copy() {
        let old = xorshift_bytes(65536, 0x1d51_7bad_c0de_5eed);
        let mut new = old.clone();
        for b in &mut new[1000..1100] {
            *b = !*b;
        }
        for mode in [Mode::SUFFIX, Mode::HASH] {
            let instrs = roundtrip(mode, &old, &new);
            let literal_instrs = instrs.iter().filter(|i| i.copyin != 0).count();
            assert!(
                literal_instrs <= 1,
                "{literal_instrs} literal instructions for a 100-byte edit"
            );
        }
    }

    #[test]
    fn literal_only_mode_covers_everything_with_extras() {
        let old = b"some shared content, slightly revised over time".repeat(4);
        let new = b"entirely new preamble; some shared content, slightly revised over time"
            .repeat(3);
        for mode in [Mode::SUFFIX.no_add_block(), Mode::HASH.no_add_block()] {
            roundtrip(mode, &old, &new);
        }
    }

    #[test]
    fn unknown_mode_words_are_rejected() {
        assert!(matches!(Mode::from_bits(7), Err(Error::Unsupported(7))));
        assert!(Mode::from_bits(Mode::NOADDBLK | 1).is_ok());
        assert_eq!(Mode::from_bits(1).unwrap(), Mode::HASH);
    }

    #[test]
    fn unrequested_parts_stay_empty() {
        let delta = make_diff(
            Mode::SUFFIX,
            b"abc",
            b"abcdef",
            Parts::instructions_only(),
        )
        .unwrap();
        assert!(delta.instructions.is_some());
        assert!(delta.instr_block.is_none());
        assert!(delta.add_block.is_none());
        assert!(delta.extra_block.is_none());
    }

    #[test]
    fn empty_target_yields_no_instructions() {
        for mode in [Mode::SUFFIX, Mode::HASH] {
            let delta = make_diff(mode, b"something", b"", Parts::all()).unwrap();
            assert_eq!(delta.instructions.unwrap(), vec![]);
            let extra = zstd::stream::decode_all(&delta.extra_block.unwrap()[..]).unwrap();
            assert!(extra.is_empty());
        }
    }

    #[test]
    fn stepper_matches_one_shot() {
        let old = xorshift_bytes(4096, 77);
        let mut new = old[512..3600].to_vec();
        new.extend_from_slice(b"fresh tail data not present in the reference");
        for mode in [Mode::SUFFIX, Mode::HASH] {
            let expected = make_diff(mode, &old, &new, Parts::instructions_only())
                .unwrap()
                .instructions
                .unwrap();
            let mut stepper = Stepper::new(mode);
            let mut state = StepState::default();
            let mut got = Vec::new();
            while state.lastscan < new.len() {
                got.push(stepper.step(&old, &new, &mut state).unwrap());
            }
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn stepper_index_survives_free() {
        let old = b"abcdefghabcdefghabcdefghabcdefghabcdefgh";
        let new = b"abcdefghabcdefghZZabcdefghabcdefghabcdefgh";
        let mut stepper = Stepper::new(Mode::SUFFIX);
        let mut state = StepState::default();
        let first = stepper.step(old, new, &mut state).unwrap();
        stepper.free_index();
        // a fresh index over the same reference continues the same stream
        let mut replay = Stepper::new(Mode::SUFFIX);
        let mut replay_state = StepState::default();
        assert_eq!(replay.step(old, new, &mut replay_state).unwrap(), first);
    }

    proptest! {
        #[test]
        fn self_diff_is_one_instruction(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            hash_mode: bool,
        ) {
            let mode = if hash_mode { Mode::HASH } else { Mode::SUFFIX };
            let delta = make_diff(mode, &data, &data, Parts::instructions_only()).unwrap();
            prop_assert_eq!(
                delta.instructions.unwrap(),
                vec![Instr {
                    copyout: data.len(),
                    copyin: 0,
                    copyoutoff: 0,
                    copyinoff: 0
                }]
            );
        }

        #[test]
        fn cycle_suffix(
            old in proptest::collection::vec(any::<u8>(), 1..300),
            script in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let new = mutate(&old, &script);
            roundtrip(Mode::SUFFIX, &old, &new);
        }

        #[test]
        fn cycle_hash(
            old in proptest::collection::vec(any::<u8>(), 1..300),
            script in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let new = mutate(&old, &script);
            roundtrip(Mode::HASH, &old, &new);
        }

        #[test]
        fn cycle_literal_only(
            old in proptest::collection::vec(any::<u8>(), 1..300),
            script in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let new = mutate(&old, &script);
            roundtrip(Mode::SUFFIX.no_add_block(), &old, &new);
        }
    }
}
