use crate::core::bits::{BitStream, GroupOrder};
use crate::core::error::{CabError, ErrorKind, Raise, Res};
use crate::core::huffman::{init_codebook, HuffTree};

const COPY_PREV: u16 = 16;
const ZERO_RUN_SHORT: u16 = 17;
const ZERO_RUN_LONG: u16 = 18;

const END_BLOCK: u16 = 256;
const MAX_MATCH_SYM: u16 = 285;
const MAX_DIST_SYM: u16 = 29;
const MAX_HIST: usize = 32 * 1024;

/// The fixed permutation code lengths arrive in for dynamic blocks.
const LEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// RFC1951 compliant inflater.
///
/// The history buffer rolls at 32 KiB and persists across blocks, so one
/// instance can decode a folder's worth of MSZIP blocks with back
/// references reaching into earlier output.
pub(crate) struct Inflate {
    fix_lits: HuffTree,
    fix_dists: HuffTree,
    hist: Vec<u8>,
}

impl Inflate {
    pub fn new() -> Res<Self> {
        // 3.2.6: the fixed literal/length code lengths are
        //   0-143: 8, 144-255: 9, 256-279: 7, 280-287: 8
        // and all 32 fixed distance codes are 5 bits wide.
        let mut symbits = vec![8u8; 144];
        symbits.resize(256, 9);
        symbits.resize(280, 7);
        symbits.resize(288, 8);

        let mut fix_lits = HuffTree::new();
        fix_lits.load(&init_codebook(&symbits))?;

        let mut fix_dists = HuffTree::new();
        fix_dists.load(&init_codebook(&[5u8; 32]))?;

        Ok(Self {
            fix_lits,
            fix_dists,
            hist: Vec::new(),
        })
    }

    /// Decode one block; returns its bytes and whether BFINAL was set.
    pub fn next_block<I: Iterator<Item = u8>>(
        &mut self,
        bits: &mut BitStream<I>,
    ) -> Res<(Vec<u8>, bool)> {
        let bfinal = bits.read_bit()? == 1;
        let btype = bits.read_bits(2, GroupOrder::LsbFirst)?;
        log::debug!("deflate block type {} final {}", btype, bfinal);

        let out = match btype {
            0 => self.stored_block(bits)?,
            1 => Self::huff_block(&mut self.hist, bits, &self.fix_lits, Some(&self.fix_dists))?,
            2 => {
                let (lit_tree, dist_tree) = Self::dynamic_trees(bits)?;
                Self::huff_block(&mut self.hist, bits, &lit_tree, dist_tree.as_ref())?
            }
            t => return self.raise(ErrorKind::InvalidBlockType(t as u8)),
        };

        Self::roll_hist(&mut self.hist);
        Ok((out, bfinal))
    }

    /// 3.2.4: a stored block is byte aligned and carries its length twice,
    /// the second time complemented.
    fn stored_block<I: Iterator<Item = u8>>(&mut self, bits: &mut BitStream<I>) -> Res<Vec<u8>> {
        bits.byte_align();
        let len = bits.read_bits(16, GroupOrder::LsbFirst)? as u16;
        let nlen = bits.read_bits(16, GroupOrder::LsbFirst)? as u16;
        if len != !nlen {
            return self.raise(ErrorKind::InvalidBlockLength);
        }

        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let b = bits.read_byte()?;
            out.push(b);
            self.hist.push(b);
        }
        Ok(out)
    }

    /// 3.2.7: read the code-length code, expand the run-length encoded
    /// literal/length and distance lengths, and build both trees.
    fn dynamic_trees<I: Iterator<Item = u8>>(
        bits: &mut BitStream<I>,
    ) -> Res<(HuffTree, Option<HuffTree>)> {
        let hlit = bits.read_bits(5, GroupOrder::LsbFirst)? as usize + 257;
        let hdist = bits.read_bits(5, GroupOrder::LsbFirst)? as usize + 1;
        let hclen = bits.read_bits(4, GroupOrder::LsbFirst)? as usize + 4;

        let mut lens = [0u8; 19];
        for i in 0..hclen {
            lens[LEN_ORDER[i]] = bits.read_bits(3, GroupOrder::LsbFirst)? as u8;
        }
        let mut len_tree = HuffTree::new();
        len_tree.load(&init_codebook(&lens))?;

        let mut code_lens = vec![0u8; hlit + hdist];
        let mut i = 0;
        let mut prev: Option<u8> = None;
        while i < code_lens.len() {
            let sym = len_tree.decode_next(bits)?;
            let (val, run) = match sym {
                0..=15 => {
                    prev = Some(sym as u8);
                    (sym as u8, 1)
                }
                COPY_PREV => {
                    let val = prev.ok_or_else(|| {
                        CabError::context(ErrorKind::InvalidCodebook, "repeat with no prior length")
                    })?;
                    (val, bits.read_bits(2, GroupOrder::LsbFirst)? as usize + 3)
                }
                ZERO_RUN_SHORT => {
                    prev = Some(0);
                    (0, bits.read_bits(3, GroupOrder::LsbFirst)? as usize + 3)
                }
                ZERO_RUN_LONG => {
                    prev = Some(0);
                    (0, bits.read_bits(7, GroupOrder::LsbFirst)? as usize + 11)
                }
                _ => return Err(CabError::new(ErrorKind::InvalidCodebook)),
            };
            if i + run > code_lens.len() {
                return Err(CabError::context(
                    ErrorKind::InvalidCodebook,
                    "length run overruns the table",
                ));
            }
            code_lens[i..i + run].fill(val);
            i += run;
        }

        let mut lit_tree = HuffTree::new();
        lit_tree.load(&init_codebook(&code_lens[..hlit]))?;

        // A block without matches may carry no distance code at all; the
        // RFC-legal single distance code of length one builds normally.
        let dist_lens = &code_lens[hlit..];
        let dist_tree = if dist_lens.iter().all(|&l| l == 0) {
            None
        } else {
            let mut tree = HuffTree::new();
            tree.load(&init_codebook(dist_lens))?;
            Some(tree)
        };

        Ok((lit_tree, dist_tree))
    }

    /// Decode literals and matches until the end-of-block symbol.
    fn huff_block<I: Iterator<Item = u8>>(
        hist: &mut Vec<u8>,
        bits: &mut BitStream<I>,
        lit_tree: &HuffTree,
        dist_tree: Option<&HuffTree>,
    ) -> Res<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let sym = lit_tree.decode_next(bits)?;
            if sym < END_BLOCK {
                out.push(sym as u8);
                hist.push(sym as u8);
            } else if sym == END_BLOCK {
                return Ok(out);
            } else {
                let mlen = Self::match_len(sym, bits)?;
                let dist_tree = dist_tree.ok_or_else(|| {
                    CabError::context(ErrorKind::InvalidCodebook, "match without a distance tree")
                })?;
                let dist = Self::match_dist(dist_tree.decode_next(bits)?, bits)?;
                if dist == 0 || dist > hist.len() {
                    return Err(CabError::new(ErrorKind::InvalidMatch {
                        distance: dist,
                        available: hist.len(),
                    }));
                }
                // overlapping copies repeat the leading bytes, so this has
                // to move one byte at a time
                for _ in 0..mlen {
                    let b = hist[hist.len() - dist];
                    out.push(b);
                    hist.push(b);
                }
            }
        }
    }

    /// Match length for symbols 257-285 (3..=258 bytes).
    fn match_len<I: Iterator<Item = u8>>(sym: u16, bits: &mut BitStream<I>) -> Res<usize> {
        if sym <= 264 {
            Ok(sym as usize - 254)
        } else if sym < MAX_MATCH_SYM {
            let xbits = u32::from(sym - 261) / 4;
            let base = ((usize::from(sym - 265) % 4 + 4) << xbits) + 3;
            Ok(base + bits.read_bits(xbits, GroupOrder::LsbFirst)? as usize)
        } else if sym == MAX_MATCH_SYM {
            Ok(258)
        } else {
            Err(CabError::context(
                ErrorKind::InvalidCodebook,
                format!("match symbol {}", sym),
            ))
        }
    }

    /// Match distance for distance symbols 0-29 (1..=32768 bytes).
    fn match_dist<I: Iterator<Item = u8>>(sym: u16, bits: &mut BitStream<I>) -> Res<usize> {
        if sym > MAX_DIST_SYM {
            return Err(CabError::context(
                ErrorKind::InvalidCodebook,
                format!("distance symbol {}", sym),
            ));
        }
        if sym <= 3 {
            Ok(sym as usize + 1)
        } else {
            let xbits = u32::from(sym) / 2 - 1;
            let base = ((sym as usize % 2 + 2) << xbits) + 1;
            Ok(base + bits.read_bits(xbits, GroupOrder::LsbFirst)? as usize)
        }
    }

    /// Roll the history buffer so it stays at its maximum size.
    fn roll_hist(hist: &mut Vec<u8>) {
        if hist.len() > MAX_HIST {
            hist.drain(..hist.len() - MAX_HIST);
        }
    }
}

impl Raise for Inflate {
    fn describe(&self) -> Option<String> {
        Some(format!("{} bytes of history", self.hist.len()))
    }
}
