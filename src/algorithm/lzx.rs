use crate::algorithm::DataBlock;
use crate::core::bits::{BitStream, GroupOrder};
use crate::core::error::{CabError, ErrorKind, Raise, Res};
use crate::core::huffman::{init_codebook, HuffTree};

/// Output frame size; the bit stream realigns to a 16-bit boundary after
/// every frame and E8 preprocessing is scoped to one frame.
const FRAME_SIZE: usize = 32 * 1024;

const INSTR_CALL: u8 = 0xE8;
/// E8 rewrites stop this close to the end of a frame.
const E8_TAIL: usize = 10;
/// E8 rewrites stop entirely past 1 GiB of output.
const E8_DISABLE_AT: i32 = 0x4000_0000;

const NUM_CHARS: usize = 256;
const BTYPE_VERBATIM: u32 = 1;
const BTYPE_ALIGNED: u32 = 2;
const BTYPE_UNCOMPRESSED: u32 = 3;
const NUM_SECONDARY_LENGTHS: usize = 249;
const NUM_PRIMARY_LENGTHS: usize = 7;
const MIN_MATCH: usize = 2;
const PRETREE_SIZE: usize = 20;

/// Position slot counts per window size, 2^15 through 2^25; CAB folders
/// only use the 15..=21 range.
const POSITION_SLOTS: [usize; 11] = [30, 32, 34, 36, 38, 42, 50, 66, 98, 162, 290];

/// LZX decompressor for one folder.
///
/// The folder's CFDATA payloads form a single bit stream of byte-swapped
/// 16-bit words which runs continuously across block boundaries, so the
/// whole folder is attached up front. Tree path lengths persist across
/// blocks and are updated differentially through per-block pretrees.
#[derive(Debug)]
pub(crate) struct Lzx {
    wsize: usize,
    window: Vec<u8>,
    winpos: usize,
    total_written: usize,
    /// The three most recent non-repeat match offsets.
    r: [usize; 3],

    xbits: [u8; 51],
    pbase: [u32; 51],

    main_lens: Vec<u8>,
    length_lens: Vec<u8>,
    mtree: HuffTree,
    ltree: HuffTree,
    atree: HuffTree,

    bits: BitStream<std::vec::IntoIter<u8>>,
    /// Uncompressed bytes not yet flushed as frames.
    remaining: usize,
    /// Decoded bytes waiting for the current frame to fill.
    pending: Vec<u8>,

    header_read: bool,
    /// E8 translation file size; zero disables preprocessing.
    ifs: u32,
    /// Output cursor for E8 rewrites, signed per the reference decoder.
    icp: i32,

    btype: u32,
    /// Output bytes left in the current block.
    bremain: usize,
    /// An odd-length uncompressed block pads one byte before the next
    /// block header.
    pad_byte: bool,
}

impl Lzx {
    /// `comp_type` is the raw CFFOLDER compression word; bits [12:8] carry
    /// the window size exponent.
    pub fn new(comp_type: u16, blocks: Vec<DataBlock>) -> Res<Self> {
        let wbits = u32::from((comp_type >> 8) & 0x1f);
        if !(15..=21).contains(&wbits) {
            return Err(CabError::context(
                ErrorKind::UnsupportedCompression(comp_type),
                format!("window bits {}", wbits),
            ));
        }
        let wsize = 1usize << wbits;
        let num_match_syms = POSITION_SLOTS[(wbits - 15) as usize] << 3;

        // Adjacent position slots share an extra-bits width, capped at 17;
        // each slot's base position accumulates the widths below it.
        let mut xbits = [0u8; 51];
        let mut width = 0u8;
        let mut slot = 0;
        while slot < 51 {
            xbits[slot] = width;
            if slot + 1 < 51 {
                xbits[slot + 1] = width;
            }
            if slot != 0 && width < 17 {
                width += 1;
            }
            slot += 2;
        }
        let mut pbase = [0u32; 51];
        for i in 1..51 {
            pbase[i] = pbase[i - 1] + (1 << xbits[i - 1]);
        }

        let remaining = blocks.iter().map(|b| b.uncomp_len).sum();
        let data: Vec<u8> = blocks.into_iter().flat_map(|b| b.data).collect();
        log::debug!(
            "lzx folder: {} compressed bytes, {} uncompressed, window {}",
            data.len(),
            remaining,
            wsize
        );

        Ok(Self {
            wsize,
            window: vec![0; wsize],
            winpos: 0,
            total_written: 0,
            r: [1, 1, 1],
            xbits,
            pbase,
            main_lens: vec![0; NUM_CHARS + num_match_syms],
            length_lens: vec![0; NUM_SECONDARY_LENGTHS],
            mtree: HuffTree::new(),
            ltree: HuffTree::new(),
            atree: HuffTree::new(),
            bits: BitStream::msb_swapped(data.into_iter()),
            remaining,
            pending: Vec::new(),
            header_read: false,
            ifs: 0,
            icp: 0,
            btype: 0,
            bremain: 0,
            pad_byte: false,
        })
    }

    /// Produce the next output frame (32 KiB until the folder's last),
    /// E8-preprocessed. `None` once the folder is exhausted.
    pub fn next_frame(&mut self) -> Res<Option<Vec<u8>>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if !self.header_read {
            self.header_read = true;
            if self.bits.read_bit()? == 1 {
                let hi = self.bits.read_bits(16, GroupOrder::MsbFirst)?;
                let lo = self.bits.read_bits(16, GroupOrder::MsbFirst)?;
                self.ifs = (hi << 16) | lo;
                log::debug!("lzx e8 preprocessing, file size {:#x}", self.ifs);
            }
        }

        let want = FRAME_SIZE.min(self.remaining);
        while self.pending.len() < want {
            if self.bremain == 0 {
                self.read_block_header()?;
                continue;
            }
            if self.btype == BTYPE_UNCOMPRESSED {
                self.copy_uncompressed()?;
            } else {
                self.decode_element()?;
            }
        }

        let mut frame: Vec<u8> = self.pending.drain(..want).collect();
        self.remaining -= want;
        self.postprocess(&mut frame);
        Ok(Some(frame))
    }

    fn read_block_header(&mut self) -> Res<()> {
        if self.pad_byte {
            self.bits.enter_byte_mode();
            self.bits.read_byte()?;
            self.bits.leave_byte_mode();
            self.pad_byte = false;
        }

        let btype = self.bits.read_bits(3, GroupOrder::MsbFirst)?;
        let hi = self.bits.read_bits(16, GroupOrder::MsbFirst)?;
        let lo = self.bits.read_bits(8, GroupOrder::MsbFirst)?;
        let blen = ((hi << 8) | lo) as usize;
        log::debug!("lzx block type {} length {}", btype, blen);
        if blen == 0 {
            return self.raise(ErrorKind::InvalidBlockLength);
        }

        match btype {
            BTYPE_VERBATIM => self.init_verbatim()?,
            BTYPE_ALIGNED => self.init_aligned()?,
            BTYPE_UNCOMPRESSED => {
                self.init_uncompressed()?;
                self.pad_byte = blen & 1 == 1;
            }
            t => return self.raise(ErrorKind::InvalidBlockType(t as u8)),
        }
        self.btype = btype;
        self.bremain = blen;
        Ok(())
    }

    fn init_verbatim(&mut self) -> Res<()> {
        let main_count = self.main_lens.len();
        Self::update_lengths(&mut self.main_lens, &mut self.bits, 0, NUM_CHARS)?;
        Self::update_lengths(&mut self.main_lens, &mut self.bits, NUM_CHARS, main_count)?;
        self.mtree.clear();
        self.mtree.load(&init_codebook(&self.main_lens))?;

        Self::update_lengths(&mut self.length_lens, &mut self.bits, 0, NUM_SECONDARY_LENGTHS)?;
        self.ltree.clear();
        self.ltree.load(&init_codebook(&self.length_lens))?;
        Ok(())
    }

    /// An aligned block is a verbatim block preceded by the eight 3-bit
    /// path lengths of the aligned offset tree.
    fn init_aligned(&mut self) -> Res<()> {
        let mut lens = [0u8; 8];
        for len in &mut lens {
            *len = self.bits.read_bits(3, GroupOrder::MsbFirst)? as u8;
        }
        self.atree.clear();
        self.atree.load(&init_codebook(&lens))?;
        self.init_verbatim()
    }

    /// Pad to a 16-bit boundary (a full word when already aligned), then
    /// read the three recent offsets as raw little-endian dwords.
    fn init_uncompressed(&mut self) -> Res<()> {
        let pad = 16 - (self.bits.bit_offset() % 16) as u32;
        self.bits.read_bits(pad, GroupOrder::MsbFirst)?;
        for i in 0..3 {
            self.r[i] = self.read_u32_le()? as usize;
        }
        Ok(())
    }

    fn read_u32_le(&mut self) -> Res<u32> {
        self.bits.enter_byte_mode();
        let mut b = [0u8; 4];
        for byte in &mut b {
            *byte = self.bits.read_byte()?;
        }
        self.bits.leave_byte_mode();
        Ok(u32::from_le_bytes(b))
    }

    /// Update a `[start, stop)` range of a persistent length table: 20
    /// 4-bit pretree lengths, then pretree symbols encoding new lengths as
    /// deltas mod 17 or runs of zeros.
    fn update_lengths(
        lens: &mut [u8],
        bits: &mut BitStream<std::vec::IntoIter<u8>>,
        start: usize,
        stop: usize,
    ) -> Res<()> {
        let mut pre_lens = [0u8; PRETREE_SIZE];
        for len in &mut pre_lens {
            *len = bits.read_bits(4, GroupOrder::MsbFirst)? as u8;
        }
        let mut pretree = HuffTree::new();
        pretree.load(&init_codebook(&pre_lens))?;

        let mut i = start;
        while i < stop {
            let sym = pretree.decode_next(bits)?;
            let (val, run) = match sym {
                0..=16 => (Self::delta(lens[i], sym as u8), 1),
                17 => (0, bits.read_bits(4, GroupOrder::MsbFirst)? as usize + 4),
                18 => (0, bits.read_bits(5, GroupOrder::MsbFirst)? as usize + 20),
                19 => {
                    let run = bits.read_bits(1, GroupOrder::MsbFirst)? as usize + 4;
                    let next = pretree.decode_next(bits)?;
                    if next > 16 {
                        return Err(CabError::context(
                            ErrorKind::InvalidCodebook,
                            "run delta is itself a run",
                        ));
                    }
                    (Self::delta(lens[i], next as u8), run)
                }
                _ => return Err(CabError::new(ErrorKind::InvalidCodebook)),
            };
            if i + run > stop {
                return Err(CabError::context(
                    ErrorKind::InvalidCodebook,
                    "length run overruns the table",
                ));
            }
            lens[i..i + run].fill(val);
            i += run;
        }
        Ok(())
    }

    fn delta(old: u8, sym: u8) -> u8 {
        let v = i32::from(old) - i32::from(sym);
        if v < 0 {
            (v + 17) as u8
        } else {
            v as u8
        }
    }

    /// Decode one main-tree element: a literal byte or a match.
    fn decode_element(&mut self) -> Res<()> {
        let sym = self.mtree.decode_next(&mut self.bits)? as usize;
        if sym < NUM_CHARS {
            self.win_emit(sym as u8);
        } else {
            let t = sym - NUM_CHARS;
            let mut mlen = t & NUM_PRIMARY_LENGTHS;
            if mlen == NUM_PRIMARY_LENGTHS {
                mlen += self.ltree.decode_next(&mut self.bits)? as usize;
            }
            mlen += MIN_MATCH;

            let moff = self.decode_offset(t >> 3)?;
            let available = self.total_written.min(self.wsize);
            if moff == 0 || moff > available {
                return self.raise(ErrorKind::InvalidMatch {
                    distance: moff,
                    available,
                });
            }

            // the source may both wrap around the window and overlap the
            // cursor, so copy one byte at a time
            let mut src = (self.winpos + self.wsize - moff) % self.wsize;
            for _ in 0..mlen {
                let b = self.window[src];
                src += 1;
                if src == self.wsize {
                    src = 0;
                }
                self.win_emit(b);
            }
        }

        if self.winpos % FRAME_SIZE == 0 {
            self.frame_align()?;
        }
        Ok(())
    }

    /// Slots 0-2 replay a recent offset; anything else derives the offset
    /// from the slot's base position and extra bits, with the low three
    /// bits coming from the aligned tree when the block is aligned and the
    /// slot is wide enough.
    fn decode_offset(&mut self, slot: usize) -> Res<usize> {
        Ok(match slot {
            0 => self.r[0],
            1 => {
                self.r.swap(0, 1);
                self.r[0]
            }
            2 => {
                self.r.swap(0, 2);
                self.r[0]
            }
            _ => {
                let ext = u32::from(self.xbits[slot]);
                let base = self.pbase[slot] as usize;
                let moff = if self.btype == BTYPE_ALIGNED {
                    if ext > 3 {
                        let verbatim = self.bits.read_bits(ext - 3, GroupOrder::MsbFirst)? as usize;
                        let aligned = self.atree.decode_next(&mut self.bits)? as usize;
                        base - 2 + (verbatim << 3) + aligned
                    } else if ext == 3 {
                        base - 2 + self.atree.decode_next(&mut self.bits)? as usize
                    } else if ext > 0 {
                        base - 2 + self.bits.read_bits(ext, GroupOrder::MsbFirst)? as usize
                    } else {
                        1
                    }
                } else {
                    base - 2 + self.bits.read_bits(ext, GroupOrder::MsbFirst)? as usize
                };
                self.r[2] = self.r[1];
                self.r[1] = self.r[0];
                self.r[0] = moff;
                moff
            }
        })
    }

    /// Copy raw block bytes through the window, one frame at a time.
    fn copy_uncompressed(&mut self) -> Res<()> {
        let to_frame = FRAME_SIZE - self.winpos % FRAME_SIZE;
        let need = to_frame.min(self.bremain);
        self.bits.enter_byte_mode();
        for _ in 0..need {
            let b = self.bits.read_byte()?;
            self.win_emit(b);
        }
        self.bits.leave_byte_mode();
        Ok(())
    }

    fn win_emit(&mut self, b: u8) {
        self.window[self.winpos] = b;
        self.winpos += 1;
        if self.winpos == self.wsize {
            self.winpos = 0;
        }
        self.total_written += 1;
        self.bremain = self.bremain.saturating_sub(1);
        self.pending.push(b);
    }

    /// The bit stream realigns to 16 bits at every frame boundary, except
    /// behind the folder's final byte where no padding follows.
    fn frame_align(&mut self) -> Res<()> {
        if self.pending.len() < self.remaining {
            self.bits.word_align()?;
        }
        Ok(())
    }

    /// Rewrite x86 `call` operands from absolute back to relative. The
    /// scan stops short of the frame tail and the cursor skips the four
    /// operand bytes of every `E8` it inspects.
    fn postprocess(&mut self, frame: &mut [u8]) {
        let len = frame.len();
        if self.ifs == 0 || self.icp >= E8_DISABLE_AT || len <= E8_TAIL {
            self.icp = self.icp.wrapping_add(len as i32);
            return;
        }

        let ifs = self.ifs as i32;
        let mut i = 0;
        while i < len - E8_TAIL {
            if frame[i] != INSTR_CALL {
                i += 1;
                continue;
            }
            let curpos = self.icp.wrapping_add(i as i32);
            let absoff =
                i32::from_le_bytes([frame[i + 1], frame[i + 2], frame[i + 3], frame[i + 4]]);
            if absoff >= -curpos && absoff < ifs {
                let reloff = if absoff >= 0 {
                    absoff.wrapping_sub(curpos)
                } else {
                    absoff.wrapping_add(ifs)
                };
                frame[i + 1..i + 5].copy_from_slice(&reloff.to_le_bytes());
            }
            i += 5;
        }
        self.icp = self.icp.wrapping_add(len as i32);
    }
}

impl Raise for Lzx {
    fn describe(&self) -> Option<String> {
        Some(format!(
            "block type {} with {} bytes left, window position {}",
            self.btype, self.bremain, self.winpos
        ))
    }
}
