use crate::algorithm::{DataBlock, FolderDecoder, Lzx, MsZip};
use crate::core::error::{CabError, ErrorKind, Raise, Res};
use std::io::{Read, Seek, SeekFrom};

// https://msdn.microsoft.com/en-us/library/bb417343.aspx

/// File is read-only.
pub const ATTR_RDONLY: u16 = 0x01;
/// File is hidden.
pub const ATTR_HIDDEN: u16 = 0x02;
/// File is a system file.
pub const ATTR_SYSTEM: u16 = 0x04;
/// File modified since last backup.
pub const ATTR_ARCH: u16 = 0x20;
/// Run after extraction.
pub const ATTR_EXEC: u16 = 0x40;
/// szName contains UTF.
pub const ATTR_NAME_IS_UTF: u16 = 0x80;

/// szCabinetPrev and szDiskPrev are present in the CFHEADER.
const FLAG_PREV_CABINET: u16 = 0x0001;
/// szCabinetNext and szDiskNext are present in the CFHEADER.
const FLAG_NEXT_CABINET: u16 = 0x0002;
/// cbCFHeader, cbCFFolder and cbCFData are present in the CFHEADER.
const FLAG_RESERVE_PRESENT: u16 = 0x0004;

const COMP_NONE: u16 = 0x00;
const COMP_MSZIP: u16 = 0x01;
const COMP_QUANTUM: u16 = 0x02;
const COMP_LZX: u16 = 0x03;

/// Folder compression algorithm, decoded from `typeCompress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    MsZip,
    Quantum,
    Lzx { window_bits: u8 },
    Unknown(u8),
}

/// Fixed CFHEADER fields plus the flag-gated optional tail.
#[derive(Debug)]
pub struct CfHeader {
    /// Size of this cabinet file in bytes.
    pub cb_cabinet: u32,
    /// Offset of the first CFFILE entry.
    pub coff_files: u32,
    pub version_minor: u8,
    pub version_major: u8,
    pub c_folders: u16,
    pub c_files: u16,
    pub flags: u16,
    /// Must be the same for all cabinets in a set.
    pub set_id: u16,
    /// Number of this cabinet file in a set.
    pub i_cabinet: u16,
    pub reserve: Option<HeaderReserve>,
    /// Names of the previous cabinet file and disk.
    pub prev_cabinet: Option<(String, String)>,
    /// Names of the next cabinet file and disk.
    pub next_cabinet: Option<(String, String)>,
}

/// Reserved-area sizes and the per-cabinet reserved bytes.
#[derive(Debug)]
pub struct HeaderReserve {
    pub cb_cfheader: u16,
    pub cb_cffolder: u8,
    pub cb_cfdata: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CfFolder {
    /// File offset of the first CFDATA block.
    pub coff_cab_start: u32,
    /// CFDATA block count.
    pub c_cfdata: u16,
    pub type_compress: u16,
    pub reserve: Vec<u8>,
}

impl CfFolder {
    pub fn compression(&self) -> Compression {
        match self.type_compress & 0x00ff {
            COMP_NONE => Compression::None,
            COMP_MSZIP => Compression::MsZip,
            COMP_QUANTUM => Compression::Quantum,
            COMP_LZX => Compression::Lzx {
                window_bits: ((self.type_compress >> 8) & 0x1f) as u8,
            },
            other => Compression::Unknown(other as u8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfFile {
    /// Uncompressed size in bytes.
    pub cb_file: u32,
    /// Offset within the folder's uncompressed stream.
    pub uoff_folder_start: u32,
    pub i_folder: u16,
    pub date: u16,
    pub time: u16,
    pub attribs: u16,
    pub name: String,
}

/// Parsed container tables: header, folders and files in table order.
#[derive(Debug)]
pub struct Cabinet {
    pub header: CfHeader,
    pub folders: Vec<CfFolder>,
    pub files: Vec<CfFile>,
}

impl Cabinet {
    /// Cabinet file format version as (major, minor).
    pub fn version(&self) -> (u8, u8) {
        (self.header.version_major, self.header.version_minor)
    }

    /// Size of the cabinet file in bytes, as declared by the header.
    pub fn total_size(&self) -> u32 {
        self.header.cb_cabinet
    }
}

/// One extracted file, in CFFILE table order.
#[derive(Debug)]
pub struct ExtractedFile {
    pub name: String,
    pub data: Vec<u8>,
    pub attribs: u16,
}

fn read_bytes<In: Read>(input: &mut In, n: usize, kind: ErrorKind) -> Res<Vec<u8>> {
    let mut buf = vec![0; n];
    input
        .read_exact(&mut buf)
        .map_err(|e| CabError::context(kind, format!("reading {} bytes: {}", n, e)))?;
    Ok(buf)
}

fn read_u8<In: Read>(input: &mut In, kind: ErrorKind) -> Res<u8> {
    Ok(read_bytes(input, 1, kind)?[0])
}

fn read_u16<In: Read>(input: &mut In, kind: ErrorKind) -> Res<u16> {
    let b = read_bytes(input, 2, kind)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32<In: Read>(input: &mut In, kind: ErrorKind) -> Res<u32> {
    let b = read_bytes(input, 4, kind)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Incrementally read a NUL terminated string.
fn read_zstring<In: Read>(input: &mut In, kind: ErrorKind) -> Res<String> {
    let mut raw = Vec::new();
    loop {
        let b = read_u8(input, kind.clone())?;
        if b == 0 {
            break;
        }
        raw.push(b);
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Walks a folder's CFDATA chain, yielding one block at a time.
struct CfDataCursor {
    next_off: u64,
    remaining: u16,
    reserve: u8,
}

impl CfDataCursor {
    fn next_block<In: Read + Seek>(&mut self, input: &mut In) -> Res<Option<DataBlock>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        input
            .seek(SeekFrom::Start(self.next_off))
            .map_err(|e| CabError::context(ErrorKind::ShortRead, e.to_string()))?;

        let _csum = read_u32(input, ErrorKind::ShortRead)?; // unverified
        let cb_data = read_u16(input, ErrorKind::ShortRead)?;
        let cb_uncomp = read_u16(input, ErrorKind::ShortRead)?;
        if self.reserve > 0 {
            read_bytes(input, self.reserve as usize, ErrorKind::ShortRead)?;
        }
        let data = read_bytes(input, cb_data as usize, ErrorKind::ShortRead)?;
        log::debug!(
            "cfdata at {}: {} compressed, {} uncompressed",
            self.next_off,
            cb_data,
            cb_uncomp
        );

        self.remaining -= 1;
        self.next_off += 8 + u64::from(self.reserve) + u64::from(cb_data);
        Ok(Some(DataBlock {
            data,
            uncomp_len: cb_uncomp as usize,
        }))
    }
}

/// Decode state for the folder currently being served.
struct FolderState {
    index: u16,
    decoder: FolderDecoder,
    cursor: CfDataCursor,
    /// Decoded bytes not yet handed to a file.
    decoded: Vec<u8>,
    /// Uncompressed folder offset of `decoded[0]`.
    base: u64,
}

/// Pull-based cabinet extractor.
///
/// Parses the container tables on first use, then serves files strictly in
/// CFFILE order; within a folder the decoder and its history carry over
/// from file to file.
///
/// ```no_run
/// # fn main() -> std::io::Result<()> {
/// let file = std::fs::File::open("example.cab")?;
/// let mut extractor = uncab::Extractor::new(file);
/// while let Some(entry) = extractor.read_next()? {
///     println!("{}: {} bytes", entry.name, entry.data.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Extractor<In> {
    input: In,
    cabinet: Option<Cabinet>,
    next_file: usize,
    folder: Option<FolderState>,
}

impl<In: Read + Seek> Extractor<In> {
    pub fn new(input: In) -> Extractor<In> {
        Extractor {
            input,
            cabinet: None,
            next_file: 0,
            folder: None,
        }
    }

    fn ensure_parsed(&mut self) -> Res<()> {
        if self.cabinet.is_none() {
            self.cabinet = Some(parse_cabinet(&mut self.input)?);
        }
        Ok(())
    }

    /// The parsed container tables.
    pub fn cabinet(&mut self) -> Res<&Cabinet> {
        self.ensure_parsed()?;
        self.cabinet
            .as_ref()
            .ok_or_else(|| CabError::new(ErrorKind::BadCabHeader))
    }

    /// Extract the next file in CFFILE order, or `None` past the last.
    pub fn read_next(&mut self) -> Res<Option<ExtractedFile>> {
        self.ensure_parsed()?;
        let (file, folder, cb_cfdata) = {
            let Some(cabinet) = &self.cabinet else {
                return Err(CabError::new(ErrorKind::BadCabHeader));
            };
            let Some(file) = cabinet.files.get(self.next_file) else {
                return Ok(None);
            };
            let folder = cabinet
                .folders
                .get(file.i_folder as usize)
                .ok_or_else(|| {
                    CabError::context(
                        ErrorKind::BadCabHeader,
                        format!("file {} names folder {}", file.name, file.i_folder),
                    )
                })?;
            let cb_cfdata = cabinet
                .header
                .reserve
                .as_ref()
                .map_or(0, |r| r.cb_cfdata);
            (file.clone(), folder.clone(), cb_cfdata)
        };

        if self.folder.as_ref().map(|s| s.index) != Some(file.i_folder) {
            self.open_folder(file.i_folder, &folder, cb_cfdata)?;
        }

        let start = u64::from(file.uoff_folder_start);
        let end = start + u64::from(file.cb_file);
        let Some(state) = &mut self.folder else {
            return Err(CabError::new(ErrorKind::BadCabHeader));
        };
        if start < state.base {
            return Err(CabError::context(
                ErrorKind::BadCabHeader,
                format!("file {} rewinds the folder stream", file.name),
            ));
        }

        while state.base + (state.decoded.len() as u64) < end {
            let run = match &mut state.decoder {
                FolderDecoder::Stored => state.cursor.next_block(&mut self.input)?.map(|b| b.data),
                FolderDecoder::MsZip(mszip) => match state.cursor.next_block(&mut self.input)? {
                    Some(block) => Some(mszip.decompress(&block.data)?),
                    None => None,
                },
                FolderDecoder::Lzx(lzx) => lzx.next_frame()?,
            };
            match run {
                Some(run) => state.decoded.extend_from_slice(&run),
                None => {
                    return Err(CabError::context(
                        ErrorKind::TruncatedCabinet,
                        format!(
                            "file {} needs bytes {}..{}, folder ended at {}",
                            file.name,
                            start,
                            end,
                            state.base + state.decoded.len() as u64
                        ),
                    ))
                }
            }
        }

        let lo = (start - state.base) as usize;
        let hi = (end - state.base) as usize;
        let data = state.decoded[lo..hi].to_vec();
        state.decoded.drain(..hi);
        state.base = end;
        self.next_file += 1;

        log::debug!("extracted {} ({} bytes)", file.name, data.len());
        Ok(Some(ExtractedFile {
            name: file.name,
            data,
            attribs: file.attribs,
        }))
    }

    fn open_folder(&mut self, index: u16, folder: &CfFolder, cb_cfdata: u8) -> Res<()> {
        let mut cursor = CfDataCursor {
            next_off: u64::from(folder.coff_cab_start),
            remaining: folder.c_cfdata,
            reserve: cb_cfdata,
        };
        log::debug!(
            "opening folder {} ({:?}, {} blocks)",
            index,
            folder.compression(),
            folder.c_cfdata
        );

        let decoder = match folder.compression() {
            Compression::None => FolderDecoder::Stored,
            Compression::MsZip => FolderDecoder::MsZip(MsZip::new()?),
            Compression::Lzx { .. } => {
                // the LZX bit stream spans block boundaries, so the folder
                // is gathered up front
                let mut blocks = Vec::new();
                while let Some(block) = cursor.next_block(&mut self.input)? {
                    blocks.push(block);
                }
                FolderDecoder::Lzx(Lzx::new(folder.type_compress, blocks)?)
            }
            Compression::Quantum | Compression::Unknown(_) => {
                return self.raise(ErrorKind::UnsupportedCompression(folder.type_compress))
            }
        };

        self.folder = Some(FolderState {
            index,
            decoder,
            cursor,
            decoded: Vec::new(),
            base: 0,
        });
        Ok(())
    }
}

impl<In> Raise for Extractor<In> {
    fn describe(&self) -> Option<String> {
        Some(format!("file index {}", self.next_file))
    }
}

fn parse_cabinet<In: Read + Seek>(input: &mut In) -> Res<Cabinet> {
    input
        .seek(SeekFrom::Start(0))
        .map_err(|e| CabError::context(ErrorKind::BadCabHeader, e.to_string()))?;

    let signature = read_bytes(input, 4, ErrorKind::BadCabHeader)?;
    if signature != b"MSCF" {
        return Err(CabError::context(
            ErrorKind::BadCabHeader,
            format!("signature {:02x?}", signature),
        ));
    }

    let _reserved1 = read_u32(input, ErrorKind::BadCabHeader)?;
    let cb_cabinet = read_u32(input, ErrorKind::BadCabHeader)?;
    let _reserved2 = read_u32(input, ErrorKind::BadCabHeader)?;
    let coff_files = read_u32(input, ErrorKind::BadCabHeader)?;
    let _reserved3 = read_u32(input, ErrorKind::BadCabHeader)?;
    let version_minor = read_u8(input, ErrorKind::BadCabHeader)?;
    let version_major = read_u8(input, ErrorKind::BadCabHeader)?;
    let c_folders = read_u16(input, ErrorKind::BadCabHeader)?;
    let c_files = read_u16(input, ErrorKind::BadCabHeader)?;
    let flags = read_u16(input, ErrorKind::BadCabHeader)?;
    let set_id = read_u16(input, ErrorKind::BadCabHeader)?;
    let i_cabinet = read_u16(input, ErrorKind::BadCabHeader)?;

    // the optional fields *must* stay in this order
    let reserve = if flags & FLAG_RESERVE_PRESENT != 0 {
        let cb_cfheader = read_u16(input, ErrorKind::BadCabHeader)?;
        let cb_cffolder = read_u8(input, ErrorKind::BadCabHeader)?;
        let cb_cfdata = read_u8(input, ErrorKind::BadCabHeader)?;
        let data = read_bytes(input, cb_cfheader as usize, ErrorKind::BadCabHeader)?;
        Some(HeaderReserve {
            cb_cfheader,
            cb_cffolder,
            cb_cfdata,
            data,
        })
    } else {
        None
    };
    let prev_cabinet = if flags & FLAG_PREV_CABINET != 0 {
        Some((
            read_zstring(input, ErrorKind::BadCabHeader)?,
            read_zstring(input, ErrorKind::BadCabHeader)?,
        ))
    } else {
        None
    };
    let next_cabinet = if flags & FLAG_NEXT_CABINET != 0 {
        Some((
            read_zstring(input, ErrorKind::BadCabHeader)?,
            read_zstring(input, ErrorKind::BadCabHeader)?,
        ))
    } else {
        None
    };

    let cb_cffolder = reserve.as_ref().map_or(0, |r| r.cb_cffolder);
    let mut folders = Vec::with_capacity(c_folders as usize);
    for _ in 0..c_folders {
        let coff_cab_start = read_u32(input, ErrorKind::BadCabHeader)?;
        let c_cfdata = read_u16(input, ErrorKind::BadCabHeader)?;
        let type_compress = read_u16(input, ErrorKind::BadCabHeader)?;
        let folder_reserve = read_bytes(input, cb_cffolder as usize, ErrorKind::BadCabHeader)?;
        folders.push(CfFolder {
            coff_cab_start,
            c_cfdata,
            type_compress,
            reserve: folder_reserve,
        });
    }

    input
        .seek(SeekFrom::Start(u64::from(coff_files)))
        .map_err(|e| CabError::context(ErrorKind::BadCabHeader, e.to_string()))?;
    let mut files = Vec::with_capacity(c_files as usize);
    for _ in 0..c_files {
        let cb_file = read_u32(input, ErrorKind::BadCabHeader)?;
        let uoff_folder_start = read_u32(input, ErrorKind::BadCabHeader)?;
        let i_folder = read_u16(input, ErrorKind::BadCabHeader)?;
        let date = read_u16(input, ErrorKind::BadCabHeader)?;
        let time = read_u16(input, ErrorKind::BadCabHeader)?;
        let attribs = read_u16(input, ErrorKind::BadCabHeader)?;
        let name = read_zstring(input, ErrorKind::BadCabHeader)?;
        files.push(CfFile {
            cb_file,
            uoff_folder_start,
            i_folder,
            date,
            time,
            attribs,
            name,
        });
    }

    let header = CfHeader {
        cb_cabinet,
        coff_files,
        version_minor,
        version_major,
        c_folders,
        c_files,
        flags,
        set_id,
        i_cabinet,
        reserve,
        prev_cabinet,
        next_cabinet,
    };
    log::debug!(
        "cabinet v{}.{}: {} folders, {} files",
        header.version_major,
        header.version_minor,
        header.c_folders,
        header.c_files
    );

    Ok(Cabinet {
        header,
        folders,
        files,
    })
}
