mod inflate;
mod lzx;
mod mszip;

pub(crate) use lzx::Lzx;
pub(crate) use mszip::MsZip;

/// One CFDATA payload with its declared uncompressed size.
pub(crate) struct DataBlock {
    pub data: Vec<u8>,
    pub uncomp_len: usize,
}

/// Per-folder decoder, selected by `CFFOLDER.typeCompress`.
///
/// `Stored` and `MsZip` pull one CFDATA block per run; `Lzx` swallows the
/// folder's blocks up front because its bit stream runs continuously across
/// block boundaries.
pub(crate) enum FolderDecoder {
    Stored,
    MsZip(MsZip),
    Lzx(Lzx),
}
