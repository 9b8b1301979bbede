//! Streaming decompressor for Microsoft Cabinet (CAB) archives: container
//! parsing plus the MSZIP (`CK`-framed RFC1951 DEFLATE) and LZX decoders.
#![warn(clippy::unwrap_used, clippy::panic)]
mod algorithm;
mod core;
mod extractor;

pub use crate::core::error::{CabError, ErrorKind, Res};
pub use crate::extractor::{
    Cabinet, CfFile, CfFolder, CfHeader, Compression, ExtractedFile, Extractor, HeaderReserve,
    ATTR_ARCH, ATTR_EXEC, ATTR_HIDDEN, ATTR_NAME_IS_UTF, ATTR_RDONLY, ATTR_SYSTEM,
};

#[cfg(test)]
mod tests {
    use crate::{Compression, ErrorKind, Extractor};
    use std::io::Cursor;

    /// Assembles cabinet bytes: header, folder and file tables, CFDATA
    /// chains, with optional reserved areas and set linkage.
    #[derive(Default)]
    struct CabBuilder {
        /// (typeCompress, blocks of (compressed bytes, uncompressed size))
        folders: Vec<(u16, Vec<(Vec<u8>, u16)>)>,
        /// (cbFile, uoffFolderStart, iFolder, attribs, szName)
        files: Vec<(u32, u32, u16, u16, String)>,
        /// (per-cabinet reserved bytes, cbCFFolder, cbCFData)
        reserve: Option<(Vec<u8>, u8, u8)>,
        prev: Option<(String, String)>,
        next: Option<(String, String)>,
    }

    const FLAG_PREV_CABINET: u16 = 0x0001;
    const FLAG_NEXT_CABINET: u16 = 0x0002;
    const FLAG_RESERVE_PRESENT: u16 = 0x0004;

    impl CabBuilder {
        fn folder(mut self, type_compress: u16, blocks: Vec<(Vec<u8>, u16)>) -> Self {
            self.folders.push((type_compress, blocks));
            self
        }

        fn file(mut self, size: u32, uoff: u32, i_folder: u16, name: &str) -> Self {
            self.files.push((size, uoff, i_folder, 0x20, name.into()));
            self
        }

        fn build(self) -> Vec<u8> {
            let mut flags = 0u16;
            let (ab_reserve, cb_cffolder, cb_cfdata) = match &self.reserve {
                Some((ab, f, d)) => {
                    flags |= FLAG_RESERVE_PRESENT;
                    (ab.clone(), *f, *d)
                }
                None => (Vec::new(), 0, 0),
            };
            if self.prev.is_some() {
                flags |= FLAG_PREV_CABINET;
            }
            if self.next.is_some() {
                flags |= FLAG_NEXT_CABINET;
            }

            let zstrs = |pair: &Option<(String, String)>| {
                pair.as_ref()
                    .map_or(0, |(a, b)| a.len() + b.len() + 2)
            };
            let header_len = 36
                + if self.reserve.is_some() {
                    4 + ab_reserve.len()
                } else {
                    0
                }
                + zstrs(&self.prev)
                + zstrs(&self.next);
            let folders_len = self.folders.len() * (8 + cb_cffolder as usize);
            let coff_files = (header_len + folders_len) as u32;
            let files_len: usize = self
                .files
                .iter()
                .map(|(.., name)| 16 + name.len() + 1)
                .sum();

            let mut data_off = coff_files as usize + files_len;
            let mut folder_offsets = Vec::new();
            for (_, blocks) in &self.folders {
                folder_offsets.push(data_off as u32);
                data_off += blocks
                    .iter()
                    .map(|(data, _)| 8 + cb_cfdata as usize + data.len())
                    .sum::<usize>();
            }

            let mut out = Vec::new();
            out.extend_from_slice(b"MSCF");
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&(data_off as u32).to_le_bytes()); // cbCabinet
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&coff_files.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.push(3); // versionMinor
            out.push(1); // versionMajor
            out.extend_from_slice(&(self.folders.len() as u16).to_le_bytes());
            out.extend_from_slice(&(self.files.len() as u16).to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&0x0622u16.to_le_bytes()); // setID
            out.extend_from_slice(&0u16.to_le_bytes()); // iCabinet
            if self.reserve.is_some() {
                out.extend_from_slice(&(ab_reserve.len() as u16).to_le_bytes());
                out.push(cb_cffolder);
                out.push(cb_cfdata);
                out.extend_from_slice(&ab_reserve);
            }
            for pair in [&self.prev, &self.next].into_iter().flatten() {
                out.extend_from_slice(pair.0.as_bytes());
                out.push(0);
                out.extend_from_slice(pair.1.as_bytes());
                out.push(0);
            }

            for ((type_compress, blocks), off) in self.folders.iter().zip(&folder_offsets) {
                out.extend_from_slice(&off.to_le_bytes());
                out.extend_from_slice(&(blocks.len() as u16).to_le_bytes());
                out.extend_from_slice(&type_compress.to_le_bytes());
                out.extend_from_slice(&vec![0; cb_cffolder as usize]);
            }

            for (size, uoff, i_folder, attribs, name) in &self.files {
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&uoff.to_le_bytes());
                out.extend_from_slice(&i_folder.to_le_bytes());
                out.extend_from_slice(&0x4a5cu16.to_le_bytes()); // date
                out.extend_from_slice(&0x5b1du16.to_le_bytes()); // time
                out.extend_from_slice(&attribs.to_le_bytes());
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }

            for (_, blocks) in &self.folders {
                for (data, uncomp) in blocks {
                    out.extend_from_slice(&0u32.to_le_bytes()); // csum, unverified
                    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                    out.extend_from_slice(&uncomp.to_le_bytes());
                    out.extend_from_slice(&vec![0; cb_cfdata as usize]);
                    out.extend_from_slice(data);
                }
            }
            out
        }
    }

    /// MSZIP payload: `CK` plus one final stored DEFLATE block.
    fn mszip_stored(payload: &[u8]) -> Vec<u8> {
        let len = payload.len() as u16;
        let mut data = b"CK\x01".to_vec();
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&(!len).to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test_log::test]
    fn single_mszip_file() {
        let payload = b"hello cab270";
        let cab = CabBuilder::default()
            .folder(0x0001, vec![(mszip_stored(payload), 12)])
            .file(12, 0, 0, "hello.txt")
            .build();

        let mut extractor = Extractor::new(Cursor::new(cab));
        let entry = extractor.read_next().unwrap().unwrap();
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.data, payload);
        assert!(extractor.read_next().unwrap().is_none());
    }

    #[test_log::test]
    fn files_span_cfdata_blocks() {
        // folder stream "aaaaabbbbbbbbbb" split 8 + 7 across two CFDATA
        // blocks, serving a 5-byte and a 10-byte file
        let cab = CabBuilder::default()
            .folder(
                0x0001,
                vec![
                    (mszip_stored(b"aaaaabbb"), 8),
                    (mszip_stored(b"bbbbbbb"), 7),
                ],
            )
            .file(5, 0, 0, "a.txt")
            .file(10, 5, 0, "b.txt")
            .build();

        let mut extractor = Extractor::new(Cursor::new(cab));
        let first = extractor.read_next().unwrap().unwrap();
        assert_eq!(first.name, "a.txt");
        assert_eq!(first.data, b"aaaaa");
        let second = extractor.read_next().unwrap().unwrap();
        assert_eq!(second.name, "b.txt");
        assert_eq!(second.data, b"bbbbbbbbbb");
    }

    #[test_log::test]
    fn stored_folder() {
        let cab = CabBuilder::default()
            .folder(0x0000, vec![(b"raw bytes".to_vec(), 9)])
            .file(9, 0, 0, "raw.bin")
            .build();

        let mut extractor = Extractor::new(Cursor::new(cab));
        assert_eq!(extractor.read_next().unwrap().unwrap().data, b"raw bytes");
    }

    #[test_log::test]
    fn reserved_areas_are_skipped() {
        let cab = CabBuilder {
            reserve: Some((b"RSRV".to_vec(), 2, 1)),
            prev: Some(("prev.cab".into(), "disk one".into())),
            next: Some(("next.cab".into(), "disk two".into())),
            ..Default::default()
        }
        .folder(0x0001, vec![(mszip_stored(b"reserved"), 8)])
        .file(8, 0, 0, "r.txt")
        .build();

        let mut extractor = Extractor::new(Cursor::new(cab));
        let entry = extractor.read_next().unwrap().unwrap();
        assert_eq!(entry.data, b"reserved");

        let cabinet = extractor.cabinet().unwrap();
        let reserve = cabinet.header.reserve.as_ref().unwrap();
        assert_eq!(reserve.data, b"RSRV");
        assert_eq!(
            cabinet.header.prev_cabinet,
            Some(("prev.cab".into(), "disk one".into()))
        );
        assert_eq!(
            cabinet.header.next_cabinet,
            Some(("next.cab".into(), "disk two".into()))
        );
    }

    #[test]
    fn cabinet_metadata() {
        let cab = CabBuilder::default()
            .folder(0x1503, Vec::new()) // LZX, 21-bit window
            .file(0, 0, 0, "empty")
            .build();
        let total = cab.len() as u32;

        let mut extractor = Extractor::new(Cursor::new(cab));
        let cabinet = extractor.cabinet().unwrap();
        assert_eq!(cabinet.version(), (1, 3));
        assert_eq!(cabinet.total_size(), total);
        assert_eq!(cabinet.header.set_id, 0x0622);
        assert_eq!(
            cabinet.folders[0].compression(),
            Compression::Lzx { window_bits: 21 }
        );
        assert_eq!(cabinet.files[0].name, "empty");
        assert_eq!(cabinet.files[0].attribs & crate::ATTR_ARCH, crate::ATTR_ARCH);
    }

    #[test]
    fn bad_signature() {
        let mut cab = CabBuilder::default().build();
        cab[0] = b'X';
        let mut extractor = Extractor::new(Cursor::new(cab));
        assert_eq!(
            extractor.cabinet().unwrap_err().kind,
            ErrorKind::BadCabHeader
        );
    }

    #[test]
    fn quantum_is_unsupported() {
        let cab = CabBuilder::default()
            .folder(0x0002, vec![(b"xx".to_vec(), 2)])
            .file(2, 0, 0, "q.bin")
            .build();
        let mut extractor = Extractor::new(Cursor::new(cab));
        assert_eq!(
            extractor.read_next().unwrap_err().kind,
            ErrorKind::UnsupportedCompression(0x0002)
        );
    }

    #[test]
    fn truncated_folder() {
        let cab = CabBuilder::default()
            .folder(0x0001, vec![(mszip_stored(b"short"), 5)])
            .file(64, 0, 0, "long.bin")
            .build();
        let mut extractor = Extractor::new(Cursor::new(cab));
        assert_eq!(
            extractor.read_next().unwrap_err().kind,
            ErrorKind::TruncatedCabinet
        );
    }

    #[test]
    fn bad_mszip_block() {
        let cab = CabBuilder::default()
            .folder(0x0001, vec![(b"XX\x01\x00\x00\xff\xff".to_vec(), 0)])
            .file(1, 0, 0, "x.bin")
            .build();
        let mut extractor = Extractor::new(Cursor::new(cab));
        assert_eq!(
            extractor.read_next().unwrap_err().kind,
            ErrorKind::BadMsZipSignature
        );
    }

    // errors convert into io::Error for callers living in Read land
    #[test]
    fn io_error_conversion() {
        let mut extractor = Extractor::new(Cursor::new(b"not a cabinet".to_vec()));
        let err: std::io::Error = extractor.cabinet().unwrap_err().into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
