use crate::algorithm::inflate::Inflate;
use crate::core::bits::BitStream;
use crate::core::error::{CabError, ErrorKind, Res};

/// MSZIP framing: each CFDATA block opens with `CK` and carries one
/// DEFLATE stream terminated by its BFINAL block.
///
/// The inflater, and with it the 32 KiB history, is shared across the
/// folder's blocks so later blocks can back-reference earlier output.
pub(crate) struct MsZip {
    inflate: Inflate,
}

impl MsZip {
    pub fn new() -> Res<Self> {
        Ok(Self {
            inflate: Inflate::new()?,
        })
    }

    /// Decompress one CFDATA payload.
    pub fn decompress(&mut self, data: &[u8]) -> Res<Vec<u8>> {
        if data.len() < 2 || &data[..2] != b"CK" {
            return Err(CabError::context(
                ErrorKind::BadMsZipSignature,
                format!("{:02x?}", &data[..data.len().min(8)]),
            ));
        }

        let mut bits = BitStream::lsb(data[2..].iter().copied());
        let mut out = Vec::new();
        loop {
            let (block, last) = self.inflate.next_block(&mut bits)?;
            out.extend_from_slice(&block);
            if last {
                break;
            }
        }
        log::debug!("mszip block decoded to {} bytes", out.len());
        Ok(out)
    }
}
