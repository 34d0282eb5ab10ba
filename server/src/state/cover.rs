//! Job cover image assembly
//!
//! Covers arrive as base64 chunks spread over several report frames. Chunks
//! sharing an assembly id are concatenated; a chunk flagged `end` finalizes
//! the image. A new id abandons any partial buffer, and oversized
//! assemblies are discarded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::mqtt::bambu_api::CoverChunk;

/// Upper bound on a decoded cover (RGB565 on the device display is far
/// smaller; this caps a runaway chunk stream).
const MAX_COVER_BYTES: usize = 4 * 1024 * 1024;

#[derive(Default)]
pub struct CoverAssembler {
    id: String,
    buf: Vec<u8>,
}

pub enum CoverProgress {
    /// Chunk absorbed, image not complete yet
    Partial,
    /// Terminating chunk seen; the assembled image
    Complete(Vec<u8>),
    /// Chunk rejected (bad base64 or size cap); buffer discarded
    Discarded(String),
}

impl CoverAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &CoverChunk) -> CoverProgress {
        if chunk.id != self.id {
            self.id = chunk.id.clone();
            self.buf.clear();
        }

        let decoded = match STANDARD.decode(&chunk.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.reset();
                return CoverProgress::Discarded(format!("bad base64 in cover chunk: {e}"));
            }
        };

        if self.buf.len() + decoded.len() > MAX_COVER_BYTES {
            self.reset();
            return CoverProgress::Discarded("cover assembly exceeded size limit".into());
        }

        self.buf.extend_from_slice(&decoded);

        if chunk.end {
            let image = std::mem::take(&mut self.buf);
            self.id.clear();
            CoverProgress::Complete(image)
        } else {
            CoverProgress::Partial
        }
    }

    fn reset(&mut self) {
        self.id.clear();
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, data: &[u8], end: bool) -> CoverChunk {
        CoverChunk {
            id: id.into(),
            data: STANDARD.encode(data),
            end,
        }
    }

    #[test]
    fn test_multi_chunk_assembly() {
        let mut asm = CoverAssembler::new();
        assert!(matches!(asm.push(&chunk("c1", b"hello ", false)), CoverProgress::Partial));
        match asm.push(&chunk("c1", b"world", true)) {
            CoverProgress::Complete(img) => assert_eq!(img, b"hello world"),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn test_new_id_abandons_partial() {
        let mut asm = CoverAssembler::new();
        asm.push(&chunk("c1", b"stale", false));
        match asm.push(&chunk("c2", b"fresh", true)) {
            CoverProgress::Complete(img) => assert_eq!(img, b"fresh"),
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn test_bad_base64_discards() {
        let mut asm = CoverAssembler::new();
        let bad = CoverChunk {
            id: "c1".into(),
            data: "!!not-base64!!".into(),
            end: false,
        };
        assert!(matches!(asm.push(&bad), CoverProgress::Discarded(_)));
        // The assembler recovers for the next image
        match asm.push(&chunk("c2", b"ok", true)) {
            CoverProgress::Complete(img) => assert_eq!(img, b"ok"),
            _ => panic!("expected completion"),
        }
    }
}
