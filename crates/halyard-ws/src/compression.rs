//! Optional zlib-stream wrapper applied uniformly just before each
//! write. One shared deflate stream per connection; every frame is
//! flushed with Z_SYNC_FLUSH so the client can inflate incrementally.

use flate2::{Compress, Compression, FlushCompress, Status};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("zlib-stream compression failed: {0}")]
pub struct CompressError(String);

pub struct WsCompressor {
    stream: Option<Mutex<Compress>>,
}

impl WsCompressor {
    pub fn new(enabled: bool) -> Self {
        Self {
            stream: enabled.then(|| Mutex::new(Compress::new(Compression::default(), true))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.stream.is_some()
    }

    /// Compress one frame, or `None` when the connection did not opt in.
    pub fn compress(&self, data: &[u8]) -> Option<Result<Vec<u8>, CompressError>> {
        let stream = self.stream.as_ref()?;
        let mut stream = stream.lock().unwrap_or_else(|e| e.into_inner());

        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let start_in = stream.total_in();
        loop {
            let consumed = (stream.total_in() - start_in) as usize;
            if out.len() == out.capacity() {
                out.reserve(4096);
            }
            match stream.compress_vec(&data[consumed..], &mut out, FlushCompress::Sync) {
                Ok(Status::Ok | Status::BufError) => {
                    let consumed = (stream.total_in() - start_in) as usize;
                    // Sync flush is complete once all input is taken and
                    // the output buffer has spare room.
                    if consumed == data.len() && out.len() < out.capacity() {
                        return Some(Ok(out));
                    }
                }
                Ok(Status::StreamEnd) => return Some(Ok(out)),
                Err(e) => return Some(Err(CompressError(e.to_string()))),
            }
        }
    }
}
