use anyhow::Result;
use std::{
    collections::HashMap,
    fs::File,
    io::Write,
    path::Path,
};

/// Writes segments to a file in sequence order while they arrive in
/// completion order. A segment that shows up early waits in `buffers` until
/// its position is due; `pending()` is what the spawn gate checks to keep
/// that buffer bounded.
pub struct Merger {
    buffers: HashMap<usize, Vec<u8>>,
    file: File,
    pos: usize,
    total: usize,
    stored_bytes: usize,
}

impl Merger {
    pub fn new(total: usize, path: &Path) -> Result<Self> {
        Ok(Self {
            buffers: HashMap::new(),
            file: File::create(path)?,
            pos: 0,
            total,
            stored_bytes: 0,
        })
    }

    pub fn write(&mut self, pos: usize, buf: &[u8]) -> Result<()> {
        if pos == self.pos {
            self.file.write_all(buf)?;
            self.file.flush()?;
            self.pos += 1;
            self.drain_due()?;
        } else {
            self.buffers.insert(pos, buf.to_vec());
        }

        self.stored_bytes += buf.len();
        Ok(())
    }

    fn drain_due(&mut self) -> Result<()> {
        while let Some(buf) = self.buffers.remove(&self.pos) {
            self.file.write_all(&buf)?;
            self.file.flush()?;
            self.pos += 1;
        }

        Ok(())
    }

    /// Out-of-order segments currently parked in memory.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_complete(&self) -> bool {
        self.buffers.is_empty() && self.pos >= self.total
    }

    pub fn stored(&self) -> usize {
        self.stored_bytes
    }
}
