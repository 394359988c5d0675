use crate::utils;
use kdam::{Bar, BarExt, tqdm};

/// Segment download progress for one stream, with a running byte count in
/// the postfix.
pub struct Progress {
    bar: Bar,
    bytes: usize,
}

impl Progress {
    pub fn new(desc: &str, total: usize) -> Self {
        Self {
            bar: tqdm!(
                total = total,
                desc = desc.to_owned(),
                unit = "seg".to_owned(),
                force_refresh = true,
                leave = false
            ),
            bytes: 0,
        }
    }

    pub fn update(&mut self, bytes: usize) {
        self.bytes += bytes;
        self.bar.set_postfix(utils::format_bytes(self.bytes, 2));
        let _ = self.bar.update(1);
    }

    pub fn finish(&mut self) {
        let _ = self.bar.clear();
        eprintln!();
    }
}
