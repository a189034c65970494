//! A renderer that keeps the last uploaded frame so it can be saved on exit.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use mplanecam_engine::{EngineResult, Renderer, TextureHandle};

/// The most recent frame seen by a [`SnapshotRenderer`].
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub width: u32,
    pub height: u32,
    /// Packed BGRA rows.
    pub bgra: Vec<u8>,
    pub uploads: u64,
    pub draws: u64,
}

impl Snapshot {
    /// Encodes the frame as a binary PPM (P6).
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.reserve(self.bgra.len() / 4 * 3);
        for px in self.bgra.chunks_exact(4) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        out
    }

    pub fn save_ppm(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.to_ppm())
    }
}

/// Records targets and uploads in memory instead of drawing them.
#[derive(Debug, Default, Clone)]
pub struct SnapshotRenderer {
    latest: Arc<Mutex<Snapshot>>,
    next_target: u64,
}

impl SnapshotRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the last frame.
    pub fn snapshot(&self) -> Snapshot {
        self.latest.lock().clone()
    }
}

impl Renderer for SnapshotRenderer {
    fn create_target(&mut self, width: u32, height: u32, initial: &[u8]) -> EngineResult<TextureHandle> {
        self.next_target += 1;
        let mut latest = self.latest.lock();
        latest.width = width;
        latest.height = height;
        latest.bgra = initial.to_vec();
        Ok(TextureHandle(self.next_target))
    }

    fn update_target(&mut self, _: TextureHandle, data: &[u8], _: u32) {
        let mut latest = self.latest.lock();
        latest.bgra.clear();
        latest.bgra.extend_from_slice(data);
        latest.uploads += 1;
    }

    fn destroy_target(&mut self, _: TextureHandle) {}

    fn draw(&mut self, _: TextureHandle, _: u32, _: u32) {
        self.latest.lock().draws += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ppm_is_rgb_with_header() {
        let snapshot = Snapshot {
            width: 2,
            height: 1,
            bgra: vec![1, 2, 3, 255, 4, 5, 6, 255],
            ..Default::default()
        };
        let ppm = snapshot.to_ppm();
        let header = b"P6\n2 1\n255\n";
        assert_eq!(&ppm[..header.len()], header);
        assert_eq!(&ppm[header.len()..], &[3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_clones_share_the_latest_frame() {
        let renderer = SnapshotRenderer::new();
        let mut boxed = renderer.clone();
        let target = boxed.create_target(1, 1, &[0, 0, 0, 255]).unwrap();
        boxed.update_target(target, &[9, 9, 9, 255], 4);
        boxed.draw(target, 1, 1);

        let snapshot = renderer.snapshot();
        assert_eq!(snapshot.bgra, vec![9, 9, 9, 255]);
        assert_eq!((snapshot.uploads, snapshot.draws), (1, 1));
    }
}
