//! Directory of still images played back as a video stream.

use crate::source::{CameraError, CaptureDevice};
use rollcall_core::Frame;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Plays image files in lexical order.
///
/// Unreadable files surface as transient errors and are skipped; the end of
/// the sequence is [`CameraError::Exhausted`] unless looping.
pub struct StillSequence {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    sequence: u64,
    interval: Option<Duration>,
    last_read: Option<Instant>,
    looping: bool,
    released: bool,
}

impl StillSequence {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CameraError::DeviceNotFound(format!(
                "{}: no images",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), frames = files.len(), "opened still sequence");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: 0,
            sequence: 0,
            interval: None,
            last_read: None,
            looping: false,
            released: false,
        })
    }

    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last_read) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_read = Some(Instant::now());
    }
}

impl CaptureDevice for StillSequence {
    fn read(&mut self) -> Result<Frame, CameraError> {
        if self.released {
            return Err(CameraError::Disconnected(self.describe()));
        }
        if self.next >= self.files.len() {
            if !self.looping {
                return Err(CameraError::Exhausted);
            }
            self.next = 0;
        }
        self.pace();

        let path = &self.files[self.next];
        self.next += 1;
        let image = image::open(path)
            .map_err(|e| CameraError::Transient(format!("{}: {e}", path.display())))?
            .to_rgb8();

        let frame = Frame::new(image, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released {
            tracing::debug!(dir = %self.dir.display(), "released still sequence");
            self.released = true;
        }
    }

    fn describe(&self) -> String {
        format!("stills:{}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write(dir: &Path, name: &str, shade: u8) {
        RgbImage::from_pixel(8, 6, Rgb([shade, shade, shade]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_plays_in_lexical_order_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.png", 20);
        write(dir.path(), "a.png", 10);
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut seq = StillSequence::open(dir.path()).unwrap();
        assert_eq!(seq.len(), 2);
        let first = seq.read().unwrap();
        assert_eq!(first.image.get_pixel(0, 0)[0], 10);
        assert_eq!(first.sequence, 0);
        assert_eq!(seq.read().unwrap().sequence, 1);
        assert!(matches!(seq.read(), Err(CameraError::Exhausted)));
    }

    #[test]
    fn test_corrupt_file_is_transient_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"garbage").unwrap();
        write(dir.path(), "b.png", 30);

        let mut seq = StillSequence::open(dir.path()).unwrap();
        assert!(seq.read().unwrap_err().is_transient());
        assert_eq!(seq.read().unwrap().image.get_pixel(0, 0)[0], 30);
    }

    #[test]
    fn test_looping_restarts() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "only.png", 5);
        let mut seq = StillSequence::open(dir.path()).unwrap().looping(true);
        for expected in 0..3 {
            assert_eq!(seq.read().unwrap().sequence, expected);
        }
    }

    #[test]
    fn test_release_stops_reads() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.png", 5);
        let mut seq = StillSequence::open(dir.path()).unwrap();
        seq.release();
        seq.release();
        assert!(matches!(seq.read(), Err(CameraError::Disconnected(_))));
    }

    #[test]
    fn test_empty_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StillSequence::open(dir.path()),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
