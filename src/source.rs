use std::path::{Path, PathBuf};

use glob::glob;
use image::{GrayImage, ImageReader};
use log::{trace, warn};

/// Borrowed view of the source's current frame, 8-bit luma, row-major.
pub struct VideoFrame<'a> {
    pub time_ns: i64,
    pub width: u32,
    pub height: u32,
    pub luma: &'a [u8],
}

/// Boundary to video acquisition.
///
/// The session checks a frame out, copies it, and checks it back in before
/// the source may reuse its buffer.
pub trait FrameSource {
    /// Returns the current frame if it is newer than `time_ns`, or any frame
    /// when `time_ns` is `None`.
    fn checkout_frame_if_newer_than(&mut self, time_ns: Option<i64>) -> Option<VideoFrame<'_>>;

    fn checkin_frame(&mut self);
}

/// Parses the timestamp from a file path.
///
/// Assumes the filename (without extension) is a timestamp in nanoseconds.
fn path_to_timestamp(path: &Path) -> Option<i64> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn img_filter(rp: glob::GlobResult) -> Option<PathBuf> {
    if let Ok(p) = rp {
        for ext in &[".png", ".jpg"] {
            if p.as_os_str().to_string_lossy().ends_with(ext) {
                return Some(p);
            }
        }
    }
    None
}

/// Plays a folder of images back as a video stream, one image per checkout.
///
/// Frames are decoded lazily into a single reused luma buffer. Images whose
/// name is not a nanosecond timestamp are spaced 100 ms apart.
pub struct ImageFolderSource {
    paths: Vec<PathBuf>,
    next_idx: usize,
    current: Option<(i64, GrayImage)>,
    checked_out: bool,
}

impl ImageFolderSource {
    /// Collects every `.png` / `.jpg` directly inside `root_folder`, sorted by
    /// path, keeping every `step`-th one.
    pub fn open(root_folder: &str, step: usize) -> Result<ImageFolderSource, glob::PatternError> {
        let img_paths = glob(format!("{}/*", root_folder).as_str())?;
        let mut sorted_path: Vec<PathBuf> = img_paths.into_iter().filter_map(img_filter).collect();
        sorted_path.sort();
        let paths = sorted_path.into_iter().step_by(step.max(1)).collect();
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> ImageFolderSource {
        ImageFolderSource {
            paths,
            next_idx: 0,
            current: None,
            checked_out: false,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// All images have been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.next_idx >= self.paths.len()
    }

    /// Size of the first decodable image.
    pub fn first_frame_size(&self) -> Option<(u32, u32)> {
        self.paths.iter().find_map(|p| {
            image::image_dimensions(p)
                .map_err(|e| warn!("cannot read {}: {}", p.display(), e))
                .ok()
        })
    }

    fn advance(&mut self) -> bool {
        while self.next_idx < self.paths.len() {
            let idx = self.next_idx;
            self.next_idx += 1;
            let path = &self.paths[idx];
            let decoded = ImageReader::open(path)
                .map_err(image::ImageError::IoError)
                .and_then(|r| r.decode());
            match decoded {
                Ok(img) => {
                    let time_ns = path_to_timestamp(path).unwrap_or(idx as i64 * 100000000);
                    trace!("frame {} from {}", time_ns, path.display());
                    let luma = img.to_luma8();
                    match &mut self.current {
                        Some((t, buf)) if buf.dimensions() == luma.dimensions() => {
                            *t = time_ns;
                            buf.copy_from_slice(&luma);
                        }
                        _ => self.current = Some((time_ns, luma)),
                    }
                    return true;
                }
                Err(e) => warn!("skipping {}: {}", path.display(), e),
            }
        }
        false
    }
}

impl FrameSource for ImageFolderSource {
    fn checkout_frame_if_newer_than(&mut self, time_ns: Option<i64>) -> Option<VideoFrame<'_>> {
        if !self.checked_out {
            loop {
                if !self.advance() {
                    return None;
                }
                match &self.current {
                    Some((t, _)) if time_ns.is_some_and(|since| *t <= since) => continue,
                    _ => break,
                }
            }
            self.checked_out = true;
        }
        let (t, buf) = self.current.as_ref()?;
        Some(VideoFrame {
            time_ns: *t,
            width: buf.width(),
            height: buf.height(),
            luma: buf.as_raw(),
        })
    }

    fn checkin_frame(&mut self) {
        self.checked_out = false;
    }
}
