//! Face input loading: a still image, or video frames decoded through an
//! ffmpeg rawvideo pipe, with optional downscale / rotation / cropping.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};

use image::{imageops, imageops::FilterType, RgbImage};
use log::{debug, info};

use crate::align::FrameSource;
use crate::config::{Region, Settings};
use crate::error::{LipSyncError, Result};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Whether `path` is treated as a single static image.
pub fn is_static_input(path: &Path, settings: &Settings) -> bool {
    settings.force_static || IMAGE_EXTENSIONS.contains(&extension_of(path).as_str())
}

/// Load the face input as a [`FrameSource`] plus the frame rate to encode at.
///
/// Still images use the configured fps; videos report their own via ffprobe.
pub fn load_face_source(path: &Path, settings: &Settings) -> Result<(FrameSource, f64)> {
    if IMAGE_EXTENSIONS.contains(&extension_of(path).as_str()) {
        let img = image::open(path)
            .map_err(|e| {
                LipSyncError::Input(format!(
                    "could not read face image at {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_rgb8();
        info!("Loaded static face image {}", path.display());
        return Ok((FrameSource::Static(img), settings.fps));
    }

    let fps = probe_fps(path)?;
    let (width, height) = probe_resolution(path)?;
    let frames = decode_video_frames(path, width, height, settings)?;
    info!(
        "Read {} video frames at {:.2} fps from {}",
        frames.len(),
        fps,
        path.display()
    );

    if settings.force_static {
        let first = frames.into_iter().next().ok_or_else(|| {
            LipSyncError::Input("no frames could be read from the input face file".to_string())
        })?;
        return Ok((FrameSource::Static(first), settings.fps));
    }

    Ok((FrameSource::Video(frames), fps))
}

fn probe_fps(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=r_frame_rate",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        return Err(LipSyncError::Input(format!(
            "could not probe video {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let fps_str = String::from_utf8_lossy(&output.stdout);
    let parts: Vec<&str> = fps_str.trim().split('/').collect();
    if parts.len() != 2 {
        return Err(LipSyncError::Input(format!(
            "failed to parse video fps: {}",
            fps_str
        )));
    }
    let numerator: f64 = parts[0]
        .parse()
        .map_err(|_| LipSyncError::Input(format!("failed to parse fps numerator: {}", parts[0])))?;
    let denominator: f64 = parts[1]
        .parse()
        .map_err(|_| LipSyncError::Input(format!("failed to parse fps denominator: {}", parts[1])))?;
    if denominator == 0.0 {
        return Err(LipSyncError::Input("zero fps denominator".to_string()));
    }
    Ok(numerator / denominator)
}

fn probe_resolution(path: &Path) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=s=x:p=0",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        return Err(LipSyncError::Input(format!(
            "could not probe video {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let resolution = String::from_utf8_lossy(&output.stdout);
    let parts: Vec<&str> = resolution.trim().split('x').collect();
    if parts.len() != 2 {
        return Err(LipSyncError::Input(format!(
            "failed to parse video resolution: {}",
            resolution
        )));
    }
    let width = parts[0]
        .parse()
        .map_err(|_| LipSyncError::Input(format!("failed to parse width: {}", parts[0])))?;
    let height = parts[1]
        .parse()
        .map_err(|_| LipSyncError::Input(format!("failed to parse height: {}", parts[1])))?;
    Ok((width, height))
}

fn decode_video_frames(
    path: &Path,
    width: u32,
    height: u32,
    settings: &Settings,
) -> Result<Vec<RgbImage>> {
    let mut child = Command::new("ffmpeg")
        .args(["-v", "error", "-i"])
        .arg(path)
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let frame_bytes = (width * height * 3) as usize;
    let mut frames = Vec::new();
    {
        let stdout = child
            .stdout
            .as_mut()
            .ok_or_else(|| LipSyncError::Runtime("decoder stdout was not captured".to_string()))?;
        let mut buf = vec![0u8; frame_bytes];
        loop {
            match read_exact_or_eof(stdout, &mut buf)? {
                0 => break,
                n if n == frame_bytes => {
                    let img = RgbImage::from_raw(width, height, buf.clone()).ok_or_else(|| {
                        LipSyncError::Data("decoded frame does not fit its dimensions".to_string())
                    })?;
                    frames.push(preprocess_frame(img, settings));
                }
                n => {
                    debug!("Dropping trailing partial frame of {} bytes", n);
                    break;
                }
            }
        }
    }

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(LipSyncError::Input(format!(
            "could not decode video {}: {}",
            path.display(),
            stderr.trim()
        )));
    }

    if frames.is_empty() {
        return Err(LipSyncError::Input(
            "no frames could be read from the input face file".to_string(),
        ));
    }
    Ok(frames)
}

/// Read exactly `buf.len()` bytes, or fewer at end of stream. Returns the
/// number of bytes read.
fn read_exact_or_eof(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Downscale, rotate and crop one decoded frame per the settings.
fn preprocess_frame(mut img: RgbImage, settings: &Settings) -> RgbImage {
    if settings.resize_factor > 1 {
        let w = (img.width() / settings.resize_factor).max(1);
        let h = (img.height() / settings.resize_factor).max(1);
        img = imageops::resize(&img, w, h, FilterType::Triangle);
    }
    if settings.rotate {
        img = imageops::rotate90(&img);
    }
    if let Some(region) = settings.crop {
        img = crop_frame(&img, region);
    }
    img
}

fn crop_frame(img: &RgbImage, region: Region) -> RgbImage {
    let x1 = region.x1.min(img.width());
    let y1 = region.y1.min(img.height());
    let x2 = region.x2.min(img.width());
    let y2 = region.y2.min(img.height());
    if x2 <= x1 || y2 <= y1 {
        return img.clone();
    }
    imageops::crop_imm(img, x1, y1, x2 - x1, y2 - y1).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    #[test]
    fn image_extensions_are_static() {
        let settings = Settings::default();
        assert!(is_static_input(Path::new("face.PNG"), &settings));
        assert!(is_static_input(Path::new("face.jpg"), &settings));
        assert!(!is_static_input(Path::new("face.mp4"), &settings));

        let forced = Settings {
            force_static: true,
            ..Settings::default()
        };
        assert!(is_static_input(Path::new("face.mp4"), &forced));
    }

    #[test]
    fn static_image_loads_with_configured_fps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("face.png");
        RgbImage::from_pixel(16, 16, Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let settings = Settings {
            fps: 30.0,
            ..Settings::default()
        };
        let (source, fps) = load_face_source(&path, &settings).unwrap();
        assert_eq!(fps, 30.0);
        assert!(source.is_static());
    }

    #[test]
    fn unreadable_image_is_an_input_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();

        assert!(matches!(
            load_face_source(&path, &Settings::default()),
            Err(LipSyncError::Input(_))
        ));
    }

    #[test]
    fn preprocess_applies_resize_rotate_crop() {
        let img = RgbImage::from_fn(8, 4, |x, _| Rgb([x as u8, 0, 0]));

        let resized = preprocess_frame(
            img.clone(),
            &Settings {
                resize_factor: 2,
                ..Settings::default()
            },
        );
        assert_eq!(resized.dimensions(), (4, 2));

        let rotated = preprocess_frame(
            img.clone(),
            &Settings {
                rotate: true,
                ..Settings::default()
            },
        );
        assert_eq!(rotated.dimensions(), (4, 8));

        let cropped = preprocess_frame(
            img,
            &Settings {
                crop: Some(Region {
                    x1: 2,
                    y1: 1,
                    x2: 6,
                    y2: 3,
                }),
                ..Settings::default()
            },
        );
        assert_eq!(cropped.dimensions(), (4, 2));
        assert_eq!(cropped.get_pixel(0, 0)[0], 2);
    }
}
