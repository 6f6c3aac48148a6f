use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::Frame;

/// Encode one RGB8 frame as a baseline JPEG.
pub(crate) fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    frame.validate()?;
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(
            frame.pixels(),
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
    Ok(out)
}

/// Encode frames as a Motion-JPEG elementary stream: the JPEG images
/// concatenated in order. Frames whose size differs from the first frame are
/// skipped so the stream stays decodable at one resolution.
pub(crate) fn encode_mjpeg(frames: &[Frame], quality: u8) -> Result<Vec<u8>> {
    let Some(first) = frames.first() else {
        return Err(anyhow!("cannot encode an empty clip"));
    };
    let (width, height) = (first.width, first.height);
    let mut out = Vec::new();
    let mut written = 0usize;
    for frame in frames {
        if frame.width != width || frame.height != height {
            log::debug!(
                "clip frame at {:?} skipped: {}x{} differs from {}x{}",
                frame.timestamp,
                frame.width,
                frame.height,
                width,
                height
            );
            continue;
        }
        out.extend_from_slice(&encode_jpeg(frame, quality)?);
        written += 1;
    }
    if written == 0 {
        return Err(anyhow!("no encodable frames in clip"));
    }
    Ok(out)
}
