//! Bit-level recovery of parameters hidden in pixel low bits.
//!
//! When text chunks are stripped, generated images still carry their
//! metadata in the least significant bits of the pixel data: a 15-byte ASCII
//! signature, a 32-bit big-endian payload length in bits, then the payload
//! itself, either gzip-compressed or raw UTF-8. The alpha channel carries
//! the stream when the image has one; otherwise the red/green/blue low bits
//! do, three per pixel. Pixels are scanned column by column, and bits fill
//! each byte most-significant-first.
use std::io::Read;

use flate2::read::GzDecoder;
use image::DynamicImage;

use crate::error::{AppError, AppResult};

pub(crate) const SIGNATURE_LEN: usize = 15;
pub(crate) const ALPHA_COMPRESSED: &[u8] = b"stealth_pngcomp";
pub(crate) const ALPHA_PLAIN: &[u8] = b"stealth_pnginfo";
pub(crate) const RGB_COMPRESSED: &[u8] = b"stealth_rgbcomp";
pub(crate) const RGB_PLAIN: &[u8] = b"stealth_rgbinfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingSignature,
    ReadingParamLen,
    ReadingData,
    ReadingEnd,
}

/// Accumulates single bits into bytes, MSB first. Partial bits are buffered
/// across pixel iterations until the byte completes.
#[derive(Default)]
struct BitAccumulator {
    bytes: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitAccumulator {
    fn push(&mut self, bit: u8) {
        self.current = (self.current << 1) | (bit & 1);
        self.filled += 1;
        if self.filled == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.filled = 0;
        }
    }

    fn reset(&mut self, expect: usize) {
        self.bytes = Vec::with_capacity(expect);
        self.current = 0;
        self.filled = 0;
    }
}

/// Extract the hidden text payload from a decoded image.
///
/// Returns an empty string when no valid signature is present; a payload
/// that fails to decompress or decode is an error.
pub fn extract_text(img: &DynamicImage) -> AppResult<String> {
    let has_alpha = img.color().has_alpha();
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    let (compressed_signature, plain_signature) = if has_alpha {
        (ALPHA_COMPRESSED, ALPHA_PLAIN)
    } else {
        (RGB_COMPRESSED, RGB_PLAIN)
    };

    let mut acc = BitAccumulator::default();
    let mut state = State::ReadingSignature;
    let mut compressed = false;
    let mut payload_len = 0usize;

    'scan: for x in 0..width {
        for y in 0..height {
            let pixel = rgba.get_pixel(x, y);
            let channels: &[u8] = if has_alpha {
                &pixel.0[3..4]
            } else {
                &pixel.0[0..3]
            };
            for &channel in channels {
                acc.push(channel & 1);
                match state {
                    State::ReadingSignature => {
                        if acc.bytes.len() == SIGNATURE_LEN {
                            if acc.bytes == compressed_signature {
                                compressed = true;
                            } else if acc.bytes == plain_signature {
                                compressed = false;
                            } else {
                                return Ok(String::new());
                            }
                            state = State::ReadingParamLen;
                            acc.reset(4);
                        }
                    }
                    State::ReadingParamLen => {
                        if acc.bytes.len() == 4 {
                            let bit_count = u32::from_be_bytes([
                                acc.bytes[0],
                                acc.bytes[1],
                                acc.bytes[2],
                                acc.bytes[3],
                            ]);
                            payload_len = bit_count as usize / 8;
                            if payload_len == 0 {
                                return Ok(String::new());
                            }
                            state = State::ReadingData;
                            acc.reset(payload_len);
                        }
                    }
                    State::ReadingData => {
                        if acc.bytes.len() == payload_len {
                            state = State::ReadingEnd;
                            break 'scan;
                        }
                    }
                    State::ReadingEnd => break 'scan,
                }
            }
        }
    }

    if state != State::ReadingEnd {
        return Ok(String::new());
    }

    if compressed {
        let mut text = String::new();
        GzDecoder::new(acc.bytes.as_slice())
            .read_to_string(&mut text)
            .map_err(|e| AppError::Format(format!("bad compressed hidden payload: {e}")))?;
        Ok(text)
    } else {
        String::from_utf8(acc.bytes)
            .map_err(|_| AppError::Format("hidden payload is not UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Write;

    fn bit_stream(signature: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut bits = Vec::new();
        let mut push_bytes = |bytes: &[u8]| {
            for &byte in bytes {
                for shift in (0..8).rev() {
                    bits.push((byte >> shift) & 1);
                }
            }
        };
        push_bytes(signature);
        push_bytes(&((payload.len() as u32 * 8).to_be_bytes()));
        push_bytes(payload);
        bits
    }

    fn rgb_fixture(signature: &[u8], payload: &[u8]) -> DynamicImage {
        let bits = bit_stream(signature, payload);
        let mut img = RgbImage::from_pixel(64, 64, Rgb([120, 64, 200]));
        let mut i = 0;
        'write: for x in 0..64 {
            for y in 0..64 {
                let mut px = *img.get_pixel(x, y);
                for channel in 0..3 {
                    if i >= bits.len() {
                        img.put_pixel(x, y, px);
                        break 'write;
                    }
                    px.0[channel] = (px.0[channel] & !1) | bits[i];
                    i += 1;
                }
                img.put_pixel(x, y, px);
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    fn alpha_fixture(signature: &[u8], payload: &[u8]) -> DynamicImage {
        let bits = bit_stream(signature, payload);
        let mut img = RgbaImage::from_pixel(32, 32, Rgba([10, 20, 30, 255]));
        let mut i = 0;
        'write: for x in 0..32 {
            for y in 0..32 {
                if i >= bits.len() {
                    break 'write;
                }
                let mut px = *img.get_pixel(x, y);
                px.0[3] = (px.0[3] & !1) | bits[i];
                i += 1;
                img.put_pixel(x, y, px);
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn decodes_a_plain_payload_from_rgb_low_bits() {
        let img = rgb_fixture(RGB_PLAIN, b"Hello, hidden world");
        assert_eq!(extract_text(&img).unwrap(), "Hello, hidden world");
    }

    #[test]
    fn decodes_a_gzip_payload_from_rgb_low_bits() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"prompt\":\"castle\"}").unwrap();
        let compressed = encoder.finish().unwrap();
        let img = rgb_fixture(RGB_COMPRESSED, &compressed);
        assert_eq!(extract_text(&img).unwrap(), "{\"prompt\":\"castle\"}");
    }

    #[test]
    fn decodes_a_plain_payload_from_the_alpha_channel() {
        let img = alpha_fixture(ALPHA_PLAIN, b"alpha carried");
        assert_eq!(extract_text(&img).unwrap(), "alpha carried");
    }

    #[test]
    fn missing_signature_yields_an_empty_result() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([3, 7, 11])));
        assert_eq!(extract_text(&img).unwrap(), "");
    }

    #[test]
    fn alpha_signatures_do_not_match_on_the_rgb_track() {
        let img = rgb_fixture(ALPHA_PLAIN, b"wrong track");
        assert_eq!(extract_text(&img).unwrap(), "");
    }

    #[test]
    fn truncated_payload_yields_an_empty_result() {
        // Claims 4096 payload bits but the image runs out of pixels first.
        let bits = bit_stream(RGB_PLAIN, &[0u8; 512]);
        let mut img = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        let mut i = 0;
        'write: for x in 0..8 {
            for y in 0..8 {
                let mut px = *img.get_pixel(x, y);
                for channel in 0..3 {
                    if i >= bits.len() {
                        break 'write;
                    }
                    px.0[channel] = (px.0[channel] & !1) | bits[i];
                    i += 1;
                }
                img.put_pixel(x, y, px);
            }
        }
        let img = DynamicImage::ImageRgb8(img);
        assert_eq!(extract_text(&img).unwrap(), "");
    }
}
