use std::{io::Cursor, path::Path, sync::Arc};

use image::{codecs::jpeg::JpegEncoder, imageops::FilterType};
use shared::{domain::MediaKind, protocol::AttachmentRecord};
use tracing::debug;

use crate::{api::RoomApi, error::ApiFailure, error::AttachmentError};

/// Compressed image payloads must land under this ceiling before upload.
pub const IMAGE_PAYLOAD_CEILING: u64 = 1024 * 1024;
/// Raw image inputs larger than this are rejected before decoding.
pub const IMAGE_SOURCE_LIMIT: u64 = 25 * 1024 * 1024;
/// Non-image files pass through unchanged under this bound.
pub const DOCUMENT_LIMIT: u64 = 10 * 1024 * 1024;

/// (longest edge, JPEG quality) rungs walked until the payload fits.
const COMPRESSION_LADDER: &[(u32, u8)] = &[(1600, 78), (1280, 70), (1024, 60), (800, 50)];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "txt"];

/// A file as picked on the compose surface, before any processing.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// A validated, size-bounded payload ready for upload.
#[derive(Debug, Clone)]
pub struct PreparedAttachment {
    pub filename: String,
    pub media_kind: MediaKind,
    pub bytes: Vec<u8>,
}

/// Validates and compresses attachments, then uploads them to storage.
/// Preparation happens entirely before any network call; upload completes
/// before the owning message is composed.
pub struct AttachmentPipeline {
    api: Arc<RoomApi>,
}

impl AttachmentPipeline {
    pub fn new(api: Arc<RoomApi>) -> Self {
        Self { api }
    }

    pub fn prepare(&self, file: LocalFile) -> Result<PreparedAttachment, AttachmentError> {
        let media_kind = media_kind_for(&file.filename)?;
        let size = file.bytes.len() as u64;

        match media_kind {
            MediaKind::Document => {
                if size > DOCUMENT_LIMIT {
                    return Err(AttachmentError::TooLarge {
                        size,
                        limit: DOCUMENT_LIMIT,
                    });
                }
                Ok(PreparedAttachment {
                    filename: file.filename,
                    media_kind,
                    bytes: file.bytes,
                })
            }
            MediaKind::Image => {
                if size > IMAGE_SOURCE_LIMIT {
                    return Err(AttachmentError::TooLarge {
                        size,
                        limit: IMAGE_SOURCE_LIMIT,
                    });
                }
                let img = image::load_from_memory(&file.bytes)
                    .map_err(|_| AttachmentError::InvalidImage)?;
                let longest_edge = img.width().max(img.height());
                if size <= IMAGE_PAYLOAD_CEILING && longest_edge <= COMPRESSION_LADDER[0].0 {
                    return Ok(PreparedAttachment {
                        filename: file.filename,
                        media_kind,
                        bytes: file.bytes,
                    });
                }

                let compressed = compress_image(&img, size)?;
                debug!(
                    filename = %file.filename,
                    input_bytes = size,
                    output_bytes = compressed.len(),
                    "attachments: image recompressed"
                );
                Ok(PreparedAttachment {
                    filename: jpeg_filename(&file.filename),
                    media_kind,
                    bytes: compressed,
                })
            }
        }
    }

    pub async fn upload(&self, prepared: PreparedAttachment) -> Result<AttachmentRecord, ApiFailure> {
        let byte_size = prepared.bytes.len() as u64;
        let response = self
            .api
            .upload_attachment(&prepared.filename, prepared.bytes)
            .await?;
        Ok(AttachmentRecord {
            id: response.id,
            filename: prepared.filename,
            media_kind: prepared.media_kind,
            byte_size,
            storage_url: response.url,
            origin_message_id: None,
        })
    }
}

fn media_kind_for(filename: &str) -> Result<MediaKind, AttachmentError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        Ok(MediaKind::Image)
    } else if DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
        Ok(MediaKind::Document)
    } else {
        Err(AttachmentError::UnsupportedType {
            filename: filename.to_string(),
        })
    }
}

fn compress_image(img: &image::DynamicImage, input_size: u64) -> Result<Vec<u8>, AttachmentError> {
    for (edge, quality) in COMPRESSION_LADDER {
        let resized = if img.width().max(img.height()) > *edge {
            img.resize(*edge, *edge, FilterType::Triangle)
        } else {
            img.clone()
        };
        let rgb = resized.to_rgb8();
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), *quality);
        if rgb.write_with_encoder(encoder).is_err() {
            continue;
        }
        if out.len() as u64 <= IMAGE_PAYLOAD_CEILING {
            return Ok(out);
        }
    }
    Err(AttachmentError::TooLarge {
        size: input_size,
        limit: IMAGE_PAYLOAD_CEILING,
    })
}

fn jpeg_filename(original: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("attachment");
    format!("{stem}.jpg")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_pixel(x: u32, y: u32) -> u8 {
        let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA6B);
        h ^= h >> 13;
        h = h.wrapping_mul(0xC2B2_AE35);
        (h ^ (h >> 16)) as u8
    }

    fn large_jpeg() -> Vec<u8> {
        let img = image::RgbImage::from_fn(2800, 2100, |x, y| {
            image::Rgb([
                noise_pixel(x, y),
                noise_pixel(x.wrapping_add(7), y),
                noise_pixel(x, y.wrapping_add(13)),
            ])
        });
        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), 95);
        img.write_with_encoder(encoder).expect("encode source");
        out
    }

    #[test]
    fn classifies_media_by_extension() {
        assert_eq!(media_kind_for("photo.JPG"), Ok(MediaKind::Image));
        assert_eq!(media_kind_for("notes.pdf"), Ok(MediaKind::Document));
        assert_eq!(
            media_kind_for("payload.exe"),
            Err(AttachmentError::UnsupportedType {
                filename: "payload.exe".to_string(),
            })
        );
        assert_eq!(
            media_kind_for("no_extension"),
            Err(AttachmentError::UnsupportedType {
                filename: "no_extension".to_string(),
            })
        );
    }

    #[test]
    fn rejects_oversized_documents_before_upload() {
        let api = Arc::new(crate::test_support::loopback_api());
        let pipeline = AttachmentPipeline::new(api);
        let err = pipeline
            .prepare(LocalFile {
                filename: "dump.pdf".to_string(),
                bytes: vec![0u8; (DOCUMENT_LIMIT + 1) as usize],
            })
            .expect_err("must reject");
        assert!(matches!(err, AttachmentError::TooLarge { .. }));
    }

    #[test]
    fn rejects_undecodable_images() {
        let api = Arc::new(crate::test_support::loopback_api());
        let pipeline = AttachmentPipeline::new(api);
        let err = pipeline
            .prepare(LocalFile {
                filename: "broken.png".to_string(),
                bytes: vec![1, 2, 3, 4],
            })
            .expect_err("must reject");
        assert_eq!(err, AttachmentError::InvalidImage);
    }

    #[test]
    fn large_images_are_compressed_under_the_ceiling_and_stay_decodable() {
        let source = large_jpeg();
        assert!(
            source.len() as u64 > IMAGE_PAYLOAD_CEILING,
            "source must exceed the ceiling to exercise compression"
        );

        let api = Arc::new(crate::test_support::loopback_api());
        let pipeline = AttachmentPipeline::new(api);
        let prepared = pipeline
            .prepare(LocalFile {
                filename: "group-photo.jpeg".to_string(),
                bytes: source,
            })
            .expect("prepare");

        assert!(prepared.bytes.len() as u64 <= IMAGE_PAYLOAD_CEILING);
        assert_eq!(prepared.filename, "group-photo.jpg");
        let decoded = image::load_from_memory(&prepared.bytes).expect("output decodes");
        assert!(decoded.width().max(decoded.height()) <= COMPRESSION_LADDER[0].0);
    }

    #[test]
    fn small_images_pass_through_unchanged() {
        let img = image::RgbImage::from_fn(64, 48, |x, y| {
            image::Rgb([noise_pixel(x, y), 0, 0])
        });
        let mut bytes = Vec::new();
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), 80);
        img.write_with_encoder(encoder).expect("encode");

        let api = Arc::new(crate::test_support::loopback_api());
        let pipeline = AttachmentPipeline::new(api);
        let prepared = pipeline
            .prepare(LocalFile {
                filename: "icon.jpg".to_string(),
                bytes: bytes.clone(),
            })
            .expect("prepare");
        assert_eq!(prepared.bytes, bytes);
        assert_eq!(prepared.filename, "icon.jpg");
    }
}
