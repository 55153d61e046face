use std::io::{Cursor, Write};

use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{
    error::AppError,
    gemini::decode_payload,
    models::{NamedImage, StoryboardResult},
};

fn archive_err(e: impl std::fmt::Display) -> AppError {
    AppError::Archive(e.to_string())
}

/// Zip with one Markdown summary at the root and every image under `folder/`.
pub fn build_archive(summary_name: &str, summary: &str, folder: &str, images: &[NamedImage]) -> Result<Vec<u8>, AppError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(summary_name, options).map_err(archive_err)?;
    zip.write_all(summary.as_bytes()).map_err(archive_err)?;

    zip.add_directory(format!("{}/", folder), options).map_err(archive_err)?;
    for named in images {
        let bytes = decode_payload(&named.image.image_data)
            .map_err(|e| AppError::Archive(format!("{}: {}", named.filename, e)))?;
        zip.start_file(format!("{}/{}", folder, named.filename), options).map_err(archive_err)?;
        zip.write_all(&bytes).map_err(archive_err)?;
    }

    Ok(zip.finish().map_err(archive_err)?.into_inner())
}

pub fn storyboard_archive(result: &StoryboardResult) -> Result<Vec<u8>, AppError> {
    build_archive("story_summary.md", &result.summary, "scenes", &result.scenes)
}

pub fn live_archive(images: &[NamedImage], summary: &str) -> Result<Vec<u8>, AppError> {
    build_archive("summary.md", summary, "images", images)
}
