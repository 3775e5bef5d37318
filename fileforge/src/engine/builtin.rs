//! Built-in engine for byte-level conversions.
//!
//! All work runs on the blocking pool; inputs are bounded by the request
//! body limit so everything is done in memory.

use std::io::{Cursor, Read, Write};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::{ConversionEngine, ConvertedFile, EngineRequest};
use crate::utils::filename::sanitize_filename;
use crate::{Error, Result};

const GZIP: &str = "gzip";
const GUNZIP: &str = "gunzip";
const ZIP: &str = "zip";
const BASE64_ENCODE: &str = "base64-encode";
const BASE64_DECODE: &str = "base64-decode";
const SHA256: &str = "sha256";
const SPLIT: &str = "split";

/// Upper bound on outputs from a single split.
const MAX_SPLIT_PARTS: u64 = 1000;

fn default_compression_level() -> u8 {
    6
}

/// Options understood by the built-in conversions. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuiltinOptions {
    /// Compression level (0-9) for gzip and zip.
    #[serde(default = "default_compression_level")]
    level: u8,
    /// Number of equal parts for split.
    #[serde(default)]
    parts: Option<u64>,
    /// Part size in bytes for split. Takes precedence over `parts`.
    #[serde(default)]
    chunk_size: Option<u64>,
}

impl Default for BuiltinOptions {
    fn default() -> Self {
        Self {
            level: default_compression_level(),
            parts: None,
            chunk_size: None,
        }
    }
}

impl BuiltinOptions {
    fn parse(options: Option<&serde_json::Value>) -> Result<Self> {
        let options = match options {
            None | Some(serde_json::Value::Null) => Self::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::conversion(format!("Invalid conversion options: {}", e)))?,
        };
        if options.level > 9 {
            return Err(Error::conversion(format!(
                "Invalid compression level {}: must be between 0 and 9",
                options.level
            )));
        }
        Ok(options)
    }
}

/// Engine backed by flate2, zip, base64 and sha2.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngine;

impl BuiltinEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConversionEngine for BuiltinEngine {
    fn conversion_types(&self) -> Vec<&'static str> {
        vec![GZIP, GUNZIP, ZIP, BASE64_ENCODE, BASE64_DECODE, SHA256, SPLIT]
    }

    async fn convert(&self, request: EngineRequest) -> Result<Vec<ConvertedFile>> {
        if !self.supports(&request.conversion_type) {
            return Err(Error::conversion(format!(
                "Unsupported conversion type: {}",
                request.conversion_type
            )));
        }

        debug!(
            conversion_type = %request.conversion_type,
            input_bytes = request.data.len(),
            "Running built-in conversion"
        );

        match tokio::task::spawn_blocking(move || convert_blocking(&request)).await {
            Ok(result) => result,
            // Let the caller's supervisor observe the panic.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::conversion(format!("Conversion was cancelled: {}", e))),
        }
    }
}

fn convert_blocking(request: &EngineRequest) -> Result<Vec<ConvertedFile>> {
    let options = BuiltinOptions::parse(request.options.as_ref())?;
    let data = &request.data;

    let file = match request.conversion_type.as_str() {
        GZIP => ConvertedFile::new(gzip(data, options.level)?, "gz"),
        GUNZIP => ConvertedFile::new(gunzip(data)?, ""),
        ZIP => ConvertedFile::new(zip_single(&request.source_name, data, options.level)?, "zip"),
        BASE64_ENCODE => ConvertedFile::new(STANDARD.encode(data).into_bytes(), "b64"),
        BASE64_DECODE => ConvertedFile::new(base64_decode(data)?, ""),
        SHA256 => ConvertedFile::new(sha256_line(&request.source_name, data), "sha256"),
        SPLIT => {
            let extension = request.input_extension.clone().unwrap_or_default();
            return Ok(split(data, &options)?
                .into_iter()
                .map(|part| ConvertedFile::new(part, extension.clone()))
                .collect());
        }
        other => {
            return Err(Error::conversion(format!(
                "Unsupported conversion type: {}",
                other
            )));
        }
    };
    Ok(vec![file])
}

fn gzip(data: &[u8], level: u8) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(u32::from(level)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::conversion(format!("Input is not valid gzip data: {}", e)))?;
    Ok(out)
}

fn zip_single(source_name: &str, data: &[u8], level: u8) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = if level == 0 {
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(i64::from(level)))
    };

    zip.start_file(sanitize_filename(source_name), options)
        .map_err(|e| Error::conversion(format!("Failed to create zip entry: {}", e)))?;
    zip.write_all(data)?;
    let cursor = zip
        .finish()
        .map_err(|e| Error::conversion(format!("Failed to finalize zip archive: {}", e)))?;
    Ok(cursor.into_inner())
}

fn base64_decode(data: &[u8]) -> Result<Vec<u8>> {
    let compact: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map_err(|e| Error::conversion(format!("Input is not valid base64: {}", e)))
}

/// `sha256sum`-compatible line.
fn sha256_line(source_name: &str, data: &[u8]) -> Vec<u8> {
    let digest = hex::encode(Sha256::digest(data));
    format!("{}  {}\n", digest, sanitize_filename(source_name)).into_bytes()
}

fn split(data: &[u8], options: &BuiltinOptions) -> Result<Vec<Vec<u8>>> {
    let chunk_size = match (options.chunk_size, options.parts) {
        (Some(0), _) => {
            return Err(Error::conversion("Invalid chunkSize: must be greater than 0"));
        }
        (Some(size), _) => size,
        (None, Some(parts)) if parts == 0 || parts > MAX_SPLIT_PARTS => {
            return Err(Error::conversion(format!(
                "Invalid parts {}: must be between 1 and {}",
                parts, MAX_SPLIT_PARTS
            )));
        }
        (None, Some(parts)) => (data.len() as u64).div_ceil(parts).max(1),
        (None, None) => {
            return Err(Error::conversion(
                "split requires a 'parts' or 'chunkSize' option",
            ));
        }
    };

    if data.is_empty() {
        return Ok(vec![Vec::new()]);
    }

    let chunk_size = usize::try_from(chunk_size).unwrap_or(usize::MAX);
    let count = data.len().div_ceil(chunk_size) as u64;
    if count > MAX_SPLIT_PARTS {
        return Err(Error::conversion(format!(
            "split would produce {} parts, limit is {}",
            count, MAX_SPLIT_PARTS
        )));
    }
    Ok(data.chunks(chunk_size).map(<[u8]>::to_vec).collect())
}
