//! Conversion engines.
//!
//! An engine turns the bytes of one input into one or more outputs. It knows
//! nothing about jobs, storage or retention; the orchestrator owns those.

mod builtin;

use async_trait::async_trait;

pub use builtin::BuiltinEngine;

use crate::Result;

/// Input handed to an engine.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Requested conversion (e.g. "gzip").
    pub conversion_type: String,
    /// Client-supplied name of the input.
    pub source_name: String,
    /// Lowercased extension of the input name, if it has one.
    pub input_extension: Option<String>,
    /// Raw input bytes.
    pub data: Vec<u8>,
    /// Conversion-specific options, passed through from the client.
    pub options: Option<serde_json::Value>,
}

/// One produced artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedFile {
    pub data: Vec<u8>,
    /// Extension without the dot. Empty keeps the source stem as-is.
    pub extension: String,
}

impl ConvertedFile {
    pub fn new(data: Vec<u8>, extension: impl Into<String>) -> Self {
        Self {
            data,
            extension: extension.into(),
        }
    }
}

/// Trait for conversion engines.
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    /// Conversion types this engine understands.
    fn conversion_types(&self) -> Vec<&'static str>;

    /// Check if this engine can handle a conversion type.
    fn supports(&self, conversion_type: &str) -> bool {
        self.conversion_types().contains(&conversion_type)
    }

    /// Run the conversion.
    ///
    /// Errors are reported to the client verbatim as the job's failure.
    async fn convert(&self, request: EngineRequest) -> Result<Vec<ConvertedFile>>;
}
