// Copyright Braid Project Contributors - SPDX Identifier: Apache-2.0

//! Payload compression for the transport packet pipeline.
//!
//! Every transport handle owns a [`Compressor`]. Configuring it picks one of
//! the models in the process-wide table; the chosen back-end is loaded lazily
//! and shared, refcounted, between all handles that use it. On the send path
//! the pipeline calls [`Compressor::compress`] for payloads above the
//! configured threshold and tags the packet with the producing model's wire
//! id; on the receive path it hands the tag and payload to
//! [`Compressor::decompress`], which validates the id against the table
//! before touching the data. Wire ids are append-only: a codec that is
//! compiled out keeps its row (and id) as a non-selectable placeholder.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use logger_core::{log_debug, log_warn};
use thiserror::Error;

use crate::MAX_PACKET_SIZE;

mod backends;
mod registry;

use registry::{CompressRegistry, HandleId};

/// Effective threshold when a configuration asks for `threshold = 0`.
pub const DEFAULT_COMPRESS_THRESHOLD: u32 = 100;

/// Upper bound on the number of rows the model table may carry.
pub const MAX_COMPRESS_METHODS: usize = 255;

/// Errors surfaced by the compression subsystem.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompressionError {
    /// Unknown model name, non-built-in selection, unsupported level,
    /// threshold above the maximum packet size, or a received wire id that
    /// does not resolve to a usable row.
    #[error("invalid compression argument: {0}")]
    InvalidArgument(String),
    /// The back-end could not be loaded into the process.
    #[error("compression model `{model}` failed to load: {reason}")]
    LoadFailure { model: &'static str, reason: String },
    /// The back-end loaded but its per-handle initialization failed.
    #[error("compression model `{model}` failed to initialize: {reason}")]
    InitFailure { model: &'static str, reason: String },
    /// A decompress-path load was refused because another load failed within
    /// the backoff window. The peer's packet may be retried later.
    #[error("compression library load attempted too soon after a failure")]
    RateLimited,
    /// The registry lock is unusable; the operation failed but the process
    /// can continue.
    #[error("compression registry lock failure")]
    LockFailure,
    /// The codec rejected the buffer. The reason is the codec's own
    /// diagnostic, passed through untranslated.
    #[error("compression model `{model}` reported an error: {reason}")]
    Codec { model: &'static str, reason: String },
}

impl CompressionError {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> CompressionError {
        CompressionError::InvalidArgument(reason.into())
    }

    pub(crate) fn codec(model: &'static str, reason: impl ToString) -> CompressionError {
        CompressionError::Codec {
            model,
            reason: reason.to_string(),
        }
    }

    /// The model involved, for errors that are attributable to one.
    pub fn model(&self) -> Option<&'static str> {
        match self {
            CompressionError::LoadFailure { model, .. }
            | CompressionError::InitFailure { model, .. }
            | CompressionError::Codec { model, .. } => Some(model),
            _ => None,
        }
    }
}

/// The compression models the wire protocol knows about. The discriminants
/// are the 1-byte wire ids and are allocated append-only; `255` is reserved
/// and never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionModel {
    None = 0,
    Zlib = 1,
    Lz4 = 2,
    Lz4hc = 3,
    Lzo2 = 4,
    Lzma = 5,
    Bzip2 = 6,
    Zstd = 7,
}

impl CompressionModel {
    pub fn model_id(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompressionModel::None => "none",
            CompressionModel::Zlib => "zlib",
            CompressionModel::Lz4 => "lz4",
            CompressionModel::Lz4hc => "lz4hc",
            CompressionModel::Lzo2 => "lzo2",
            CompressionModel::Lzma => "lzma",
            CompressionModel::Bzip2 => "bzip2",
            CompressionModel::Zstd => "zstd",
        }
    }

    pub fn from_model_id(model_id: u8) -> Option<CompressionModel> {
        match model_id {
            0 => Some(CompressionModel::None),
            1 => Some(CompressionModel::Zlib),
            2 => Some(CompressionModel::Lz4),
            3 => Some(CompressionModel::Lz4hc),
            4 => Some(CompressionModel::Lzo2),
            5 => Some(CompressionModel::Lzma),
            6 => Some(CompressionModel::Bzip2),
            7 => Some(CompressionModel::Zstd),
            _ => None,
        }
    }

    /// Whether this build carries the codec. Placeholder rows keep the wire
    /// id stable but can never be selected.
    pub fn built_in(&self) -> bool {
        registry::BUILTIN_MODELS
            .iter()
            .any(|desc| desc.model_id == self.model_id() && desc.built_in)
    }
}

impl fmt::Display for CompressionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CompressionModel {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<CompressionModel, CompressionError> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CompressionModel::None),
            "zlib" => Ok(CompressionModel::Zlib),
            "lz4" => Ok(CompressionModel::Lz4),
            "lz4hc" => Ok(CompressionModel::Lz4hc),
            "lzo2" => Ok(CompressionModel::Lzo2),
            "lzma" => Ok(CompressionModel::Lzma),
            "bzip2" => Ok(CompressionModel::Bzip2),
            "zstd" => Ok(CompressionModel::Zstd),
            _ => Err(CompressionError::invalid_argument(format!(
                "unknown compression model `{s}`"
            ))),
        }
    }
}

/// One row of the model table, as reported by [`models`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: &'static str,
    pub model_id: u8,
    pub built_in: bool,
}

/// The full model table in wire-id order, including placeholder rows, so
/// operators and bindings can discover what this build supports.
pub fn models() -> Vec<ModelInfo> {
    registry::BUILTIN_MODELS
        .iter()
        .map(|desc| ModelInfo {
            name: desc.name,
            model_id: desc.model_id,
            built_in: desc.built_in,
        })
        .collect()
}

/// Compression settings applied to a transport handle in a single call.
///
/// `model` is a table name ("none" disables compression), `level` is
/// codec-specific and validated by the back-end, and `threshold` is the
/// payload size in bytes above which the pipeline should compress; `0`
/// selects [`DEFAULT_COMPRESS_THRESHOLD`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionConfig {
    pub model: String,
    pub level: i32,
    pub threshold: u32,
}

impl Default for CompressionConfig {
    fn default() -> CompressionConfig {
        CompressionConfig {
            model: "none".to_string(),
            level: 0,
            threshold: 0,
        }
    }
}

/// Per-handle face of the compression subsystem.
///
/// A `Compressor` starts with compression disabled. [`configure`] selects and
/// validates a model; [`compress`] and [`decompress`] run the transforms with
/// the registry lock held so the back-end stays loaded for the duration.
/// Entry points may be called concurrently from any of the handle's threads.
/// Dropping the compressor releases every back-end charge the handle made.
///
/// [`configure`]: Compressor::configure
/// [`compress`]: Compressor::compress
/// [`decompress`]: Compressor::decompress
pub struct Compressor {
    registry: Arc<CompressRegistry>,
    handle: HandleId,
    model_id: u8,
    level: i32,
    threshold: u32,
}

impl Compressor {
    pub fn new() -> Compressor {
        Compressor::with_registry(registry::global())
    }

    pub(crate) fn with_registry(registry: Arc<CompressRegistry>) -> Compressor {
        Compressor {
            registry,
            handle: HandleId::next(),
            model_id: 0,
            level: 0,
            threshold: 0,
        }
    }

    /// Applies `config` to this handle.
    ///
    /// The chosen back-end is loaded and charged before the level and
    /// threshold are validated, so a rejected configuration releases exactly
    /// the charge it made and leaves the previous settings in place.
    pub fn configure(&mut self, config: &CompressionConfig) -> Result<(), CompressionError> {
        let Some(desc) = self.registry.descriptor_by_name(&config.model) else {
            log_warn(
                "compression",
                format!("rejecting unknown compression model `{}`", config.model),
            );
            return Err(CompressionError::invalid_argument(format!(
                "unknown compression model `{}`",
                config.model
            )));
        };

        if desc.model_id == 0 {
            self.model_id = 0;
            self.level = 0;
            self.threshold = 0;
            log_debug("compression", "compression disabled for handle");
            return Ok(());
        }

        if !desc.built_in {
            log_warn(
                "compression",
                format!(
                    "compression model `{}` (id {}) is not built in this build and cannot be selected",
                    desc.name, desc.model_id
                ),
            );
            return Err(CompressionError::invalid_argument(format!(
                "compression model `{}` is not built in",
                desc.name
            )));
        }

        let guard = self
            .registry
            .ensure_ready(self.handle, desc.model_id, false)?;

        if let Err(err) = guard.ops().val_level(config.level) {
            log_warn(
                "compression",
                format!(
                    "rejecting compression level {} for model `{}`: {err}",
                    config.level, desc.name
                ),
            );
            self.registry.release_charge(guard);
            return Err(err);
        }

        let threshold = if config.threshold == 0 {
            log_debug(
                "compression",
                format!(
                    "no compression threshold given for model `{}`: using default {DEFAULT_COMPRESS_THRESHOLD}",
                    desc.name
                ),
            );
            DEFAULT_COMPRESS_THRESHOLD
        } else if config.threshold as usize > MAX_PACKET_SIZE {
            log_warn(
                "compression",
                format!(
                    "rejecting compression threshold {} for model `{}`: larger than the maximum packet size {MAX_PACKET_SIZE}",
                    config.threshold, desc.name
                ),
            );
            self.registry.release_charge(guard);
            return Err(CompressionError::invalid_argument(format!(
                "compression threshold {} exceeds the maximum packet size",
                config.threshold
            )));
        } else {
            config.threshold
        };

        self.model_id = desc.model_id;
        self.level = config.level;
        self.threshold = threshold;
        Ok(())
    }

    /// Whether the packet pipeline should compress a payload of `len` bytes.
    /// The dispatcher itself does not enforce the threshold; callers skip
    /// [`Compressor::compress`] entirely for small payloads.
    pub fn should_compress(&self, len: usize) -> bool {
        self.model_id != 0 && len > self.threshold as usize
    }

    pub fn is_enabled(&self) -> bool {
        self.model_id != 0
    }

    /// Wire id the pipeline tags outgoing compressed packets with.
    pub fn model_id(&self) -> u8 {
        self.model_id
    }

    pub fn model(&self) -> CompressionModel {
        CompressionModel::from_model_id(self.model_id)
            .expect("a configured model always has a wire id")
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Effective threshold in bytes.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Send path: compresses `src` with the configured model. Codec failures
    /// are returned untranslated.
    pub fn compress(&self, src: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if self.model_id == 0 {
            return Err(CompressionError::invalid_argument(
                "handle has no compression model configured",
            ));
        }
        let guard = self.registry.ensure_ready(self.handle, self.model_id, false)?;
        let result = guard.ops().compress(src, self.level, guard.session());
        drop(guard);
        result
    }

    /// Receive path: decompresses `src`, which the sender tagged with
    /// `model_id`. The id is validated against the table before any back-end
    /// is consulted, and a load triggered from here is rate-limited so
    /// crafted packets cannot force repeated load attempts. Output is bounded
    /// by the maximum packet size regardless of what the input claims.
    pub fn decompress(&self, model_id: u8, src: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if model_id == 0 || model_id > self.registry.max_model() {
            log_warn(
                "compression",
                format!("received packet with unknown compression model id {model_id}"),
            );
            return Err(CompressionError::invalid_argument(format!(
                "unknown compression model id {model_id}"
            )));
        }
        let Some(desc) = self.registry.descriptor(model_id) else {
            log_warn(
                "compression",
                format!("received packet with unknown compression model id {model_id}"),
            );
            return Err(CompressionError::invalid_argument(format!(
                "unknown compression model id {model_id}"
            )));
        };
        if !desc.built_in {
            log_warn(
                "compression",
                format!(
                    "received packet compressed with model `{}` (id {model_id}) which is not built in this build",
                    desc.name
                ),
            );
            return Err(CompressionError::invalid_argument(format!(
                "compression model `{}` is not built in",
                desc.name
            )));
        }

        let guard = self.registry.ensure_ready(self.handle, model_id, true)?;
        let result = guard
            .ops()
            .decompress(src, MAX_PACKET_SIZE, guard.session());
        drop(guard);
        result
    }
}

impl Default for Compressor {
    fn default() -> Compressor {
        Compressor::new()
    }
}

impl Drop for Compressor {
    fn drop(&mut self) {
        self.registry.release_handle(self.handle);
    }
}
