// Copyright Braid Project Contributors - SPDX Identifier: Apache-2.0

//! Codec back-ends behind the dispatcher. Every codec implements
//! [`CompressOps`]; the registry loads one instance per process and routes all
//! handles through it. Codecs compiled out by a cargo feature keep their wire
//! id through a placeholder row in the model table, so nothing here is
//! consulted for them.

use std::any::Any;

#[cfg(any(
    feature = "zlib",
    feature = "lzma",
    feature = "bzip2",
    feature = "zstd"
))]
use std::io::Read;

use super::CompressionError;

/// Opaque per-(handle, model) codec state, created by [`CompressOps::init`].
pub(crate) type SessionState = Box<dyn Any + Send + Sync>;

/// Operation set every back-end exposes to the dispatcher. Loading the
/// back-end is the job of the loader function in its model descriptor;
/// unloading is dropping the boxed value when the refcount reaches zero.
pub(crate) trait CompressOps: Send + Sync {
    /// Accept or reject a requested compression level.
    fn val_level(&self, level: i32) -> Result<(), CompressionError>;

    /// Whole-buffer compression of `src` at `level`.
    fn compress(
        &self,
        src: &[u8],
        level: i32,
        session: Option<&SessionState>,
    ) -> Result<Vec<u8>, CompressionError>;

    /// Whole-buffer decompression of `src`. `src` comes from the network, so
    /// implementations must never produce more than `max_out` bytes no matter
    /// what the input claims.
    fn decompress(
        &self,
        src: &[u8],
        max_out: usize,
        session: Option<&SessionState>,
    ) -> Result<Vec<u8>, CompressionError>;

    /// Codecs that keep per-handle state return true and implement `init` and
    /// `fini`; the registry then threads the state into the transforms.
    /// `init` runs under the registry write lock and at most once per handle.
    fn stateful(&self) -> bool {
        false
    }

    fn init(&self) -> Result<SessionState, CompressionError> {
        Ok(Box::new(()))
    }

    fn fini(&self, _state: SessionState) {}
}

/// Drains a decoding reader into a Vec, refusing output larger than
/// `max_out`. The one-past-the-limit read is what detects oversize without
/// trusting any length claimed by the (attacker-controlled) input.
#[cfg(any(
    feature = "zlib",
    feature = "lzma",
    feature = "bzip2",
    feature = "zstd"
))]
fn read_bounded(
    model: &'static str,
    reader: impl Read,
    max_out: usize,
) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    reader
        .take(max_out as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|err| CompressionError::codec(model, err))?;
    if out.len() > max_out {
        return Err(CompressionError::codec(
            model,
            "decompressed payload exceeds the maximum packet size",
        ));
    }
    Ok(out)
}

#[cfg(feature = "zlib")]
pub(crate) mod zlib_backend {
    use super::*;
    use flate2::Compression;
    use flate2::read::{ZlibDecoder, ZlibEncoder};

    const ZLIB_MIN_LEVEL: i32 = 0;
    const ZLIB_MAX_LEVEL: i32 = 9;

    pub(crate) fn load() -> Result<Box<dyn CompressOps>, CompressionError> {
        Ok(Box::new(ZlibOps))
    }

    struct ZlibOps;

    impl CompressOps for ZlibOps {
        fn val_level(&self, level: i32) -> Result<(), CompressionError> {
            if !(ZLIB_MIN_LEVEL..=ZLIB_MAX_LEVEL).contains(&level) {
                return Err(CompressionError::invalid_argument(format!(
                    "zlib compression level {level} is out of valid range {ZLIB_MIN_LEVEL}..={ZLIB_MAX_LEVEL}"
                )));
            }
            Ok(())
        }

        fn compress(
            &self,
            src: &[u8],
            level: i32,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            let mut out = Vec::new();
            ZlibEncoder::new(src, Compression::new(level as u32))
                .read_to_end(&mut out)
                .map_err(|err| CompressionError::codec("zlib", err))?;
            Ok(out)
        }

        fn decompress(
            &self,
            src: &[u8],
            max_out: usize,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            read_bounded("zlib", ZlibDecoder::new(src), max_out)
        }
    }
}

#[cfg(feature = "lz4")]
pub(crate) mod lz4_backend {
    use super::*;
    use lz4::block::{CompressionMode, compress, decompress};

    // The fast-mode level is an acceleration factor, not a ratio knob.
    const LZ4_MIN_ACCELERATION: i32 = 1;
    const LZ4_MAX_ACCELERATION: i32 = 65537;
    const LZ4HC_MIN_LEVEL: i32 = 1;
    const LZ4HC_MAX_LEVEL: i32 = 12;

    pub(crate) fn load() -> Result<Box<dyn CompressOps>, CompressionError> {
        Ok(Box::new(Lz4Ops))
    }

    pub(crate) fn load_hc() -> Result<Box<dyn CompressOps>, CompressionError> {
        Ok(Box::new(Lz4HcOps))
    }

    /// Both rows emit raw lz4 blocks, so either id on the wire decodes here.
    fn decompress_block(
        model: &'static str,
        src: &[u8],
        max_out: usize,
    ) -> Result<Vec<u8>, CompressionError> {
        decompress(src, Some(max_out as i32)).map_err(|err| CompressionError::codec(model, err))
    }

    struct Lz4Ops;

    impl CompressOps for Lz4Ops {
        fn val_level(&self, level: i32) -> Result<(), CompressionError> {
            if !(LZ4_MIN_ACCELERATION..=LZ4_MAX_ACCELERATION).contains(&level) {
                return Err(CompressionError::invalid_argument(format!(
                    "lz4 acceleration level {level} is out of valid range {LZ4_MIN_ACCELERATION}..={LZ4_MAX_ACCELERATION}"
                )));
            }
            Ok(())
        }

        fn compress(
            &self,
            src: &[u8],
            level: i32,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            compress(src, Some(CompressionMode::FAST(level)), false)
                .map_err(|err| CompressionError::codec("lz4", err))
        }

        fn decompress(
            &self,
            src: &[u8],
            max_out: usize,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            decompress_block("lz4", src, max_out)
        }
    }

    struct Lz4HcOps;

    impl CompressOps for Lz4HcOps {
        fn val_level(&self, level: i32) -> Result<(), CompressionError> {
            if !(LZ4HC_MIN_LEVEL..=LZ4HC_MAX_LEVEL).contains(&level) {
                return Err(CompressionError::invalid_argument(format!(
                    "lz4hc compression level {level} is out of valid range {LZ4HC_MIN_LEVEL}..={LZ4HC_MAX_LEVEL}"
                )));
            }
            Ok(())
        }

        fn compress(
            &self,
            src: &[u8],
            level: i32,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            compress(src, Some(CompressionMode::HIGHCOMPRESSION(level)), false)
                .map_err(|err| CompressionError::codec("lz4hc", err))
        }

        fn decompress(
            &self,
            src: &[u8],
            max_out: usize,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            decompress_block("lz4hc", src, max_out)
        }
    }
}

#[cfg(feature = "lzma")]
pub(crate) mod lzma_backend {
    use super::*;
    use xz2::read::{XzDecoder, XzEncoder};

    const LZMA_MIN_PRESET: i32 = 0;
    const LZMA_MAX_PRESET: i32 = 9;

    pub(crate) fn load() -> Result<Box<dyn CompressOps>, CompressionError> {
        Ok(Box::new(LzmaOps))
    }

    struct LzmaOps;

    impl CompressOps for LzmaOps {
        fn val_level(&self, level: i32) -> Result<(), CompressionError> {
            if !(LZMA_MIN_PRESET..=LZMA_MAX_PRESET).contains(&level) {
                return Err(CompressionError::invalid_argument(format!(
                    "lzma compression preset {level} is out of valid range {LZMA_MIN_PRESET}..={LZMA_MAX_PRESET}"
                )));
            }
            Ok(())
        }

        fn compress(
            &self,
            src: &[u8],
            level: i32,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            let mut out = Vec::new();
            XzEncoder::new(src, level as u32)
                .read_to_end(&mut out)
                .map_err(|err| CompressionError::codec("lzma", err))?;
            Ok(out)
        }

        fn decompress(
            &self,
            src: &[u8],
            max_out: usize,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            read_bounded("lzma", XzDecoder::new(src), max_out)
        }
    }
}

#[cfg(feature = "bzip2")]
pub(crate) mod bzip2_backend {
    use super::*;
    use bzip2::Compression;
    use bzip2::read::{BzDecoder, BzEncoder};

    const BZIP2_MIN_LEVEL: i32 = 1;
    const BZIP2_MAX_LEVEL: i32 = 9;

    pub(crate) fn load() -> Result<Box<dyn CompressOps>, CompressionError> {
        Ok(Box::new(Bzip2Ops))
    }

    struct Bzip2Ops;

    impl CompressOps for Bzip2Ops {
        fn val_level(&self, level: i32) -> Result<(), CompressionError> {
            if !(BZIP2_MIN_LEVEL..=BZIP2_MAX_LEVEL).contains(&level) {
                return Err(CompressionError::invalid_argument(format!(
                    "bzip2 compression level {level} is out of valid range {BZIP2_MIN_LEVEL}..={BZIP2_MAX_LEVEL}"
                )));
            }
            Ok(())
        }

        fn compress(
            &self,
            src: &[u8],
            level: i32,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            let mut out = Vec::new();
            BzEncoder::new(src, Compression::new(level as u32))
                .read_to_end(&mut out)
                .map_err(|err| CompressionError::codec("bzip2", err))?;
            Ok(out)
        }

        fn decompress(
            &self,
            src: &[u8],
            max_out: usize,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            read_bounded("bzip2", BzDecoder::new(src), max_out)
        }
    }
}

#[cfg(feature = "zstd")]
pub(crate) mod zstd_backend {
    use super::*;

    pub(crate) fn load() -> Result<Box<dyn CompressOps>, CompressionError> {
        Ok(Box::new(ZstdOps))
    }

    struct ZstdOps;

    impl CompressOps for ZstdOps {
        fn val_level(&self, level: i32) -> Result<(), CompressionError> {
            let range = zstd::compression_level_range();
            if !range.contains(&level) {
                return Err(CompressionError::invalid_argument(format!(
                    "zstd compression level {level} is out of valid range {}..={}",
                    range.start(),
                    range.end()
                )));
            }
            Ok(())
        }

        fn compress(
            &self,
            src: &[u8],
            level: i32,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            zstd::encode_all(src, level).map_err(|err| CompressionError::codec("zstd", err))
        }

        fn decompress(
            &self,
            src: &[u8],
            max_out: usize,
            _session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            let decoder =
                zstd::Decoder::new(src).map_err(|err| CompressionError::codec("zstd", err))?;
            read_bounded("zstd", decoder, max_out)
        }
    }
}
