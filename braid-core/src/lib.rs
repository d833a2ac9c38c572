// Copyright Braid Project Contributors - SPDX Identifier: Apache-2.0

//! Core library of the braid cluster transport: a redundant, multi-link,
//! encrypted messaging layer between cluster nodes. This crate currently
//! exposes the payload-compression dispatcher used on the packet send and
//! receive paths; the link, crypto, and control-plane subsystems live behind
//! it and consume it through [`compression::Compressor`].

pub mod compression;

/// Largest payload a single transport packet can carry, in bytes.
pub const MAX_PACKET_SIZE: usize = 65536;
