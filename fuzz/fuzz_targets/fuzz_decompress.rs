//! Fuzz target for value decompression.
//!
//! Every scheme must reject malformed payloads with an error, never a panic
//! or an unbounded allocation.

#![no_main]

use grid_replication::codec::Compression;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Compression::Zstd.decompress(data);
    let _ = Compression::Lz4.decompress(data);
});
