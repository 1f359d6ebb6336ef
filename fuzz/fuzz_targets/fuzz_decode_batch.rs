//! Fuzz target for the replication batch decoder.
//!
//! `decode_batch` must never panic; bad records are skipped.

#![no_main]

use grid_replication::codec::decode_batch;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode_batch(data);
});
