//! Waveforms at the codec boundary
//!
//! The codec itself is external (see [`crate::models::Codec`]); this module
//! only carries mono PCM in and out of it and reads/writes WAV files.

mod io;

pub use io::{load_wav, save_wav, AudioBuffer};
