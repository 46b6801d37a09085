//! Real-time audio I/O: the cpal-backed callback that owns the `Mixer`
//! and renders one block per hardware callback.

pub mod capture;
pub mod output;
