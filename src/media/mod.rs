//! Media input/output: face input decoding and the encode/mux pipeline.

pub mod encode;
pub mod frames;
