//! Session output module
//!
//! Buffers the samples of a measurement session and commits them to disk
//! when the session ends. See [`DataSink`].

pub mod sink;

pub use sink::{generated_file_name, DataSink, OverwritePolicy};
