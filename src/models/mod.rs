//! Model-side state shared with the decoder
//!
//! - `config`: `config.json` parsing and generation options
//! - `kv_cache`: per-layer key/value caches and the layer cache set

pub mod config;
pub mod kv_cache;

pub use config::{AudioEncoderConfig, DecoderConfig, GenerationOptions, MusicGenConfig};
pub use kv_cache::{KvCache, LayerCaches};
