//! Upload pipeline: source adapters, the instant-upload/hash-challenge
//! engine, the storage dispatch (single-shot or multipart with resume),
//! and the sample form-upload fallback for sources that cannot be
//! hashed up front.

pub mod engine;
pub mod sample;
pub mod source;
