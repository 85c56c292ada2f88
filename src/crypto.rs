//! Byte-exact wire envelopes the service requires around privileged
//! requests: the RSA construction for download-URL negotiation and the
//! ECDH/AES construction for upload initialization.

pub mod ecdh;
pub mod rsa;
