//! # Download-URL Envelope
//!
//! The RSA construction wrapping the download-URL negotiation endpoint.
//!
//! Requests are XOR-scrambled with a per-session key derived from a
//! random 16-byte seed, reversed, scrambled again with a fixed key, then
//! RSA-encrypted in PKCS#1 v1.5 blocks against the service's public key.
//! Responses invert under the same public key (the service encrypts with
//! its private half), carrying the seed for the reply keys in the first
//! 16 plaintext bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use rand::Rng;

use crate::constants::{
    G_KEY_L, G_KTS, RSA_BLOCK_SIZE, RSA_CHUNK_SIZE, RSA_PUBLIC_KEY_E, RSA_PUBLIC_KEY_N_HEX,
    RSA_RAND_KEY_SIZE,
};
use crate::error::Error;

static RSA_N: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(RSA_PUBLIC_KEY_N_HEX.as_bytes(), 16).expect("shipped modulus parses")
});

/// Derives a scramble key of `len` bytes from a random seed.
///
/// Byte `i` of the output is `G_KTS[len*(len-1) - i*len]` XORed with
/// `(seed[i] + G_KTS[i*len]) mod 256`. The two call sites use `len = 4`
/// on encode and `len = 12` on decode.
pub(crate) fn gen_key(rand_key: &[u8], len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(len);
    if rand_key.is_empty() || len == 0 {
        return key;
    }
    let mut length = len * (len - 1);
    let mut index = 0;
    for i in 0..len {
        let x = rand_key[i].wrapping_add(G_KTS[index]);
        key.push(G_KTS[length] ^ x);
        if i + 1 < len {
            length -= len;
            index += len;
        }
    }
    key
}

/// Stream XOR with a 4-byte phase: the first `len % 4` bytes pair with
/// the key prefix, the remainder cycles the key from its start.
pub(crate) fn xor_transform(src: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let pad = src.len() % 4;
    for (c, k) in src[..pad].iter().zip(key.iter()) {
        out.push(c ^ k);
    }
    for (i, c) in src[pad..].iter().enumerate() {
        out.push(c ^ key[i % key.len()]);
    }
    out
}

pub struct RsaCipher {
    rand_key: [u8; RSA_RAND_KEY_SIZE],
    key: Vec<u8>,
    n: BigUint,
    e: BigUint,
}

impl RsaCipher {
    pub fn new() -> Self {
        let mut rand_key = [0u8; RSA_RAND_KEY_SIZE];
        rand::thread_rng().fill(&mut rand_key);
        Self::with_rand_key(rand_key)
    }

    pub(crate) fn with_rand_key(rand_key: [u8; RSA_RAND_KEY_SIZE]) -> Self {
        let key = gen_key(&rand_key, 4);
        Self {
            rand_key,
            key,
            n: RSA_N.clone(),
            e: BigUint::from(RSA_PUBLIC_KEY_E),
        }
    }

    #[cfg(test)]
    fn with_key(n: BigUint, e: BigUint, rand_key: [u8; RSA_RAND_KEY_SIZE]) -> Self {
        let key = gen_key(&rand_key, 4);
        Self { rand_key, key, n, e }
    }

    /// Encrypts a request body into the base64 wire form.
    pub fn encode(&self, plaintext: &[u8]) -> String {
        let mut tmp = xor_transform(plaintext, &self.key);
        tmp.reverse();
        let mut block = Vec::with_capacity(RSA_RAND_KEY_SIZE + tmp.len());
        block.extend_from_slice(&self.rand_key);
        block.extend_from_slice(&xor_transform(&tmp, &G_KEY_L));

        let mut cipher_text = Vec::new();
        for chunk in block.chunks(RSA_CHUNK_SIZE) {
            cipher_text.extend_from_slice(&self.encrypt_block(chunk));
        }
        STANDARD.encode(cipher_text)
    }

    /// Decrypts a base64 response body.
    pub fn decode(&self, cipher_text: &str) -> Result<Vec<u8>, Error> {
        let raw = STANDARD
            .decode(cipher_text.trim())
            .map_err(|e| Error::CryptoMismatch(format!("envelope base64: {e}")))?;
        let mut text = Vec::new();
        for block in raw.chunks(RSA_BLOCK_SIZE) {
            let m = BigUint::from_bytes_be(block).modpow(&self.e, &self.n);
            let bytes = m.to_bytes_be();
            // PKCS#1 layout after dropping leading zeros: 02 .. 00 data.
            let zero = bytes
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::CryptoMismatch("unpadded envelope block".into()))?;
            text.extend_from_slice(&bytes[zero + 1..]);
        }
        if text.len() < RSA_RAND_KEY_SIZE {
            return Err(Error::CryptoMismatch("short envelope payload".into()));
        }
        let body = text.split_off(RSA_RAND_KEY_SIZE);
        let key_l = gen_key(&text, 12);
        let mut tmp = xor_transform(&body, &key_l);
        tmp.reverse();
        Ok(xor_transform(&tmp, &self.key))
    }

    // PKCS#1 v1.5 type-2 padding with nonzero random filler, then the
    // public-exponent modexp, serialized back to a full block.
    fn encrypt_block(&self, chunk: &[u8]) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut padded = Vec::with_capacity(RSA_BLOCK_SIZE);
        padded.push(0x00);
        padded.push(0x02);
        for _ in 0..RSA_BLOCK_SIZE - 3 - chunk.len() {
            padded.push(rng.gen_range(1..=255u8));
        }
        padded.push(0x00);
        padded.extend_from_slice(chunk);
        let c = BigUint::from_bytes_be(&padded).modpow(&self.e, &self.n);
        let mut out = c.to_bytes_be();
        while out.len() < RSA_BLOCK_SIZE {
            out.insert(0, 0);
        }
        out
    }
}

impl Default for RsaCipher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use num_bigint::BigUint;

    use crate::constants::{G_KEY_L, RSA_BLOCK_SIZE, RSA_RAND_KEY_SIZE};

    use super::{gen_key, xor_transform, RsaCipher};

    // A throwaway 1024-bit key so the tests can play the service's side
    // of the envelope (the real private half is not ours to have).
    const TEST_N: &str = "886b7fd207f3830eab00fcdb487e66a4d81b1a0bc6a246d33d0ec618d99924dda54a7500bf3bae03ae60055f1ddbdbfdb8d9240d69b539198a82f55c31eae2913021b22c58afa2949bb30ba29f2580002f4e0ec79f4b66c1792f230e64c6378d10e97ff55b636006b49f25dfeae4a7b94a651285de0cfad7897535d274520833";
    const TEST_D: &str = "427aa87a70b781596789feaed9c0074333b0d95b7dbbdce9d9ea562d0bf52e5af8ceb4ffdd313716c22636d7e85418fba6d5e254cafbae4cbd0c1e878427e3aa88975c2cd14543a09520672998e1d4a0f04fcfabdb668819ed45ee560d787b5519e91d4c654095137899c544c1903ecd8986ed26d96f9556c6f44d34ffd2bab1";

    fn test_key() -> (BigUint, BigUint, BigUint) {
        (
            BigUint::parse_bytes(TEST_N.as_bytes(), 16).unwrap(),
            BigUint::from(0x10001u32),
            BigUint::parse_bytes(TEST_D.as_bytes(), 16).unwrap(),
        )
    }

    fn rand_key() -> [u8; RSA_RAND_KEY_SIZE] {
        let mut rk = [0u8; RSA_RAND_KEY_SIZE];
        for (i, b) in rk.iter_mut().enumerate() {
            *b = i as u8;
        }
        rk
    }

    #[test]
    fn test_gen_key() {
        let rk = rand_key();
        assert_eq!(hex::encode(gen_key(&rk, 4)), "8ddaa370");
        assert_eq!(hex::encode(gen_key(&rk, 12)), "ac81271bc54352d81c587497");
    }

    #[test]
    fn test_xor_transform() {
        let out = xor_transform(b"hello world, this is a test", &[1, 2, 3, 4]);
        assert_eq!(
            hex::encode(&out),
            "69676f6d6d23736e706f602d22776c6871236d7222622475677070"
        );
        // Involution: applying the same key twice restores the input.
        assert_eq!(
            xor_transform(&out, &[1, 2, 3, 4]),
            b"hello world, this is a test"
        );
    }

    // Emulates the service: unwrap the request with the private
    // exponent, then echo the plaintext back under the response-side
    // layering (session key in, seed-derived 12-byte key out).
    fn server_roundtrip(wire: &str, n: &BigUint, d: &BigUint) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let raw = STANDARD.decode(wire).unwrap();
        let mut stream = Vec::new();
        for block in raw.chunks(RSA_BLOCK_SIZE) {
            let m = BigUint::from_bytes_be(block).modpow(d, n);
            let bytes = m.to_bytes_be();
            let zero = bytes.iter().position(|&b| b == 0).unwrap();
            stream.extend_from_slice(&bytes[zero + 1..]);
        }
        let (seed, enc_body) = stream.split_at(RSA_RAND_KEY_SIZE);
        let key_s = gen_key(seed, 4);
        let key_l = gen_key(seed, 12);
        let mut tmp = xor_transform(enc_body, &G_KEY_L);
        tmp.reverse();
        let plain = xor_transform(&tmp, &key_s);

        let mut tmp = xor_transform(&plain, &key_s);
        tmp.reverse();
        let mut resp_stream = seed.to_vec();
        resp_stream.extend_from_slice(&xor_transform(&tmp, &key_l));
        let mut cipher = Vec::new();
        for chunk in resp_stream.chunks(RSA_BLOCK_SIZE - 11) {
            let mut padded = vec![0x00, 0x02];
            padded.resize(RSA_BLOCK_SIZE - 1 - chunk.len(), 0xff);
            padded.push(0x00);
            padded.extend_from_slice(chunk);
            let c = BigUint::from_bytes_be(&padded).modpow(d, n);
            let mut out = c.to_bytes_be();
            while out.len() < RSA_BLOCK_SIZE {
                out.insert(0, 0);
            }
            cipher.extend_from_slice(&out);
        }
        STANDARD.encode(cipher)
    }

    #[test]
    fn test_envelope_roundtrip() {
        let (n, e, d) = test_key();
        let cipher = RsaCipher::with_key(n.clone(), e, rand_key());
        let plaintext = br#"{"pickcode":"abcdef0123456789","other":"padding padding padding padding padding padding padding padding padding padding padding"}"#;
        let wire = cipher.encode(plaintext);
        let reply = server_roundtrip(&wire, &n, &d);
        assert_eq!(cipher.decode(&reply).unwrap(), plaintext);
    }

    #[test]
    fn test_envelope_roundtrip_multiblock() {
        let (n, e, d) = test_key();
        let cipher = RsaCipher::with_key(n.clone(), e, rand_key());
        let plaintext: Vec<u8> = (0..u8::MAX).cycle().take(400).collect();
        let wire = cipher.encode(&plaintext);
        // 16-byte seed + 400 payload bytes spans four request blocks.
        let reply = server_roundtrip(&wire, &n, &d);
        assert_eq!(cipher.decode(&reply).unwrap(), plaintext);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let cipher = RsaCipher::with_rand_key(rand_key());
        assert!(cipher.decode("not base64 at all !!!").is_err());
    }

    #[test]
    fn test_encode_prefixes_rand_key() {
        let (n, e, d) = test_key();
        let cipher = RsaCipher::with_key(n.clone(), e, rand_key());
        let wire = cipher.encode(b"x");
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let raw = STANDARD.decode(wire).unwrap();
        let m = BigUint::from_bytes_be(&raw[..RSA_BLOCK_SIZE]).modpow(&d, &n);
        let bytes = m.to_bytes_be();
        let zero = bytes.iter().position(|&b| b == 0).unwrap();
        let block = &bytes[zero + 1..];
        assert_eq!(&block[..RSA_RAND_KEY_SIZE], &rand_key());
        // Single byte survives the xor/reverse/xor layering.
        let body = xor_transform(&block[RSA_RAND_KEY_SIZE..], &G_KEY_L);
        let tmp: Vec<u8> = body.into_iter().rev().collect();
        assert_eq!(xor_transform(&tmp, &gen_key(&rand_key(), 4)), b"x");
    }
}
