//! # Upload-Init Envelope
//!
//! The ECDH/AES construction wrapping the upload-initialization
//! endpoint.
//!
//! Each cipher instance holds an ephemeral NIST P-224 key pair. The
//! shared secret against the service's fixed public key yields the
//! AES-128 key (first 16 bytes) and CBC IV (last 16 bytes). The client's
//! public key travels inside the `k_ec` query token together with a
//! timestamp, lightly masked by two random bytes and sealed with a
//! salted CRC-32.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use p224::elliptic_curve::sec1::ToEncodedPoint;
use p224::{PublicKey, SecretKey};
use rand::rngs::OsRng;

use crate::constants::{CRC_SALT, ECDH_REMOTE_PUBKEY, P224_BASE_LEN};
use crate::error::Error;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Compact public key: length prefix, SEC1 parity tag, 28-byte X.
pub const PUB_KEY_LEN: usize = P224_BASE_LEN + 2;

const TOKEN_LEN: usize = 48;

pub struct EcdhCipher {
    pub_key: [u8; PUB_KEY_LEN],
    aes_key: [u8; 16],
    aes_iv: [u8; 16],
}

impl EcdhCipher {
    pub fn new() -> Result<Self, Error> {
        let secret = SecretKey::random(&mut OsRng);
        let mut sec1 = Vec::with_capacity(1 + ECDH_REMOTE_PUBKEY.len());
        sec1.push(0x04);
        sec1.extend_from_slice(&ECDH_REMOTE_PUBKEY);
        let remote = PublicKey::from_sec1_bytes(&sec1)
            .map_err(|e| Error::CryptoMismatch(format!("remote public key: {e}")))?;
        let shared = p224::ecdh::diffie_hellman(secret.to_nonzero_scalar(), remote.as_affine());
        let bytes = shared.raw_secret_bytes();
        let mut aes_key = [0u8; 16];
        let mut aes_iv = [0u8; 16];
        aes_key.copy_from_slice(&bytes[..16]);
        aes_iv.copy_from_slice(&bytes[bytes.len() - 16..]);

        let point = secret.public_key().to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| Error::CryptoMismatch("public point at infinity".into()))?;
        let y = point
            .y()
            .ok_or_else(|| Error::CryptoMismatch("public point at infinity".into()))?;
        let mut pub_key = [0u8; PUB_KEY_LEN];
        pub_key[0] = (P224_BASE_LEN + 1) as u8;
        pub_key[1] = 0x02 + (y[y.len() - 1] & 1);
        pub_key[2..].copy_from_slice(x);
        Ok(Self {
            pub_key,
            aes_key,
            aes_iv,
        })
    }

    #[cfg(test)]
    fn with_parts(pub_key: [u8; PUB_KEY_LEN], aes_key: [u8; 16], aes_iv: [u8; 16]) -> Self {
        Self {
            pub_key,
            aes_key,
            aes_iv,
        }
    }

    pub fn pub_key(&self) -> &[u8; PUB_KEY_LEN] {
        &self.pub_key
    }

    /// AES-128-CBC encrypt with PKCS#7 padding.
    pub fn encode(&self, plaintext: &[u8]) -> Vec<u8> {
        let pad = 16 - (plaintext.len() & 15);
        let mut buf = Vec::with_capacity(plaintext.len() + pad);
        buf.extend_from_slice(plaintext);
        buf.resize(plaintext.len() + pad, pad as u8);
        Aes128CbcEnc::new(&self.aes_key.into(), &self.aes_iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&buf)
    }

    /// AES-128-CBC decrypt, dropping any trailing partial block. With
    /// `decompress` the payload carries a little-endian u16 length
    /// prefix followed by an LZ4 block; otherwise PKCS#7 padding is
    /// stripped when well-formed.
    pub fn decode(&self, cipher_text: &[u8], decompress: bool) -> Result<Vec<u8>, Error> {
        let len = cipher_text.len() & !15;
        let data = Aes128CbcDec::new(&self.aes_key.into(), &self.aes_iv.into())
            .decrypt_padded_vec_mut::<NoPadding>(&cipher_text[..len])
            .map_err(|e| Error::CryptoMismatch(format!("aes: {e}")))?;
        if decompress {
            if data.len() < 2 {
                return Err(Error::CryptoMismatch("short compressed payload".into()));
            }
            let size = data[0] as usize | (data[1] as usize) << 8;
            if data.len() < 2 + size {
                return Err(Error::CryptoMismatch("truncated compressed payload".into()));
            }
            lz4_flex::block::decompress(&data[2..2 + size], 0x2000)
                .map_err(|e| Error::CryptoMismatch(format!("lz4: {e}")))
        } else {
            let mut data = data;
            if let Some(&pad) = data.last() {
                let pad = pad as usize;
                if (1..=16).contains(&pad)
                    && pad <= data.len()
                    && data[data.len() - pad..].iter().all(|&b| b as usize == pad)
                {
                    data.truncate(data.len() - pad);
                }
            }
            Ok(data)
        }
    }

    /// Builds the `k_ec` query token embedding this cipher's public key
    /// and a unix-seconds timestamp.
    pub fn encode_token(&self, timestamp: u32) -> String {
        let r1 = rand::random::<u8>();
        let r2 = rand::random::<u8>();
        self.encode_token_with(timestamp, r1, r2)
    }

    pub(crate) fn encode_token_with(&self, timestamp: u32, r1: u8, r2: u8) -> String {
        let pub_key = &self.pub_key;
        let ts = timestamp.to_le_bytes();
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend(pub_key[..15].iter().map(|b| b ^ r1));
        token.push(r1);
        token.push(0x73 ^ r1);
        token.extend([r1; 3]);
        token.extend(ts.iter().map(|b| b ^ r1));
        token.extend(pub_key[15..].iter().map(|b| b ^ r2));
        token.push(r2);
        token.push(0x01 ^ r2);
        token.extend([r2; 3]);
        let mut salted = CRC_SALT.to_vec();
        salted.extend_from_slice(&token);
        let crc = crc32fast::hash(&salted);
        token.extend(crc.to_le_bytes());
        STANDARD.encode(token)
    }

    /// Recovers the public key and timestamp from a token.
    pub fn decode_token(token: &str) -> Result<([u8; PUB_KEY_LEN], u32), Error> {
        let data = STANDARD
            .decode(token)
            .map_err(|e| Error::CryptoMismatch(format!("token base64: {e}")))?;
        if data.len() != TOKEN_LEN {
            return Err(Error::CryptoMismatch("bad token length".into()));
        }
        let r1 = data[15];
        let r2 = data[39];
        let mut pub_key = [0u8; PUB_KEY_LEN];
        for (i, b) in data[..15].iter().enumerate() {
            pub_key[i] = b ^ r1;
        }
        for (i, b) in data[24..39].iter().enumerate() {
            pub_key[15 + i] = b ^ r2;
        }
        let mut ts = [0u8; 4];
        for (i, b) in data[20..24].iter().enumerate() {
            ts[i] = b ^ r1;
        }
        Ok((pub_key, u32::from_le_bytes(ts)))
    }
}

#[cfg(test)]
mod test {
    use super::{EcdhCipher, PUB_KEY_LEN};

    fn fixed_cipher() -> EcdhCipher {
        EcdhCipher::with_parts([0u8; PUB_KEY_LEN], [0x11; 16], [0x22; 16])
    }

    #[test]
    fn test_envelope_roundtrip() {
        let cipher = EcdhCipher::new().unwrap();
        for len in [0usize, 1, 15, 16, 17, 100, 4096] {
            let plain: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let wire = cipher.encode(&plain);
            assert_eq!(wire.len() % 16, 0);
            assert_eq!(cipher.decode(&wire, false).unwrap(), plain);
        }
    }

    #[test]
    fn test_envelope_roundtrip_compressed() {
        let cipher = EcdhCipher::new().unwrap();
        let plain = b"the quick brown fox jumps over the lazy dog, repeatedly and at length, \
                      the quick brown fox jumps over the lazy dog"
            .to_vec();
        let compressed = lz4_flex::block::compress(&plain);
        let mut body = (compressed.len() as u16).to_le_bytes().to_vec();
        body.extend_from_slice(&compressed);
        let wire = cipher.encode(&body);
        assert_eq!(cipher.decode(&wire, true).unwrap(), plain);
    }

    #[test]
    fn test_token_fixture_zero_mask() {
        let cipher = fixed_cipher();
        assert_eq!(
            cipher.encode_token_with(1_700_000_000, 0, 0),
            "AAAAAAAAAAAAAAAAAAAAAHMAAAAA8VNlAAAAAAAAAAAAAAAAAAAAAAEAAAC25S1h"
        );
    }

    #[test]
    fn test_token_fixture_masked() {
        let mut pub_key = [0u8; PUB_KEY_LEN];
        for (i, b) in pub_key.iter_mut().enumerate() {
            *b = i as u8;
        }
        let cipher = EcdhCipher::with_parts(pub_key, [0; 16], [0; 16]);
        assert_eq!(
            cipher.encode_token_with(1_700_000_000, 0x5a, 0xa5),
            "WltYWV5fXF1SU1BRVldUWilaWlpaqwk/qrW0t7axsLOyvby/vrm4paSlpaUCO7uX"
        );
    }

    #[test]
    fn test_token_roundtrip() {
        let cipher = EcdhCipher::new().unwrap();
        for ts in [0u32, 1, 1_700_000_000, u32::MAX / 2] {
            let token = cipher.encode_token(ts);
            let (pub_key, decoded_ts) = EcdhCipher::decode_token(&token).unwrap();
            assert_eq!(&pub_key, cipher.pub_key());
            assert_eq!(decoded_ts, ts);
        }
    }

    #[test]
    fn test_decode_token_rejects_bad_input() {
        assert!(EcdhCipher::decode_token("AAAA").is_err());
        assert!(EcdhCipher::decode_token("!!!").is_err());
    }

    #[test]
    fn test_shared_secret_agrees_with_remote_key_shape() {
        // The compact encoding is a length prefix, a parity tag and the
        // 28-byte X coordinate.
        let cipher = EcdhCipher::new().unwrap();
        let pk = cipher.pub_key();
        assert_eq!(pk[0], 29);
        assert!(pk[1] == 0x02 || pk[1] == 0x03);
    }
}
