//! Chunked public-key cipher for values at rest.
//!
//! This is unpadded textbook RSA applied block by block. It hides values from
//! a passive reader of the backing store, given a large enough modulus, and
//! nothing more: it is deterministic, malleable and has no integrity check.
//! The framing is kept byte-compatible with existing encrypted stores.
//!
//! Framing, per block of `chunk - 1` plaintext bytes:
//! `"1" + hex(block)` read as an integer, raised to the public exponent mod
//! the modulus, written as big-endian bytes left-padded to `chunk` bytes and
//! base64-encoded. Blocks are joined with `|`. `chunk` is the modulus bit
//! length divided by 8, rounded down.

use std::fmt;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::error::{KvError, KvResult};

/// Separator between encrypted blocks
pub const BLOCK_SEPARATOR: &str = "|";

/// Half of an RSA key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct RsaKey {
    pub exponent: BigUint,
    pub modulus: BigUint,
}

impl RsaKey {
    pub fn new(exponent: BigUint, modulus: BigUint) -> Self {
        Self { exponent, modulus }
    }

    /// Key from hexadecimal exponent and modulus.
    pub fn from_hex(exponent: &str, modulus: &str) -> KvResult<Self> {
        let parse = |what: &str, s: &str| {
            BigUint::parse_bytes(s.trim_start_matches("0x").as_bytes(), 16)
                .ok_or_else(|| KvError::InvalidConfig(format!("{} is not a hex integer", what)))
        };
        Ok(Self::new(parse("exponent", exponent)?, parse("modulus", modulus)?))
    }

    pub fn bits(&self) -> u64 {
        self.modulus.bits()
    }
}

impl fmt::Debug for RsaKey {
    // keep private exponents out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RsaKey({} bits)", self.bits())
    }
}

/// `base^exponent mod modulus` by left-to-right binary square-and-multiply.
pub fn mod_pow(base: &BigUint, exponent: &BigUint, modulus: &BigUint) -> BigUint {
    if modulus.is_one() {
        return BigUint::zero();
    }
    let base = base % modulus;
    let mut result = BigUint::one();
    for i in (0..exponent.bits()).rev() {
        result = &result * &result % modulus;
        if exponent.bit(i) {
            result = result * &base % modulus;
        }
    }
    result
}

pub struct ChunkCipher {
    public: Option<RsaKey>,
    private: Option<RsaKey>,
    chunk: usize,
}

impl ChunkCipher {
    /// Cipher over one or both key halves. The block size comes from the
    /// public modulus, or the private one when only that is given.
    pub fn new(public: Option<RsaKey>, private: Option<RsaKey>) -> KvResult<Self> {
        let bits = public
            .as_ref()
            .or(private.as_ref())
            .map(RsaKey::bits)
            .ok_or(KvError::MissingKey("public or private"))?;
        let chunk = (bits / 8) as usize;
        // every block must carry at least one plaintext byte
        if chunk < 2 {
            return Err(KvError::ModulusTooSmall { bits });
        }
        if let Some(other) = private.as_ref().filter(|k| k.bits() < 16) {
            return Err(KvError::ModulusTooSmall { bits: other.bits() });
        }
        Ok(Self {
            public,
            private,
            chunk,
        })
    }

    /// Encrypted block width in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk
    }

    pub fn can_encrypt(&self) -> bool {
        self.public.is_some()
    }

    pub fn can_decrypt(&self) -> bool {
        self.private.is_some()
    }

    /// Encrypt `text`, zlib-compressing it first when `compress` is set.
    pub fn encrypt_string(&self, text: &str, compress: bool) -> KvResult<String> {
        let key = self.public.as_ref().ok_or(KvError::MissingKey("public"))?;
        let payload = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(text.as_bytes())?;
            encoder.finish()?
        } else {
            text.as_bytes().to_vec()
        };

        let blocks: Vec<String> = payload
            .chunks(self.chunk - 1)
            .map(|block| {
                let framed = format!("1{}", hex::encode(block));
                // "1" followed by hex digits always parses
                let m = BigUint::parse_bytes(framed.as_bytes(), 16).unwrap_or_default();
                let c = mod_pow(&m, &key.exponent, &key.modulus);
                STANDARD.encode(self.pad_block(c.to_bytes_be()))
            })
            .collect();
        Ok(blocks.join(BLOCK_SEPARATOR))
    }

    fn pad_block(&self, bytes: Vec<u8>) -> Vec<u8> {
        if bytes.len() >= self.chunk {
            return bytes;
        }
        let mut padded = vec![0u8; self.chunk - bytes.len()];
        padded.extend_from_slice(&bytes);
        padded
    }

    /// Decrypt a string produced by [`ChunkCipher::encrypt_string`], with or
    /// without compression.
    pub fn decrypt_string(&self, ciphertext: &str) -> KvResult<String> {
        let key = self.private.as_ref().ok_or(KvError::MissingKey("private"))?;
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let mut payload = Vec::new();
        for (i, block) in ciphertext.split(BLOCK_SEPARATOR).enumerate() {
            let bytes = STANDARD
                .decode(block)
                .map_err(|e| KvError::InvalidCiphertext(format!("block {}: {}", i, e)))?;
            let c = BigUint::from_bytes_be(&bytes);
            let m = mod_pow(&c, &key.exponent, &key.modulus);
            let framed = m.to_str_radix(16);
            let body = framed
                .strip_prefix('1')
                .filter(|rest| rest.len() % 2 == 0)
                .ok_or_else(|| {
                    KvError::Decryption(format!("block {} has a bad frame marker; wrong key?", i))
                })?;
            payload.extend(
                hex::decode(body).map_err(|e| KvError::Decryption(format!("block {}: {}", i, e)))?,
            );
        }

        let payload = match String::from_utf8(payload) {
            Ok(text) => return Ok(text),
            Err(e) => e.into_bytes(),
        };
        let mut text = String::new();
        ZlibDecoder::new(payload.as_slice())
            .read_to_string(&mut text)
            .map_err(|e| {
                KvError::Decryption(format!("payload is neither UTF-8 nor zlib text: {}", e))
            })?;
        Ok(text)
    }
}

impl fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("chunk", &self.chunk)
            .field("public", &self.public.is_some())
            .field("private", &self.private.is_some())
            .finish()
    }
}
