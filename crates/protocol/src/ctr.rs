//! Counter-mode keystream cipher over AES-128.
//!
//! The record layer encrypts with a single continuous keystream per
//! direction: the length field and payload of each record, and every record
//! after it, consume successive keystream bytes. Both sides must therefore
//! advance their keystream in lockstep even when a record fails its MAC
//! check, which is what [`CtrCipher::advance`] is for.
//!
//! Counter blocks are built from a 12-byte folded IV followed by a
//! little-endian block counter starting at 1. The 16-byte IV is folded by
//! XOR-wrapping it into the 12-byte prefix, so IVs longer than the prefix
//! still contribute every byte.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

/// AES block size in bytes.
const BLOCK_SIZE: usize = 16;

/// Counter prefix occupied by the folded IV: block size minus the 32-bit
/// counter tail.
const IV_PREFIX_SIZE: usize = BLOCK_SIZE - 4;

/// Keystream is produced in chunks of this many bytes (64 blocks).
const KEYSTREAM_SIZE: usize = 1024;

/// Highest block counter value before the keystream must be retired.
const COUNTER_CEILING: u32 = u32::MAX - i16::MAX as u32;

/// A stateful CTR-mode cipher producing one continuous keystream.
///
/// Encryption and decryption are the same operation (XOR against the
/// keystream), so a single `apply` method serves both directions.
pub struct CtrCipher {
    cipher: Aes128,
    iv_prefix: [u8; IV_PREFIX_SIZE],
    counter: u32,
    keystream: [u8; KEYSTREAM_SIZE],
    /// Next unconsumed keystream byte. Starts past the end so the first
    /// `apply` triggers generation.
    index: usize,
}

impl CtrCipher {
    /// Creates a cipher from a 16-byte key and a 16-byte IV.
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        let mut iv_prefix = [0u8; IV_PREFIX_SIZE];
        for (i, byte) in iv.iter().enumerate() {
            iv_prefix[i % IV_PREFIX_SIZE] ^= byte;
        }

        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            iv_prefix,
            counter: 1,
            keystream: [0u8; KEYSTREAM_SIZE],
            index: KEYSTREAM_SIZE,
        }
    }

    /// XORs the next keystream bytes into `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            if self.index == KEYSTREAM_SIZE {
                self.refill()?;
            }

            let available = KEYSTREAM_SIZE - self.index;
            let take = available.min(data.len() - offset);
            for i in 0..take {
                data[offset + i] ^= self.keystream[self.index + i];
            }
            self.index += take;
            offset += take;
        }
        Ok(())
    }

    /// Consumes `len` keystream bytes without producing output.
    ///
    /// Called when an inbound record fails authentication: the ciphertext is
    /// discarded but the keystream position must still move past it.
    pub fn advance(&mut self, len: usize) -> Result<()> {
        let mut remaining = len;
        while remaining > 0 {
            if self.index == KEYSTREAM_SIZE {
                self.refill()?;
            }

            let take = (KEYSTREAM_SIZE - self.index).min(remaining);
            self.index += take;
            remaining -= take;
        }
        Ok(())
    }

    fn refill(&mut self) -> Result<()> {
        if self.counter >= COUNTER_CEILING {
            return Err(ProtocolError::CounterExhausted);
        }

        let mut block = [0u8; BLOCK_SIZE];
        block[..IV_PREFIX_SIZE].copy_from_slice(&self.iv_prefix);

        for chunk in self.keystream.chunks_exact_mut(BLOCK_SIZE) {
            block[IV_PREFIX_SIZE..].copy_from_slice(&self.counter.to_le_bytes());
            let ga = GenericArray::from_mut_slice(chunk);
            ga.copy_from_slice(&block);
            self.cipher.encrypt_block(ga);
            self.counter += 1;
        }

        self.index = 0;
        Ok(())
    }
}

impl Drop for CtrCipher {
    fn drop(&mut self) {
        self.keystream.zeroize();
        self.iv_prefix.zeroize();
    }
}

impl std::fmt::Debug for CtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrCipher")
            .field("counter", &self.counter)
            .field("index", &self.index)
            .finish()
    }
}
