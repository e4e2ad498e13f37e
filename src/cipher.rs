//! Cipher engine: key stretching, the live-data stream cipher and the
//! block cipher protecting the persisted partition table.
//!
//! Two primitives with different cost profiles:
//! - `xor_cipher`: a repeating-keystream XOR, cheap enough to run on every
//!   sector the host reads or writes. Self-inverse.
//! - `block_encrypt`/`block_decrypt`: AES-ECB with a 128/192/256-bit key,
//!   used only for the partition table in the reserved tail sectors.
//!
//! # Security Notes
//!
//! - Neither primitive authenticates data. A wrong key produces garbage, which
//!   the table store detects by comparing a plaintext field after decryption.
//! - `derive_key` stretches a passphrase by cyclic repetition, not by a KDF.
//!   An empty passphrase yields an all-zero key.
//! - Derived keys (`StreamKey`, block cipher keys) are zeroized on drop.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::SECTOR_SIZE;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// The stream cipher works on 32-bit words
pub const STREAM_WORD_SIZE: usize = 4;

/// Error types for cipher operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("Buffer length {len} is not a multiple of {align}")]
    UnalignedBuffer { len: usize, align: usize },
    #[error("Empty stream cipher key")]
    EmptyKey,
    #[error("Invalid block cipher key length")]
    InvalidKeyLength,
}

/// AES key size used for the persisted table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyStrength {
    #[default]
    Aes128,
    Aes192,
    Aes256,
}

impl KeyStrength {
    /// Key length in bytes
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }
}

// ============================================================
// KEY DERIVATION
// ============================================================

/// Fill `out` by cyclically repeating `passphrase`.
///
/// An empty passphrase zero-fills `out`.
pub fn derive_key(passphrase: &[u8], out: &mut [u8]) {
    if passphrase.is_empty() {
        out.fill(0);
        return;
    }
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = passphrase[i % passphrase.len()];
    }
}

/// Block cipher key stretched to the configured strength
#[derive(Zeroize, ZeroizeOnDrop)]
struct BlockKey {
    bytes: [u8; 32],
    #[zeroize(skip)]
    strength: KeyStrength,
}

impl BlockKey {
    fn derive(passphrase: &[u8], strength: KeyStrength) -> Self {
        let mut bytes = [0u8; 32];
        derive_key(passphrase, &mut bytes[..strength.key_len()]);
        Self { bytes, strength }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.strength.key_len()]
    }
}

// ============================================================
// STREAM CIPHER
// ============================================================

/// XOR `buffer` with the keystream obtained by repeating `key`.
///
/// Applying it twice with the same key restores the input.
pub fn xor_cipher(buffer: &mut [u8], key: &[u8]) -> Result<(), CipherError> {
    if key.is_empty() {
        return Err(CipherError::EmptyKey);
    }
    if buffer.len() % STREAM_WORD_SIZE != 0 {
        return Err(CipherError::UnalignedBuffer {
            len: buffer.len(),
            align: STREAM_WORD_SIZE,
        });
    }

    for (word_index, word) in buffer.chunks_exact_mut(STREAM_WORD_SIZE).enumerate() {
        let base = word_index * STREAM_WORD_SIZE;
        let mut stream = [0u8; STREAM_WORD_SIZE];
        for (k, byte) in stream.iter_mut().enumerate() {
            *byte = key[(base + k) % key.len()];
        }
        let data = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
        let mixed = data ^ u32::from_ne_bytes(stream);
        word.copy_from_slice(&mixed.to_ne_bytes());
    }
    Ok(())
}

/// Live keystream of the visible private partition (one sector long)
///
/// Every sector starts at keystream offset 0, so a sector deciphers the same
/// way whether it is read alone or as part of a multi-sector transfer.
/// Automatically zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StreamKey([u8; SECTOR_SIZE]);

impl StreamKey {
    /// Derive the keystream from a partition key combined with the root key
    #[must_use]
    pub fn derive(partition_key: &str, root_key: &str) -> Self {
        let mut material = Vec::with_capacity(partition_key.len() + root_key.len());
        material.extend_from_slice(partition_key.as_bytes());
        material.extend_from_slice(root_key.as_bytes());

        let mut stream = [0u8; SECTOR_SIZE];
        derive_key(&material, &mut stream);
        material.zeroize();
        Self(stream)
    }

    /// Encrypt or decrypt `buffer` in place
    pub fn apply(&self, buffer: &mut [u8]) -> Result<(), CipherError> {
        xor_cipher(buffer, &self.0)
    }

    /// Get the keystream bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SECTOR_SIZE] {
        &self.0
    }
}

// ============================================================
// BLOCK CIPHER
// ============================================================

fn check_block_aligned(buffer: &[u8]) -> Result<(), CipherError> {
    if buffer.len() % AES_BLOCK_SIZE != 0 {
        return Err(CipherError::UnalignedBuffer {
            len: buffer.len(),
            align: AES_BLOCK_SIZE,
        });
    }
    Ok(())
}

fn encrypt_blocks<C: BlockEncrypt>(cipher: &C, buffer: &mut [u8]) {
    for block in buffer.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks<C: BlockDecrypt>(cipher: &C, buffer: &mut [u8]) {
    for block in buffer.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Encrypt `buffer` in place with AES-ECB under a key derived from `passphrase`
///
/// `buffer.len()` must be a multiple of [`AES_BLOCK_SIZE`]; callers pad.
pub fn block_encrypt(
    buffer: &mut [u8],
    passphrase: &[u8],
    strength: KeyStrength,
) -> Result<(), CipherError> {
    check_block_aligned(buffer)?;
    let key = BlockKey::derive(passphrase, strength);
    let invalid = |_| CipherError::InvalidKeyLength;
    match strength {
        KeyStrength::Aes128 => {
            let cipher = Aes128::new_from_slice(key.as_bytes()).map_err(invalid)?;
            encrypt_blocks(&cipher, buffer);
        }
        KeyStrength::Aes192 => {
            let cipher = Aes192::new_from_slice(key.as_bytes()).map_err(invalid)?;
            encrypt_blocks(&cipher, buffer);
        }
        KeyStrength::Aes256 => {
            let cipher = Aes256::new_from_slice(key.as_bytes()).map_err(invalid)?;
            encrypt_blocks(&cipher, buffer);
        }
    }
    Ok(())
}

/// Decrypt `buffer` in place; inverse of [`block_encrypt`]
pub fn block_decrypt(
    buffer: &mut [u8],
    passphrase: &[u8],
    strength: KeyStrength,
) -> Result<(), CipherError> {
    check_block_aligned(buffer)?;
    let key = BlockKey::derive(passphrase, strength);
    let invalid = |_| CipherError::InvalidKeyLength;
    match strength {
        KeyStrength::Aes128 => {
            let cipher = Aes128::new_from_slice(key.as_bytes()).map_err(invalid)?;
            decrypt_blocks(&cipher, buffer);
        }
        KeyStrength::Aes192 => {
            let cipher = Aes192::new_from_slice(key.as_bytes()).map_err(invalid)?;
            decrypt_blocks(&cipher, buffer);
        }
        KeyStrength::Aes256 => {
            let cipher = Aes256::new_from_slice(key.as_bytes()).map_err(invalid)?;
            decrypt_blocks(&cipher, buffer);
        }
    }
    Ok(())
}

// ============================================================
// TESTS
// ============================================================
