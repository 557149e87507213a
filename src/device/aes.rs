//! Offset-keyed symmetric encryption for device I/O. AES-128 in counter
//! mode over a zero nonce, with the keystream seeked to the absolute file
//! offset: the transform is a pure function of `(key, offset, bytes)` and
//! decryption is the same operation as encryption.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::config::ENCRYPTION_KEY_LENGTH;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub struct OffsetCipher {
    key: [u8; ENCRYPTION_KEY_LENGTH],
}

impl OffsetCipher {
    pub fn new(key: [u8; ENCRYPTION_KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Encrypts or decrypts `buf` as the bytes at `offset` in the file.
    pub fn apply(&self, offset: u64, buf: &mut [u8]) {
        let mut cipher = Aes128Ctr::new((&self.key).into(), (&[0u8; 16]).into());
        cipher.seek(offset);
        cipher.apply_keystream(buf);
    }
}
