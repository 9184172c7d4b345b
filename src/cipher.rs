use crate::embryo::Embryo;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes256;
use anyhow::anyhow;

/// Per-connection symmetric cipher context: AES-256-CBC with PKCS7 padding
/// over each packet's frame.
///
/// The IV for a packet is the connection's IV base with its first 4 bytes
/// replaced by the packet header's salt, so every packet gets a fresh IV
/// without transmitting one. The expanded key schedule is computed once per
/// connection and cloned per packet, which is the expensive part of cipher
/// setup.
pub struct PacketCipher {
    cipher: Aes256,
    iv_base: [u8; 16],
}

impl PacketCipher {
    pub fn new(embryo: &Embryo) -> PacketCipher {
        PacketCipher {
            cipher: Aes256::new(GenericArray::from_slice(&embryo.key)),
            iv_base: embryo.iv,
        }
    }

    fn iv_for_salt(&self, salt: u32) -> [u8; 16] {
        let mut iv = self.iv_base;
        iv[0..4].copy_from_slice(&salt.to_le_bytes());
        iv
    }

    pub fn encrypt(&self, salt: u32, frame: &[u8]) -> Vec<u8> {
        let iv = GenericArray::from(self.iv_for_salt(salt));
        cbc::Encryptor::<Aes256>::inner_iv_init(self.cipher.clone(), &iv)
            .encrypt_padded_vec_mut::<Pkcs7>(frame)
    }

    /// Fails on ciphertexts that are empty, not block-aligned, or do not
    /// decrypt to valid padding. Callers treat any failure as "drop silently".
    pub fn decrypt(&self, salt: u32, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(anyhow!("ciphertext is not block-aligned"));
        }
        let iv = GenericArray::from(self.iv_for_salt(salt));
        cbc::Decryptor::<Aes256>::inner_iv_init(self.cipher.clone(), &iv)
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| anyhow!("invalid padding"))
    }
}
