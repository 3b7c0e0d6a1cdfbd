// src/crypto/keywrap.rs
//! AES key wrap (RFC 3394) over the raw block cipher, used to protect the
//! session keys inside KM messages. Unwrap verifies the integrity check
//! value, which is what detects a passphrase mismatch.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};

const ICV: u64 = 0xA6A6_A6A6_A6A6_A6A6;

/// Runtime-sized AES key (16/24/32 bytes).
pub enum AesKey {
    A128(Box<Aes128>),
    A192(Box<Aes192>),
    A256(Box<Aes256>),
}

impl AesKey {
    pub fn new(key: &[u8]) -> Option<Self> {
        Some(match key.len() {
            16 => AesKey::A128(Box::new(Aes128::new(GenericArray::from_slice(key)))),
            24 => AesKey::A192(Box::new(Aes192::new(GenericArray::from_slice(key)))),
            32 => AesKey::A256(Box::new(Aes256::new(GenericArray::from_slice(key)))),
            _ => return None,
        })
    }

    fn encrypt_block(&self, block: &mut [u8; 16]) {
        let b = GenericArray::from_mut_slice(block);
        match self {
            AesKey::A128(c) => c.encrypt_block(b),
            AesKey::A192(c) => c.encrypt_block(b),
            AesKey::A256(c) => c.encrypt_block(b),
        }
    }

    fn decrypt_block(&self, block: &mut [u8; 16]) {
        let b = GenericArray::from_mut_slice(block);
        match self {
            AesKey::A128(c) => c.decrypt_block(b),
            AesKey::A192(c) => c.decrypt_block(b),
            AesKey::A256(c) => c.decrypt_block(b),
        }
    }
}

/// Wraps `plain` (length a multiple of 8, at least 16) under `kek`.
/// Output is 8 bytes longer than the input.
pub fn wrap(kek: &AesKey, plain: &[u8]) -> Vec<u8> {
    assert!(plain.len() >= 16 && plain.len() % 8 == 0);
    let n = plain.len() / 8;
    let mut a = ICV;
    let mut r: Vec<u64> = plain
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect();

    for j in 0..6u64 {
        for (i, ri) in r.iter_mut().enumerate() {
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&a.to_be_bytes());
            block[8..].copy_from_slice(&ri.to_be_bytes());
            kek.encrypt_block(&mut block);
            let t = (n as u64) * j + (i as u64 + 1);
            a = u64::from_be_bytes(block[..8].try_into().unwrap()) ^ t;
            *ri = u64::from_be_bytes(block[8..].try_into().unwrap());
        }
    }

    let mut out = Vec::with_capacity(plain.len() + 8);
    out.extend_from_slice(&a.to_be_bytes());
    for ri in r {
        out.extend_from_slice(&ri.to_be_bytes());
    }
    out
}

/// Unwraps RFC 3394 output. `None` means the integrity check failed, i.e.
/// the KEK (and therefore the passphrase) does not match.
pub fn unwrap(kek: &AesKey, wrapped: &[u8]) -> Option<Vec<u8>> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return None;
    }
    let n = wrapped.len() / 8 - 1;
    let mut a = u64::from_be_bytes(wrapped[..8].try_into().unwrap());
    let mut r: Vec<u64> = wrapped[8..]
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect();

    for j in (0..6u64).rev() {
        for i in (0..n).rev() {
            let t = (n as u64) * j + (i as u64 + 1);
            let mut block = [0u8; 16];
            block[..8].copy_from_slice(&(a ^ t).to_be_bytes());
            block[8..].copy_from_slice(&r[i].to_be_bytes());
            kek.decrypt_block(&mut block);
            a = u64::from_be_bytes(block[..8].try_into().unwrap());
            r[i] = u64::from_be_bytes(block[8..].try_into().unwrap());
        }
    }

    if a != ICV {
        return None;
    }
    let mut out = Vec::with_capacity(n * 8);
    for ri in r {
        out.extend_from_slice(&ri.to_be_bytes());
    }
    Some(out)
}
