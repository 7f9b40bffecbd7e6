//! RSA key transport and AES-CBC payload encryption for one connection.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use thiserror::Error;

pub use rsa::RsaPrivateKey;

use super::{AES_KEY_LEN, IV_LEN, KEY_BLOB_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Failures of the key exchange or payload ciphers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(#[source] rsa::Error),

    #[error("{0} has not been established")]
    MissingKey(&'static str),

    #[error("malformed public key: {0}")]
    PublicKey(String),

    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("key blob must be {expected} bytes, got {actual}")]
    KeyBlob { expected: usize, actual: usize },

    #[error("ciphertext is malformed")]
    Ciphertext,
}

/// Generate an ephemeral RSA key pair. CPU heavy; run it off the runtime.
pub fn generate_keypair(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(CryptoError::KeyGeneration)
}

#[derive(Clone)]
struct AesKey {
    key: [u8; AES_KEY_LEN],
    iv: [u8; IV_LEN],
}

/// Key material and ciphers for one side of a connection.
pub struct Encryptor {
    per_message_iv: bool,
    private_key: Option<RsaPrivateKey>,
    peer_key: Option<RsaPublicKey>,
    aes: Option<AesKey>,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("per_message_iv", &self.per_message_iv)
            .field("has_private_key", &self.private_key.is_some())
            .field("has_peer_key", &self.peer_key.is_some())
            .field("has_aes", &self.aes.is_some())
            .finish()
    }
}

impl Encryptor {
    pub fn new(per_message_iv: bool) -> Self {
        Self {
            per_message_iv,
            private_key: None,
            peer_key: None,
            aes: None,
        }
    }

    /// Adopt a freshly generated key pair.
    pub fn set_private_key(&mut self, key: RsaPrivateKey) {
        self.private_key = Some(key);
    }

    /// Own public key, PKCS#1 DER encoded.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .private_key
            .as_ref()
            .ok_or(CryptoError::MissingKey("RSA key pair"))?;
        let der = RsaPublicKey::from(key)
            .to_pkcs1_der()
            .map_err(|e| CryptoError::PublicKey(e.to_string()))?;
        Ok(der.as_bytes().to_vec())
    }

    /// Import the peer's PKCS#1 DER public key.
    pub fn set_peer_public_key(&mut self, der: &[u8]) -> Result<(), CryptoError> {
        let key =
            RsaPublicKey::from_pkcs1_der(der).map_err(|e| CryptoError::PublicKey(e.to_string()))?;
        self.peer_key = Some(key);
        Ok(())
    }

    /// Generate a fresh AES-256 key and IV.
    pub fn generate_aes(&mut self) {
        let mut rng = rand::thread_rng();
        let mut aes = AesKey {
            key: [0u8; AES_KEY_LEN],
            iv: [0u8; IV_LEN],
        };
        rng.fill_bytes(&mut aes.key);
        rng.fill_bytes(&mut aes.iv);
        self.aes = Some(aes);
    }

    /// The negotiated `key ‖ IV`.
    pub fn key_blob(&self) -> Result<Vec<u8>, CryptoError> {
        let aes = self.aes.as_ref().ok_or(CryptoError::MissingKey("AES key"))?;
        let mut blob = Vec::with_capacity(KEY_BLOB_LEN);
        blob.extend_from_slice(&aes.key);
        blob.extend_from_slice(&aes.iv);
        Ok(blob)
    }

    /// Adopt a `key ‖ IV` blob received from the peer.
    pub fn set_key_blob(&mut self, blob: &[u8]) -> Result<(), CryptoError> {
        if blob.len() != KEY_BLOB_LEN {
            return Err(CryptoError::KeyBlob {
                expected: KEY_BLOB_LEN,
                actual: blob.len(),
            });
        }
        let mut aes = AesKey {
            key: [0u8; AES_KEY_LEN],
            iv: [0u8; IV_LEN],
        };
        aes.key.copy_from_slice(&blob[..AES_KEY_LEN]);
        aes.iv.copy_from_slice(&blob[AES_KEY_LEN..]);
        self.aes = Some(aes);
        Ok(())
    }

    /// Encrypt for the peer with its public key.
    pub fn encrypt_rsa(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .peer_key
            .as_ref()
            .ok_or(CryptoError::MissingKey("peer public key"))?;
        Ok(key.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, data)?)
    }

    /// Decrypt with the local private key.
    pub fn decrypt_rsa(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .private_key
            .as_ref()
            .ok_or(CryptoError::MissingKey("RSA key pair"))?;
        Ok(key.decrypt(Pkcs1v15Encrypt, data)?)
    }

    pub fn has_aes(&self) -> bool {
        self.aes.is_some()
    }

    /// AES-256-CBC/PKCS7. Empty input stays empty.
    pub fn encrypt_aes(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let aes = self.aes.as_ref().ok_or(CryptoError::MissingKey("AES key"))?;

        if self.per_message_iv {
            let mut iv = [0u8; IV_LEN];
            rand::thread_rng().fill_bytes(&mut iv);
            let cipher =
                Aes256CbcEnc::new_from_slices(&aes.key, &iv).map_err(|_| CryptoError::Ciphertext)?;
            let mut out = Vec::with_capacity(IV_LEN + data.len() + IV_LEN);
            out.extend_from_slice(&iv);
            out.extend_from_slice(&cipher.encrypt_padded_vec_mut::<Pkcs7>(data));
            Ok(out)
        } else {
            let cipher = Aes256CbcEnc::new_from_slices(&aes.key, &aes.iv)
                .map_err(|_| CryptoError::Ciphertext)?;
            Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
        }
    }

    /// Inverse of [`encrypt_aes`](Self::encrypt_aes).
    pub fn decrypt_aes(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let aes = self.aes.as_ref().ok_or(CryptoError::MissingKey("AES key"))?;

        let (iv, ciphertext) = if self.per_message_iv {
            if data.len() < IV_LEN {
                return Err(CryptoError::Ciphertext);
            }
            data.split_at(IV_LEN)
        } else {
            (&aes.iv[..], data)
        };

        let cipher =
            Aes256CbcDec::new_from_slices(&aes.key, iv).map_err(|_| CryptoError::Ciphertext)?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Ciphertext)
    }

    /// Forget all key material.
    pub fn reset(&mut self) {
        self.private_key = None;
        self.peer_key = None;
        self.aes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MIN_RSA_BITS;

    fn paired(per_message_iv: bool) -> (Encryptor, Encryptor) {
        let mut initiator = Encryptor::new(per_message_iv);
        initiator.set_private_key(generate_keypair(MIN_RSA_BITS).unwrap());

        let mut receiver = Encryptor::new(per_message_iv);
        receiver
            .set_peer_public_key(&initiator.public_key_der().unwrap())
            .unwrap();
        receiver.generate_aes();

        let sealed = receiver.encrypt_rsa(&receiver.key_blob().unwrap()).unwrap();
        let blob = initiator.decrypt_rsa(&sealed).unwrap();
        initiator.set_key_blob(&blob).unwrap();
        (initiator, receiver)
    }

    #[test]
    fn key_exchange_agrees() {
        let (initiator, receiver) = paired(true);
        assert_eq!(initiator.key_blob().unwrap(), receiver.key_blob().unwrap());

        let ciphertext = receiver.encrypt_aes(b"hello").unwrap();
        assert_ne!(&ciphertext[..], b"hello");
        assert_eq!(initiator.decrypt_aes(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn per_message_iv_randomizes_ciphertext() {
        let (initiator, _) = paired(true);
        let first = initiator.encrypt_aes(b"same").unwrap();
        let second = initiator.encrypt_aes(b"same").unwrap();
        assert_ne!(first, second);
        assert_eq!(first.len(), IV_LEN + 16);
    }

    #[test]
    fn negotiated_iv_is_deterministic() {
        let (initiator, receiver) = paired(false);
        let first = initiator.encrypt_aes(b"same").unwrap();
        assert_eq!(first, initiator.encrypt_aes(b"same").unwrap());
        assert_eq!(receiver.decrypt_aes(&first).unwrap(), b"same");
    }

    #[test]
    fn mismatched_iv_modes_do_not_agree() {
        let (initiator, _) = paired(true);
        let mut other = Encryptor::new(false);
        other.set_key_blob(&initiator.key_blob().unwrap()).unwrap();

        let sealed = other.encrypt_aes(b"E2EE_TEST").unwrap();
        let opened = initiator.decrypt_aes(&sealed);
        assert!(opened.map_or(true, |plain| plain != b"E2EE_TEST"));
    }

    #[test]
    fn missing_keys_are_reported() {
        let encryptor = Encryptor::new(true);
        assert!(matches!(
            encryptor.encrypt_aes(b"x"),
            Err(CryptoError::MissingKey(_))
        ));
        assert!(matches!(
            encryptor.encrypt_rsa(b"x"),
            Err(CryptoError::MissingKey(_))
        ));
        assert!(encryptor.encrypt_aes(b"").unwrap().is_empty());
    }

    #[test]
    fn bad_inputs() {
        let mut encryptor = Encryptor::new(true);
        assert!(encryptor.set_peer_public_key(b"garbage").is_err());
        assert!(matches!(
            encryptor.set_key_blob(&[0u8; 10]),
            Err(CryptoError::KeyBlob { actual: 10, .. })
        ));

        encryptor.generate_aes();
        assert!(encryptor.decrypt_aes(&[1u8; 7]).is_err());
        encryptor.reset();
        assert!(!encryptor.has_aes());
    }
}
