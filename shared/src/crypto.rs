//! Session key material for the identity provisioning exchange.
//!
//! The client seals a pre-master secret to the server's public key with an
//! ephemeral Diffie-Hellman agreement. Both sides then derive the same master
//! secret from the pre-master and the two hello randoms, and use it to
//! encrypt exactly one payload: the freshly issued client certificate pair.

use crate::error::CryptoError;
use crate::identity::{PrivateIdentityCertificate, PublicIdentityCertificate};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const RANDOM_LEN: usize = 32;
pub const PRE_MASTER_LEN: usize = 48;
pub const NONCE_LEN: usize = 12;

pub type Random = [u8; RANDOM_LEN];

pub fn generate_random() -> Random {
    let mut random = [0u8; RANDOM_LEN];
    OsRng.fill_bytes(&mut random);
    random
}

pub fn generate_pre_master() -> Vec<u8> {
    let mut secret = vec![0u8; PRE_MASTER_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// A secret encrypted to a certificate holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub ephemeral_key: [u8; 32],
    pub ciphertext: Vec<u8>,
}

fn agree(secret: &SigningKey, public_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let point = CompressedEdwardsY(*public_key)
        .decompress()
        .ok_or(CryptoError::InvalidPublicKey)?;
    let shared = (secret.to_scalar() * point).compress().to_bytes();
    Ok(Sha256::digest(shared).into())
}

fn seal(key: &[u8; 32], nonce: [u8; NONCE_LEN], payload: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_256_GCM, key).map_err(|_| CryptoError::Encryption)?,
    );

    let mut cipher_text = payload;
    key.seal_in_place_append_tag(
        aead::Nonce::assume_unique_for_key(nonce),
        aead::Aad::empty(),
        &mut cipher_text,
    )
    .map_err(|_| CryptoError::Encryption)?;

    Ok(cipher_text)
}

fn open(key: &[u8; 32], nonce: [u8; NONCE_LEN], cipher_text: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_256_GCM, key).map_err(|_| CryptoError::Decryption)?,
    );

    let mut payload = cipher_text;
    let len = key
        .open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::empty(),
            &mut payload,
        )
        .map_err(|_| CryptoError::Decryption)?
        .len();
    payload.truncate(len);

    Ok(payload)
}

/// Encrypts `secret` so only the holder of `recipient`'s private key can read it.
pub fn seal_secret(
    recipient: &PublicIdentityCertificate,
    secret: &[u8],
) -> Result<SealedSecret, CryptoError> {
    let ephemeral = SigningKey::generate(&mut OsRng);
    let key = agree(&ephemeral, &recipient.public_key)?;
    // One ephemeral key per seal, so the nonce never repeats under a key.
    let ciphertext = seal(&key, [0u8; NONCE_LEN], secret.to_vec())?;

    Ok(SealedSecret {
        ephemeral_key: ephemeral.verifying_key().to_bytes(),
        ciphertext,
    })
}

pub fn open_secret(
    recipient: &PrivateIdentityCertificate,
    sealed: &SealedSecret,
) -> Result<Vec<u8>, CryptoError> {
    let key = agree(&recipient.signing_key(), &sealed.ephemeral_key)?;
    open(&key, [0u8; NONCE_LEN], sealed.ciphertext.clone())
}

/// Symmetric keys for one handshake.
pub struct SessionKeys {
    master_secret: [u8; 32],
    client_random: Random,
    server_random: Random,
}

impl SessionKeys {
    pub fn derive(pre_master: &[u8], client_random: &Random, server_random: &Random) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"master secret");
        hasher.update(pre_master);
        hasher.update(client_random);
        hasher.update(server_random);

        Self {
            master_secret: hasher.finalize().into(),
            client_random: *client_random,
            server_random: *server_random,
        }
    }

    fn provisioning_key(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"key expansion");
        hasher.update(self.master_secret);
        hasher.update(self.server_random);
        hasher.update(self.client_random);
        hasher.finalize().into()
    }

    /// Encrypts `payload`; the random nonce is prepended to the output.
    pub fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = seal(&self.provisioning_key(), nonce, payload.to_vec())?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::Decryption);
        }
        let (nonce, cipher_text) = data.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);

        open(&self.provisioning_key(), nonce_bytes, cipher_text.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CertificateGenerator;

    #[test]
    fn test_sealed_secret_opens_for_recipient() {
        let server = CertificateGenerator::generate_self_signed();
        let pre_master = generate_pre_master();

        let sealed = seal_secret(&server.public, &pre_master).unwrap();
        let opened = open_secret(&server.private, &sealed).unwrap();

        assert_eq!(opened, pre_master);
        assert_eq!(opened.len(), PRE_MASTER_LEN);
    }

    #[test]
    fn test_sealed_secret_rejects_other_key() {
        let server = CertificateGenerator::generate_self_signed();
        let impostor = CertificateGenerator::generate_self_signed();

        let sealed = seal_secret(&server.public, b"secret").unwrap();
        assert_eq!(
            open_secret(&impostor.private, &sealed),
            Err(CryptoError::Decryption)
        );
    }

    #[test]
    fn test_session_keys_agree_on_both_sides() {
        let pre_master = generate_pre_master();
        let client_random = generate_random();
        let server_random = generate_random();

        let client_keys = SessionKeys::derive(&pre_master, &client_random, &server_random);
        let server_keys = SessionKeys::derive(&pre_master, &client_random, &server_random);

        let encrypted = server_keys.encrypt(b"certificate set").unwrap();
        assert_eq!(client_keys.decrypt(&encrypted).unwrap(), b"certificate set");
    }

    #[test]
    fn test_session_keys_differ_with_randoms() {
        let pre_master = generate_pre_master();
        let keys = SessionKeys::derive(&pre_master, &generate_random(), &generate_random());
        let other = SessionKeys::derive(&pre_master, &generate_random(), &generate_random());

        let encrypted = keys.encrypt(b"payload").unwrap();
        assert_eq!(other.decrypt(&encrypted), Err(CryptoError::Decryption));
        assert_eq!(keys.decrypt(&encrypted[..4]), Err(CryptoError::Decryption));
    }
}
