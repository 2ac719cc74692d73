//! Identity certificates.
//!
//! A server owns one self-signed root certificate. Every player identity is a
//! certificate pair issued (signed) by the server it first connected to and is
//! presented again on later reconnects to that server.

use crate::error::CryptoError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The public half of an identity: id, public key and the issuer's signature
/// over both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentityCertificate {
    pub id: String,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl PublicIdentityCertificate {
    fn signed_payload(id: &str, public_key: &[u8; 32]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(id.len() + public_key.len());
        payload.extend_from_slice(id.as_bytes());
        payload.extend_from_slice(public_key);
        payload
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.public_key).map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Verifies that `signature` was produced over `data` by the holder of
    /// this certificate's private key.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        self.verifying_key()?
            .verify(data, &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }

    /// Verifies that this certificate was issued by `signer`.
    pub fn verify_signed_by(&self, signer: &PublicIdentityCertificate) -> Result<(), CryptoError> {
        signer.verify(
            &Self::signed_payload(&self.id, &self.public_key),
            &self.signature,
        )
    }

    pub fn verify_self_signed(&self) -> Result<(), CryptoError> {
        self.verify_signed_by(self)
    }
}

/// The private half of an identity. Never leaves the process except inside the
/// encrypted provisioning payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateIdentityCertificate {
    secret_key: [u8; 32],
}

impl PrivateIdentityCertificate {
    pub(crate) fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_key)
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key().sign(data).to_bytes().to_vec()
    }
}

impl fmt::Debug for PrivateIdentityCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateIdentityCertificate(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePair {
    pub public: PublicIdentityCertificate,
    pub private: PrivateIdentityCertificate,
}

impl CertificatePair {
    pub fn id(&self) -> &str {
        &self.public.id
    }
}

/// What a client remembers about a server it has been provisioned by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub server: PublicIdentityCertificate,
    pub identity: CertificatePair,
}

pub struct CertificateGenerator;

impl CertificateGenerator {
    /// Creates a root certificate that signs itself.
    pub fn generate_self_signed() -> CertificatePair {
        let key = SigningKey::generate(&mut OsRng);
        Self::issue(&key, &key)
    }

    /// Creates a new identity signed by `signer`.
    pub fn generate(signer: &PrivateIdentityCertificate) -> CertificatePair {
        let key = SigningKey::generate(&mut OsRng);
        Self::issue(&key, &signer.signing_key())
    }

    fn issue(key: &SigningKey, signer: &SigningKey) -> CertificatePair {
        let id = generate_id();
        let public_key = key.verifying_key().to_bytes();
        let payload = PublicIdentityCertificate::signed_payload(&id, &public_key);
        let signature = signer.sign(&payload).to_bytes().to_vec();

        CertificatePair {
            public: PublicIdentityCertificate {
                id,
                public_key,
                signature,
            },
            private: PrivateIdentityCertificate {
                secret_key: key.to_bytes(),
            },
        }
    }
}

fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_certificate_verifies() {
        let root = CertificateGenerator::generate_self_signed();
        assert!(root.public.verify_self_signed().is_ok());
        assert_eq!(root.id().len(), 32);
    }

    #[test]
    fn test_issued_certificate_verifies_against_issuer_only() {
        let root = CertificateGenerator::generate_self_signed();
        let other_root = CertificateGenerator::generate_self_signed();
        let client = CertificateGenerator::generate(&root.private);

        assert!(client.public.verify_signed_by(&root.public).is_ok());
        assert_eq!(
            client.public.verify_signed_by(&other_root.public),
            Err(CryptoError::VerificationFailed)
        );
        assert!(client.public.verify_self_signed().is_err());
    }

    #[test]
    fn test_tampered_id_fails_verification() {
        let root = CertificateGenerator::generate_self_signed();
        let mut forged = root.public.clone();
        forged.id = "someone-else".to_string();

        assert!(forged.verify_self_signed().is_err());
    }

    #[test]
    fn test_sign_and_verify_data() {
        let pair = CertificateGenerator::generate_self_signed();
        let signature = pair.private.sign(b"hello");

        assert!(pair.public.verify(b"hello", &signature).is_ok());
        assert_eq!(
            pair.public.verify(b"goodbye", &signature),
            Err(CryptoError::VerificationFailed)
        );
        assert_eq!(
            pair.public.verify(b"hello", &signature[..10]),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_private_certificate_debug_is_redacted() {
        let pair = CertificateGenerator::generate_self_signed();
        assert_eq!(format!("{:?}", pair.private), "PrivateIdentityCertificate(..)");
    }
}
