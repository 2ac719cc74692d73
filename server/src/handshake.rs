//! Server side of the identity handshake.
//!
//! The server opens with a hello carrying a fresh random and its root
//! certificate. A new client answers with a sealed pre-master secret and gets
//! a freshly issued certificate pair back, encrypted under the derived session
//! keys. A returning client answers with its own hello plus a signature over
//! both hellos, and the server countersigns the same bytes.

use log::{debug, info};
use shared::crypto::{generate_random, open_secret, SealedSecret, SessionKeys};
use shared::error::{CryptoError, ProtocolError};
use shared::identity::{CertificateGenerator, CertificatePair, PublicIdentityCertificate};
use shared::protocol::{HandshakeHello, Payload};
use shared::{get_timestamp, NetMessage};

#[derive(Debug)]
enum State {
    Start,
    AwaitingClient { server_hello: HandshakeHello },
    AwaitingVerification {
        server_hello: HandshakeHello,
        client_hello: HandshakeHello,
    },
    Done,
}

/// Result of feeding one message to the handshake.
#[derive(Debug)]
pub enum HandshakeStep {
    Reply(Vec<NetMessage>),
    /// The peer is authenticated; `replies` must be sent before moving on.
    Done {
        replies: Vec<NetMessage>,
        peer: PublicIdentityCertificate,
    },
}

#[derive(Debug)]
pub struct ServerHandshake {
    identity: CertificatePair,
    state: State,
}

impl ServerHandshake {
    pub fn new(identity: CertificatePair) -> Self {
        Self {
            identity,
            state: State::Start,
        }
    }

    /// Produces the server hello. Called once when the connection opens.
    pub fn start(&mut self) -> NetMessage {
        let hello = HandshakeHello {
            random: generate_random(),
            certificate: self.identity.public.clone(),
            timestamp: get_timestamp(),
        };
        self.state = State::AwaitingClient {
            server_hello: hello.clone(),
        };
        NetMessage::new(Payload::HandshakeHello(hello))
    }

    pub fn on_message(&mut self, message: NetMessage) -> Result<HandshakeStep, ProtocolError> {
        let state = std::mem::replace(&mut self.state, State::Done);
        match (state, message.payload) {
            (State::AwaitingClient { server_hello }, Payload::NewIdentityRequest { pre_master, random }) => {
                self.provision_identity(&server_hello, &pre_master, random)
            }
            (State::AwaitingClient { server_hello }, Payload::HandshakeHello(client_hello)) => {
                debug!("Client {} presented a certificate", client_hello.certificate.id);
                self.state = State::AwaitingVerification {
                    server_hello,
                    client_hello,
                };
                Ok(HandshakeStep::Reply(Vec::new()))
            }
            (
                State::AwaitingVerification {
                    server_hello,
                    client_hello,
                },
                Payload::HandshakeVerification { signature },
            ) => self.verify_client(&server_hello, client_hello, &signature),
            (_, other) => Err(ProtocolError::UnexpectedMessage(other.name())),
        }
    }

    fn provision_identity(
        &mut self,
        server_hello: &HandshakeHello,
        sealed: &SealedSecret,
        client_random: [u8; 32],
    ) -> Result<HandshakeStep, ProtocolError> {
        let pre_master = open_secret(&self.identity.private, sealed)?;
        let keys = SessionKeys::derive(&pre_master, &client_random, &server_hello.random);

        let client_identity = CertificateGenerator::generate(&self.identity.private);
        let payload = bincode::serialize(&client_identity).map_err(|_| CryptoError::MalformedPayload)?;
        let encrypted_certificates = keys.encrypt(&payload)?;

        info!("Issued new identity {}", client_identity.id());
        Ok(HandshakeStep::Done {
            replies: vec![NetMessage::new(Payload::ProvisionIdentity {
                encrypted_certificates,
            })],
            peer: client_identity.public,
        })
    }

    fn verify_client(
        &mut self,
        server_hello: &HandshakeHello,
        client_hello: HandshakeHello,
        signature: &[u8],
    ) -> Result<HandshakeStep, ProtocolError> {
        let certificate = client_hello.certificate.clone();
        certificate.verify_signed_by(&self.identity.public).map_err(|_| {
            ProtocolError::Authentication(format!(
                "certificate {} was not issued by this server",
                certificate.id
            ))
        })?;

        let data = HandshakeHello::signing_bytes(server_hello, &client_hello)?;
        certificate.verify(&data, signature)?;

        debug!("Verified returning client {}", certificate.id);
        Ok(HandshakeStep::Done {
            replies: vec![NetMessage::new(Payload::HandshakeVerification {
                signature: self.identity.private.sign(&data),
            })],
            peer: certificate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::crypto::{generate_pre_master, seal_secret};
    use shared::error::ErrorKind;

    fn server_hello(message: &NetMessage) -> HandshakeHello {
        match &message.payload {
            Payload::HandshakeHello(hello) => hello.clone(),
            other => panic!("expected hello, got {}", other.name()),
        }
    }

    #[test]
    fn test_new_identity_is_provisioned() {
        let root = CertificateGenerator::generate_self_signed();
        let mut handshake = ServerHandshake::new(root.clone());
        let hello = server_hello(&handshake.start());

        let pre_master = generate_pre_master();
        let client_random = generate_random();
        let request = NetMessage::new(Payload::NewIdentityRequest {
            pre_master: seal_secret(&hello.certificate, &pre_master).unwrap(),
            random: client_random,
        });

        let HandshakeStep::Done { replies, peer } = handshake.on_message(request).unwrap() else {
            panic!("handshake should be done");
        };
        let Payload::ProvisionIdentity { encrypted_certificates } = &replies[0].payload else {
            panic!("expected provisioning");
        };

        let keys = SessionKeys::derive(&pre_master, &client_random, &hello.random);
        let pair: CertificatePair = bincode::deserialize(&keys.decrypt(encrypted_certificates).unwrap()).unwrap();
        assert_eq!(pair.public, peer);
        assert!(peer.verify_signed_by(&root.public).is_ok());
    }

    #[test]
    fn test_returning_client_is_verified() {
        let root = CertificateGenerator::generate_self_signed();
        let client = CertificateGenerator::generate(&root.private);
        let mut handshake = ServerHandshake::new(root.clone());
        let hello = server_hello(&handshake.start());

        let client_hello = HandshakeHello {
            random: generate_random(),
            certificate: client.public.clone(),
            timestamp: 1,
        };
        let data = HandshakeHello::signing_bytes(&hello, &client_hello).unwrap();

        handshake
            .on_message(NetMessage::new(Payload::HandshakeHello(client_hello)))
            .unwrap();
        let step = handshake
            .on_message(NetMessage::new(Payload::HandshakeVerification {
                signature: client.private.sign(&data),
            }))
            .unwrap();

        let HandshakeStep::Done { replies, peer } = step else {
            panic!("handshake should be done");
        };
        assert_eq!(peer, client.public);
        let Payload::HandshakeVerification { signature } = &replies[0].payload else {
            panic!("expected countersignature");
        };
        assert!(root.public.verify(&data, signature).is_ok());
    }

    #[test]
    fn test_foreign_certificate_is_rejected() {
        let root = CertificateGenerator::generate_self_signed();
        let other_root = CertificateGenerator::generate_self_signed();
        let client = CertificateGenerator::generate(&other_root.private);
        let mut handshake = ServerHandshake::new(root);
        let hello = server_hello(&handshake.start());

        let client_hello = HandshakeHello {
            random: generate_random(),
            certificate: client.public.clone(),
            timestamp: 1,
        };
        let data = HandshakeHello::signing_bytes(&hello, &client_hello).unwrap();
        handshake
            .on_message(NetMessage::new(Payload::HandshakeHello(client_hello)))
            .unwrap();

        let err = handshake
            .on_message(NetMessage::new(Payload::HandshakeVerification {
                signature: client.private.sign(&data),
            }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let root = CertificateGenerator::generate_self_signed();
        let client = CertificateGenerator::generate(&root.private);
        let mut handshake = ServerHandshake::new(root);
        handshake.start();

        handshake
            .on_message(NetMessage::new(Payload::HandshakeHello(HandshakeHello {
                random: generate_random(),
                certificate: client.public.clone(),
                timestamp: 1,
            })))
            .unwrap();
        let err = handshake
            .on_message(NetMessage::new(Payload::HandshakeVerification {
                signature: client.private.sign(b"something else"),
            }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_out_of_order_message_is_rejected() {
        let mut handshake = ServerHandshake::new(CertificateGenerator::generate_self_signed());
        handshake.start();

        let err = handshake
            .on_message(NetMessage::new(Payload::ServerInfoRequest))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage("ServerInfoRequest")));
    }
}
