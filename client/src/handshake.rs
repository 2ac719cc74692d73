//! Client side of the identity handshake.
//!
//! The server speaks first. On a server we have no identity for, the client
//! seals a fresh pre-master secret to the server's certificate and receives a
//! newly issued certificate pair encrypted under the derived keys. On a known
//! server the client presents its certificate, signs both hellos, and checks
//! the server's countersignature over the same bytes.

use crate::identity_store::IdentityStore;
use log::{debug, info, warn};
use shared::crypto::{generate_pre_master, generate_random, seal_secret, SessionKeys};
use shared::error::{CryptoError, ProtocolError};
use shared::identity::{CertificatePair, ClientIdentity, PublicIdentityCertificate};
use shared::protocol::{HandshakeHello, Payload};
use shared::{get_timestamp, NetMessage};

enum State {
    AwaitingServerHello,
    AwaitingProvision {
        keys: SessionKeys,
        server: PublicIdentityCertificate,
    },
    AwaitingVerification {
        signed: Vec<u8>,
        server: PublicIdentityCertificate,
    },
    Done,
}

#[derive(Debug)]
pub enum HandshakeStep {
    Reply(Vec<NetMessage>),
    /// The server is authenticated and we hold a certificate it issued.
    Done { server: PublicIdentityCertificate },
}

pub struct ClientHandshake {
    state: State,
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingServerHello,
        }
    }

    pub fn on_message(
        &mut self,
        message: NetMessage,
        identities: &mut dyn IdentityStore,
    ) -> Result<HandshakeStep, ProtocolError> {
        let state = std::mem::replace(&mut self.state, State::Done);
        match (state, message.payload) {
            (State::AwaitingServerHello, Payload::HandshakeHello(server_hello)) => {
                self.on_server_hello(server_hello, &*identities)
            }
            (State::AwaitingProvision { keys, server }, Payload::ProvisionIdentity { encrypted_certificates }) => {
                let payload = keys.decrypt(&encrypted_certificates)?;
                let identity: CertificatePair =
                    bincode::deserialize(&payload).map_err(|_| CryptoError::MalformedPayload)?;
                identity.public.verify_signed_by(&server).map_err(|_| {
                    ProtocolError::Authentication("provisioned certificate was not issued by the server".into())
                })?;

                info!("Received new identity {} from server {}", identity.id(), server.id);
                identities.save(ClientIdentity {
                    server: server.clone(),
                    identity,
                })?;
                Ok(HandshakeStep::Done { server })
            }
            (State::AwaitingVerification { signed, server }, Payload::HandshakeVerification { signature }) => {
                server.verify(&signed, &signature)?;
                debug!("Server {} countersigned the handshake", server.id);
                Ok(HandshakeStep::Done { server })
            }
            (_, other) => Err(ProtocolError::UnexpectedMessage(other.name())),
        }
    }

    fn on_server_hello(
        &mut self,
        server_hello: HandshakeHello,
        identities: &dyn IdentityStore,
    ) -> Result<HandshakeStep, ProtocolError> {
        let server = server_hello.certificate.clone();
        server
            .verify_self_signed()
            .map_err(|_| ProtocolError::Authentication("server certificate is not self-signed".into()))?;

        let known = match identities.load(&server.id) {
            Some(identity) if identity.server == server => Some(identity),
            Some(_) => {
                warn!("Stored certificate for server {} does not match, requesting a new identity", server.id);
                None
            }
            None => None,
        };

        match known {
            Some(identity) => {
                let client_hello = HandshakeHello {
                    random: generate_random(),
                    certificate: identity.identity.public.clone(),
                    timestamp: get_timestamp(),
                };
                let signed = HandshakeHello::signing_bytes(&server_hello, &client_hello)?;
                let signature = identity.identity.private.sign(&signed);
                self.state = State::AwaitingVerification { signed, server };

                Ok(HandshakeStep::Reply(vec![
                    NetMessage::new(Payload::HandshakeHello(client_hello)),
                    NetMessage::new(Payload::HandshakeVerification { signature }),
                ]))
            }
            None => {
                let pre_master = generate_pre_master();
                let random = generate_random();
                let sealed = seal_secret(&server, &pre_master)?;
                let keys = SessionKeys::derive(&pre_master, &random, &server_hello.random);
                self.state = State::AwaitingProvision { keys, server };

                Ok(HandshakeStep::Reply(vec![NetMessage::new(Payload::NewIdentityRequest {
                    pre_master: sealed,
                    random,
                })]))
            }
        }
    }
}
