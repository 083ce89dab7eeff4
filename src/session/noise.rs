//! Noise XX session state machine over `snow`

use std::time::Instant;

use snow::{Builder, HandshakeState, TransportState};

use crate::crypto::StaticKeypair;
use crate::error::{Error, Result};

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Largest buffer a single Noise message can occupy
const NOISE_MAX_MESSAGE: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

pub enum NoiseSessionState {
    HandshakeInProgress {
        handshake_state: Box<HandshakeState>,
    },
    TransportReady {
        transport_state: Box<TransportState>,
    },
    Terminated,
}

/// One peer's Noise session: XX handshake then AEAD transport.
///
/// The caller owns serialization; encrypt/decrypt take `&mut self` so two
/// messages to the same peer can never interleave nonces.
pub struct NoiseSession {
    pub role: NoiseRole,
    state: NoiseSessionState,
    remote_static: Option<[u8; 32]>,
    message_count: u64,
    created: Instant,
    last_activity: Instant,
}

impl NoiseSession {
    pub fn new_initiator(local_static: &StaticKeypair) -> Result<Self> {
        Self::new(local_static, NoiseRole::Initiator)
    }

    pub fn new_responder(local_static: &StaticKeypair) -> Result<Self> {
        Self::new(local_static, NoiseRole::Responder)
    }

    fn new(local_static: &StaticKeypair, role: NoiseRole) -> Result<Self> {
        let params = NOISE_PARAMS
            .parse()
            .map_err(|_| Error::Crypto("bad noise params".into()))?;
        let local_secret_key_bytes = local_static.secret_key_bytes();
        let builder = Builder::new(params).local_private_key(local_secret_key_bytes.as_ref())?;
        let handshake = match role {
            NoiseRole::Initiator => builder.build_initiator()?,
            NoiseRole::Responder => builder.build_responder()?,
        };

        Ok(Self {
            role,
            state: NoiseSessionState::HandshakeInProgress {
                handshake_state: Box::new(handshake),
            },
            remote_static: None,
            message_count: 0,
            created: Instant::now(),
            last_activity: Instant::now(),
        })
    }

    /// Produce the next outbound handshake message
    pub fn write_handshake_message(&mut self) -> Result<Vec<u8>> {
        let buffer = match &mut self.state {
            NoiseSessionState::HandshakeInProgress { handshake_state } => {
                let mut buffer = vec![0u8; NOISE_MAX_MESSAGE];
                let len = handshake_state.write_message(&[], &mut buffer)?;
                buffer.truncate(len);
                self.last_activity = Instant::now();
                buffer
            }
            _ => return Err(Error::InvalidState("handshake already complete".into())),
        };
        // The initiator finishes on writing message 3
        let finished = matches!(
            &self.state,
            NoiseSessionState::HandshakeInProgress { handshake_state }
                if handshake_state.is_handshake_finished()
        );
        if finished {
            self.enter_transport()?;
        }
        Ok(buffer)
    }

    /// Consume an inbound handshake message
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<()> {
        match &mut self.state {
            NoiseSessionState::HandshakeInProgress { handshake_state } => {
                let mut buffer = vec![0u8; NOISE_MAX_MESSAGE];
                handshake_state.read_message(message, &mut buffer)?;
                self.last_activity = Instant::now();
                if handshake_state.is_handshake_finished() {
                    self.enter_transport()?;
                }
                Ok(())
            }
            _ => Err(Error::InvalidState("handshake already complete".into())),
        }
    }

    fn enter_transport(&mut self) -> Result<()> {
        let old_state = std::mem::replace(&mut self.state, NoiseSessionState::Terminated);
        if let NoiseSessionState::HandshakeInProgress { handshake_state } = old_state {
            if let Some(remote) = handshake_state.get_remote_static() {
                let remote: [u8; 32] = remote
                    .try_into()
                    .map_err(|_| Error::Crypto("remote static key size".into()))?;
                self.remote_static = Some(remote);
            }
            let transport = handshake_state.into_transport_mode()?;
            self.state = NoiseSessionState::TransportReady {
                transport_state: Box::new(transport),
            };
        }
        Ok(())
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            NoiseSessionState::TransportReady { transport_state } => {
                let mut buffer = vec![0u8; plaintext.len() + 16];
                let len = transport_state.write_message(plaintext, &mut buffer)?;
                buffer.truncate(len);
                self.message_count += 1;
                self.last_activity = Instant::now();
                Ok(buffer)
            }
            _ => Err(Error::NotEstablished("transport not ready".into())),
        }
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            NoiseSessionState::TransportReady { transport_state } => {
                let mut buffer = vec![0u8; ciphertext.len()];
                let len = transport_state.read_message(ciphertext, &mut buffer)?;
                buffer.truncate(len);
                self.message_count += 1;
                self.last_activity = Instant::now();
                Ok(buffer)
            }
            _ => Err(Error::NotEstablished("transport not ready".into())),
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, NoiseSessionState::TransportReady { .. })
    }

    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, NoiseSessionState::HandshakeInProgress { .. })
    }

    /// Static key the remote proved ownership of during XX
    pub fn remote_static(&self) -> Option<[u8; 32]> {
        self.remote_static
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn idle(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }

    pub fn terminate(&mut self) {
        self.state = NoiseSessionState::Terminated;
    }
}
