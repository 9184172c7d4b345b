use crate::agreement::ConnectionAgreement;
use crate::embryo::HandshakeMaterial;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Everything an established handshake produced: the raw material the embryo
/// is derived from, and the agreement both sides settled on.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub material: HandshakeMaterial,
    pub agreement: ConnectionAgreement,
}

/// Key exchange is deliberately external: this core neither performs nor
/// constrains it. The host wires in whatever mechanism it uses (TLS-tunneled,
/// pre-shared, out-of-band) as long as both sides end up with the same
/// [`HandshakeMaterial`].
#[async_trait]
pub trait Handshaker: Send + Sync + 'static {
    /// Runs the client side of a handshake with `peer`. An `Err` is surfaced
    /// to the connecting caller as a rejection.
    async fn handshake_as_client(&self, peer: SocketAddr) -> anyhow::Result<HandshakeOutcome>;
}
