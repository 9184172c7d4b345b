//! A reliable, encrypted, multiplexed transport protocol built directly on
//!  UDP datagrams - functionally a custom QUIC-like layer.
//!
//! ## Design goals
//!
//! * The abstraction is sending *transmissions*: defined-length messages
//!    ("blocks") or long-running windowed transfers ("streams"), as opposed
//!    to a raw byte stream
//!   * a transmission is split into fixed-size addressable fragments
//!      ("genes"), each independently sent, acknowledged and retransmitted
//!   * out-of-order UDP delivery is tolerated - genes are reassembled by
//!      position, not arrival order
//! * Many logical connections are multiplexed over a single pair of UDP
//!    ports, demultiplexed by a 64-bit connection id that is *derived* from
//!    handshake material rather than chosen by either side
//! * All packets are AES-256-CBC encrypted under a per-connection key. The
//!    16-byte packet header travels in the clear for routing; everything
//!    after it is ciphertext
//!   * the IV is never transmitted: every packet carries a random 32-bit
//!      salt, and the IV is the connection's base IV with its low 4 bytes
//!      replaced by that salt
//! * Acknowledgments are aggregated: closely spaced receptions are batched
//!    for a short ack delay and range-compressed into few packets; a fully
//!    received transmission is acknowledged with a single "burst" marker
//! * Congestion control bounds in-flight genes per connection (Cubic window
//!    growth with a resend-rate loss signal); a terminal-wide fair scheduler
//!    round-robins connections so no peer starves another
//! * Key exchange is external by design. The host performs whatever
//!    handshake it wants; this crate only turns the resulting shared
//!    material into a symmetric cipher context (the "embryo")
//!
//! ## Packet structure
//!
//! ```ascii
//!  0: salt (u32 LE) - fresh random per packet, feeds the IV derivation
//!  4: engagement (u16 LE) - routing/versioning tag
//!  6: packet type (u16 LE) - values below 8 route to server-side lookup,
//!      values at/above route to client-side lookup
//!  8: connection id (u64 LE)
//! 16: AES-256-CBC ciphertext (PKCS7 padded): a 2-byte frame type
//!      discriminator followed by the frame body
//! ```
//!
//! ## Wiring
//!
//! The crate owns no socket and no timer. The host binds a UDP socket,
//! forwards every received datagram to
//! [`terminal::ConnectionTerminal::process_receive`], and drives
//! [`terminal::ConnectionTerminal::process_send`] on a short periodic tick
//! (order of 1ms) plus [`terminal::ConnectionTerminal::clean`] on a coarser
//! one.

pub mod ack_buffer;
pub mod agreement;
pub mod cipher;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod dispatcher;
pub mod embryo;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod net_sender;
mod packet_header;
pub mod receive_transmission;
pub mod rtt;
pub mod send_transmission;
pub mod terminal;

pub use packet_header::{PacketHeader, PacketType};
