use sha3::{Digest, Sha3_512};

/// Raw input to the embryo derivation: the Diffie-Hellman shared material the
/// external key-exchange module negotiated, plus both peers' salt pairs.
///
/// Both sides observe identical values during the handshake, so both derive
/// the identical [`Embryo`] without it ever crossing the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMaterial {
    pub client_salt: u64,
    pub server_salt: u64,
    /// Diffie-Hellman derived shared secret.
    pub material: Vec<u8>,
    pub client_salt2: u64,
    pub server_salt2: u64,
}

/// The derived per-connection secret: internal salt, connection id, AES key
/// and IV base. Computed once per handshake, immutable for the connection's
/// lifetime, irreversible.
#[derive(Clone)]
pub struct Embryo {
    pub salt: u64,
    pub connection_id: u64,
    pub key: [u8; 32],
    pub iv: [u8; 16],
}

impl Embryo {
    /// `Sha3-512(clientSalt || serverSalt || material || clientSalt2 || serverSalt2)`,
    /// split as 8 bytes salt, 8 bytes connection id, 32 bytes key, 16 bytes IV base.
    pub fn derive(material: &HandshakeMaterial) -> Embryo {
        let mut hasher = Sha3_512::new();
        hasher.update(material.client_salt.to_le_bytes());
        hasher.update(material.server_salt.to_le_bytes());
        hasher.update(&material.material);
        hasher.update(material.client_salt2.to_le_bytes());
        hasher.update(material.server_salt2.to_le_bytes());
        let digest = hasher.finalize();

        let mut salt = [0u8; 8];
        salt.copy_from_slice(&digest[0..8]);
        let mut connection_id = [0u8; 8];
        connection_id.copy_from_slice(&digest[8..16]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[16..48]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[48..64]);

        Embryo {
            salt: u64::from_le_bytes(salt),
            connection_id: u64::from_le_bytes(connection_id),
            key,
            iv,
        }
    }
}

impl std::fmt::Debug for Embryo {
    // key and IV are secrets and must not end up in logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embryo")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}
