//! Endpoint role, which decides masking direction.

/// Which side of the connection a codec component acts for.
///
/// The engine itself is always [`Role::Client`]. [`Role::Server`] exists so the
/// same decoder can read what the engine writes, which the mock transport and
/// the tests rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

impl Role {
    /// Clients mask every frame they send.
    #[inline]
    #[must_use]
    pub const fn must_mask(&self) -> bool {
        matches!(self, Role::Client)
    }

    /// Servers only accept masked frames; clients only unmasked ones.
    #[inline]
    #[must_use]
    pub const fn expects_masked(&self) -> bool {
        matches!(self, Role::Server)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}
