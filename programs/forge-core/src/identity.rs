use std::fmt;
use std::str::FromStr;

use anchor_lang::prelude::{borsh, AnchorDeserialize, AnchorSerialize, Pubkey};

use crate::error::{ForgeError, ForgeResult};

/// Canonical signer identity. Built once at the boundary and passed
/// explicitly into every engine call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AnchorSerialize, AnchorDeserialize,
)]
pub struct Identity(Pubkey);

impl Identity {
    pub const fn new(key: Pubkey) -> Self {
        Identity(key)
    }

    pub fn pubkey(&self) -> Pubkey {
        self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> ForgeResult<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            ForgeError::InvalidIdentity(format!("identity must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Identity(Pubkey::new_from_array(array)))
    }
}

impl From<Pubkey> for Identity {
    fn from(key: Pubkey) -> Self {
        Identity(key)
    }
}

impl FromStr for Identity {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pubkey::from_str(s.trim())
            .map(Identity)
            .map_err(|e| ForgeError::InvalidIdentity(format!("{:?}: {}", s, e)))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One source that may know the current signer.
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;
    fn current(&self) -> Option<Identity>;
}

/// Resolves the signer by asking each provider in registration order.
#[derive(Default)]
pub struct IdentityChain {
    providers: Vec<Box<dyn IdentityProvider>>,
}

impl IdentityChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl IdentityProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn resolve(&self) -> Option<Identity> {
        self.providers.iter().find_map(|provider| {
            let found = provider.current();
            if let Some(identity) = found {
                tracing::debug!(source = provider.name(), %identity, "resolved signer identity");
            }
            found
        })
    }
}

/// Provider backed by a fixed key, e.g. a configured operator.
pub struct FixedIdentity {
    name: String,
    identity: Option<Identity>,
}

impl FixedIdentity {
    pub fn new(name: impl Into<String>, identity: Option<Identity>) -> Self {
        Self {
            name: name.into(),
            identity,
        }
    }
}

impl IdentityProvider for FixedIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> Option<Identity> {
        self.identity
    }
}
