use bitflags::bitflags;
use std::str::FromStr;
use strum_macros::{Display, EnumString};
use thiserror::Error;

pub mod external;
pub mod login;
pub mod plain;

use external::ExternalClient;
use login::LoginClient;
use plain::PlainClient;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MechFlags: u8 {
        /// The mechanism authenticates without a password (EXTERNAL).
        const NO_PASSWORD = 0b0001;
    }
}

/// Outcome of a single mechanism step. `Ok` means the step was accepted and
/// the exchange may continue or has completed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MechError {
    #[error("{0}")]
    AuthFailed(String),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Internal(String),
}

/// Credentials handed to a client mechanism. `authid` is who logs in,
/// `authzid` who the login acts on behalf of (master-user setups).
#[derive(Debug, Clone, Default)]
pub struct SaslSettings {
    pub authid: Option<String>,
    pub authzid: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive, serialize_all = "UPPERCASE")]
pub enum Mechanism {
    Plain,
    Login,
    External,
}

impl Mechanism {
    /// Case-insensitive lookup by mechanism name.
    pub fn lookup(name: &str) -> Option<Mechanism> {
        Mechanism::from_str(name).ok()
    }

    pub fn flags(self) -> MechFlags {
        match self {
            Mechanism::External => MechFlags::NO_PASSWORD,
            _ => MechFlags::empty(),
        }
    }

    pub fn client(self, settings: SaslSettings) -> SaslClient {
        match self {
            Mechanism::Plain => SaslClient::Plain(PlainClient::new(settings)),
            Mechanism::Login => SaslClient::Login(LoginClient::new(settings)),
            Mechanism::External => SaslClient::External(ExternalClient::new(settings)),
        }
    }
}

/// Per-session client state of one mechanism.
pub enum SaslClient {
    Plain(PlainClient),
    Login(LoginClient),
    External(ExternalClient),
}

impl SaslClient {
    /// Consume the latest server-to-client token.
    pub fn input(&mut self, input: &[u8]) -> Result<(), MechError> {
        match self {
            SaslClient::Plain(c) => c.input(input),
            SaslClient::Login(c) => c.input(input),
            SaslClient::External(c) => c.input(input),
        }
    }

    /// Produce the next client-to-server token (possibly empty).
    pub fn output(&mut self) -> Result<Vec<u8>, MechError> {
        match self {
            SaslClient::Plain(c) => c.output(),
            SaslClient::Login(c) => c.output(),
            SaslClient::External(c) => c.output(),
        }
    }
}
