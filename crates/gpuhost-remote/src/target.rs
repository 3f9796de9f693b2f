//! Remote host addressing and login credentials

use std::fmt;
use std::path::PathBuf;

/// SSH endpoint of the shared compute host plus the login user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl HostTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// `user@host` as understood by the ssh client
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// How the user authenticates against the host
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Password login, fed to the ssh client through `sshpass -e`
    Password(String),
    /// Private key file
    IdentityFile(PathBuf),
    /// Whatever the local ssh agent offers
    Agent,
}

impl Credentials {
    pub fn password(&self) -> Option<&str> {
        match self {
            Credentials::Password(password) => Some(password),
            _ => None,
        }
    }
}

// Never print the password.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
            Credentials::Agent => f.write_str("Agent"),
        }
    }
}
