use bitflags::bitflags;
use std::fmt;
use strum_macros::Display;
use thiserror::Error;

pub mod engine;
pub mod login_proxy;
pub mod notify;
pub mod proxy_cli_args;
pub mod pump;
pub mod rawlog;
pub mod stream;

/// Interval between reconnect attempts against the same destination.
pub const PROXY_CONNECT_RETRY_MSECS: u64 = 1000;
/// Cap on the client-side send buffer once detached, so a slow client
/// pushes back on the server instead of ballooning memory.
pub const PROXY_MAX_OUTBUF: usize = 1024;
/// Grace given to detached sessions during process shutdown.
pub const DIE_IDLE_SECS: u64 = 2;
/// Revisiting a redirect target this many times is a definite loop.
pub const REDIRECT_LOOP_MIN: u32 = 2;

pub const KILL_PREFIX: &str = "Disconnected by proxy: ";
pub const AUTH_FAILED_MSG: &str = "[AUTH] Authentication failed.";
pub const PROXY_FAILURE_MSG: &str = "[SYS/TEMP] Account is temporarily unavailable.";

bitflags! {
    /// TLS posture toward the backend. `STARTTLS` upgrades after the
    /// banner, `YES` alone wraps the connection immediately; `ANY_CERT`
    /// accepts invalid certificates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SslFlags: u8 {
        const YES = 0b001;
        const STARTTLS = 0b010;
        const ANY_CERT = 0b100;
    }
}

/// Classification of a pre-login failure. The client-facing layer maps these
/// to user-visible replies; the engine uses them to decide on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Connect,
    Internal,
    InternalConfig,
    Remote,
    RemoteConfig,
    Protocol,
    AuthReplied,
    AuthNotReplied,
    AuthTempfail,
    AuthRedirect,
}

impl FailureKind {
    /// Whether the engine may schedule another connect for this failure,
    /// budget permitting.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Connect
                | FailureKind::Remote
                | FailureKind::Protocol
                | FailureKind::AuthTempfail
        )
    }
}

/// Where a referral reply points the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {reason}")]
pub struct LoginFailure {
    pub kind: FailureKind,
    pub reason: String,
    /// Reply the client should eventually see. `None` means the generic
    /// proxy-failure reply applies once the failure is final.
    pub client_reply: Option<String>,
    pub redirect: Option<RedirectTarget>,
}

impl LoginFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            client_reply: None,
            redirect: None,
        }
    }

    pub fn with_client_reply(mut self, reply: impl Into<String>) -> Self {
        self.client_reply = Some(reply.into());
        self
    }

    pub fn redirect(target: RedirectTarget) -> Self {
        let reason = target.to_string();
        Self {
            kind: FailureKind::AuthRedirect,
            reason,
            client_reply: None,
            redirect: Some(target),
        }
    }
}

/// What the dialog driver wants the engine to do after consuming one
/// server line.
#[derive(Debug, PartialEq, Eq)]
pub enum DialogStep {
    /// Flush pending output and keep reading.
    Continue,
    /// Flush pending output, upgrade the server connection to TLS, then
    /// call [`LoginDialog::on_tls_established`].
    StartTls,
    /// Pre-login is complete; forward `client_reply` (if any) and hand both
    /// sides to the pump.
    Detach { client_reply: Option<String> },
}

/// Driver verdict for one side-channel message.
#[derive(Debug, PartialEq, Eq)]
pub enum SideChannelVerdict {
    Continue,
    Disconnect(String),
}

/// Buffered server-bound output written by the dialog driver and flushed by
/// the engine after every step.
#[derive(Debug, Default)]
pub struct ServerOut {
    buf: Vec<u8>,
}

impl ServerOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_line(&mut self, line: &str) {
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// A protocol-specific pre-login driver plugged into the proxy engine. The
/// engine feeds it one server line at a time and executes the returned step;
/// the driver never touches sockets itself.
pub trait LoginDialog: Send {
    /// Forget all dialog progress; called before every (re)connect.
    fn reset(&mut self);

    fn on_server_line(
        &mut self,
        out: &mut ServerOut,
        line: &str,
    ) -> Result<DialogStep, LoginFailure>;

    /// Invoked once the TLS handshake requested via [`DialogStep::StartTls`]
    /// has completed and the streams are swapped.
    fn on_tls_established(&mut self, out: &mut ServerOut) -> Result<DialogStep, LoginFailure>;

    fn on_side_channel(&mut self, args: &[&str]) -> SideChannelVerdict;

    /// Remaining hop budget of the session.
    fn hop_limit(&self) -> u32;

    /// The engine accepted a redirect: one hop is consumed and the login
    /// identity may change with it.
    fn on_redirect(&mut self, target: &RedirectTarget);
}

/// RFC 1035-shaped hostname check used for `local_name` validation and the
/// XCLIENT DESTNAME key.
pub fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Connect.retryable());
        assert!(FailureKind::Remote.retryable());
        assert!(FailureKind::Protocol.retryable());
        assert!(FailureKind::AuthTempfail.retryable());
        assert!(!FailureKind::Internal.retryable());
        assert!(!FailureKind::InternalConfig.retryable());
        assert!(!FailureKind::RemoteConfig.retryable());
        assert!(!FailureKind::AuthReplied.retryable());
        assert!(!FailureKind::AuthNotReplied.retryable());
        assert!(!FailureKind::AuthRedirect.retryable());
    }

    #[test]
    fn test_redirect_target_display() {
        let target = RedirectTarget {
            user: Some("alice".to_string()),
            host: "mail.example.com".to_string(),
            port: Some(110),
        };
        assert_eq!(target.to_string(), "alice@mail.example.com:110");

        let v6 = RedirectTarget {
            user: None,
            host: "2001:db8::1".to_string(),
            port: None,
        };
        assert_eq!(v6.to_string(), "[2001:db8::1]");
    }

    #[test]
    fn test_dns_name_validation() {
        assert!(is_valid_dns_name("mail.example.com"));
        assert!(is_valid_dns_name("localhost"));
        assert!(!is_valid_dns_name(""));
        assert!(!is_valid_dns_name("-leading.example.com"));
        assert!(!is_valid_dns_name("trailing-.example.com"));
        assert!(!is_valid_dns_name("under_score.example.com"));
        assert!(!is_valid_dns_name("double..dot"));
    }
}
