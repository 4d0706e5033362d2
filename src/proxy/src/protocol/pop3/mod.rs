use crate::sasl::{MechError, Mechanism, SaslClient, SaslSettings};
use crate::server::{
    DialogStep, FailureKind, LoginDialog, LoginFailure, RedirectTarget, ServerOut,
    SideChannelVerdict, AUTH_FAILED_MSG,
};

use base64::prelude::{Engine, BASE64_STANDARD};
use std::net::IpAddr;
use tracing::error;

pub mod referral;
pub mod xclient;

/// Pre-login states of one proxied POP3 session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    Banner,
    StartTls,
    XClient,
    Login1,
    Login2,
}

/// Everything the dialog needs to log a client in on a backend.
#[derive(Debug, Clone)]
pub struct Pop3LoginSettings {
    /// Virtual user owning the session (post-normalization).
    pub user: String,
    /// Login name sent to the backend.
    pub proxy_user: String,
    pub master_user: Option<String>,
    pub password: String,
    /// `None` selects the USER/PASS dialog.
    pub mechanism: Option<Mechanism>,
    pub require_starttls: bool,
    pub session_id: String,
    /// Remaining hop budget; decremented by redirects, forwarded minus one
    /// in XCLIENT.
    pub session_ttl: u32,
    pub local_name: Option<String>,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub client_secured_tls: bool,
    pub client_trusted: bool,
    pub passdb_fields: Vec<(String, String)>,
}

#[cfg(test)]
impl Pop3LoginSettings {
    pub(crate) fn for_tests() -> Self {
        Self {
            user: "alice".to_string(),
            proxy_user: "alice".to_string(),
            master_user: None,
            password: "s3cret".to_string(),
            mechanism: None,
            require_starttls: false,
            session_id: "a1b2c3".to_string(),
            session_ttl: 5,
            local_name: None,
            client_ip: "192.0.2.7".parse().unwrap(),
            client_port: 51234,
            client_secured_tls: false,
            client_trusted: true,
            passdb_fields: Vec::new(),
        }
    }
}

/// POP3 driver for the proxy engine: banner, optional STLS, optional
/// XCLIENT, then USER/PASS or an AUTH exchange.
pub struct Pop3Login {
    set: Pop3LoginSettings,
    state: Pop3State,
    xclient_capable: bool,
    sasl: Option<SaslClient>,
}

impl Pop3Login {
    pub fn new(set: Pop3LoginSettings) -> Self {
        Self {
            set,
            state: Pop3State::Banner,
            xclient_capable: false,
            sasl: None,
        }
    }

    pub fn settings(&self) -> &Pop3LoginSettings {
        &self.set
    }

    /// Issue XCLIENT (when advertised and trusted) pipelined with the first
    /// login command.
    fn send_login(&mut self, out: &mut ServerOut) -> Result<DialogStep, LoginFailure> {
        if self.set.session_ttl <= 1 {
            return Err(LoginFailure::new(
                FailureKind::RemoteConfig,
                "TTL reached zero - loop?",
            ));
        }
        if self.xclient_capable && self.set.client_trusted {
            out.send_line(&xclient::format_xclient(&self.set));
            self.state = Pop3State::XClient;
        } else {
            self.state = Pop3State::Login1;
        }

        let Some(mechanism) = self.set.mechanism else {
            out.send_line(&format!("USER {}", self.set.proxy_user));
            return Ok(DialogStep::Continue);
        };

        let sasl_settings = SaslSettings {
            authid: Some(
                self.set
                    .master_user
                    .clone()
                    .unwrap_or_else(|| self.set.proxy_user.clone()),
            ),
            authzid: self
                .set
                .master_user
                .is_some()
                .then(|| self.set.proxy_user.clone()),
            password: Some(self.set.password.clone()),
        };
        let mut client = mechanism.client(sasl_settings);
        let initial = client.output().map_err(map_mech_error)?;
        let token = if initial.is_empty() {
            "=".to_string()
        } else {
            BASE64_STANDARD.encode(initial)
        };
        out.send_line(&format!("AUTH {mechanism} {token}"));
        self.sasl = Some(client);
        if self.state != Pop3State::XClient {
            self.state = Pop3State::Login2;
        }
        Ok(DialogStep::Continue)
    }

    /// One server challenge through the mechanism and back.
    fn sasl_step(&mut self, out: &mut ServerOut, challenge: &str) -> Result<(), LoginFailure> {
        let Some(sasl) = self.sasl.as_mut() else {
            return Err(LoginFailure::new(
                FailureKind::Internal,
                "SASL step without active mechanism",
            ));
        };
        let input = BASE64_STANDARD.decode(challenge).map_err(|_| {
            LoginFailure::new(
                FailureKind::Protocol,
                "Server sent invalid base64 in SASL challenge",
            )
        })?;
        sasl.input(&input).map_err(map_mech_error)?;
        let output = sasl.output().map_err(map_mech_error)?;
        out.send_line(&BASE64_STANDARD.encode(output));
        Ok(())
    }

    /// Non-`+OK` reply during login: classify and pick the client reply.
    fn login_failure(&self, line: &str) -> LoginFailure {
        let Some(reason) = line.strip_prefix("-ERR ") else {
            return LoginFailure::new(FailureKind::AuthReplied, line)
                .with_client_reply(format!("-ERR {AUTH_FAILED_MSG}"));
        };
        if reason.starts_with("[SYS/TEMP]") {
            return LoginFailure::new(FailureKind::AuthTempfail, reason).with_client_reply(line);
        }
        if let Some(target) = referral::parse_referral(reason) {
            return LoginFailure::redirect(target);
        }
        LoginFailure::new(FailureKind::AuthReplied, reason).with_client_reply(line)
    }
}

impl LoginDialog for Pop3Login {
    fn reset(&mut self) {
        self.state = Pop3State::Banner;
        self.xclient_capable = false;
        self.sasl = None;
    }

    fn on_server_line(
        &mut self,
        out: &mut ServerOut,
        line: &str,
    ) -> Result<DialogStep, LoginFailure> {
        match self.state {
            Pop3State::Banner => {
                let Some(rest) = line.strip_prefix("+OK") else {
                    return Err(LoginFailure::new(FailureKind::Protocol, "Invalid banner"));
                };
                self.xclient_capable = rest.contains(" [XCLIENT]");
                if self.set.require_starttls {
                    out.send_line("STLS");
                    self.state = Pop3State::StartTls;
                    Ok(DialogStep::Continue)
                } else {
                    self.send_login(out)
                }
            }
            Pop3State::StartTls => {
                if !line.starts_with("+OK") {
                    Err(LoginFailure::new(FailureKind::Remote, "STLS failed"))
                } else {
                    Ok(DialogStep::StartTls)
                }
            }
            Pop3State::XClient => {
                if !line.starts_with("+OK") {
                    Err(LoginFailure::new(FailureKind::Remote, "XCLIENT failed"))
                } else {
                    self.state = if self.sasl.is_none() {
                        Pop3State::Login1
                    } else {
                        Pop3State::Login2
                    };
                    Ok(DialogStep::Continue)
                }
            }
            Pop3State::Login1 => {
                if line.starts_with("+OK") {
                    out.send_line(&format!("PASS {}", self.set.password));
                    self.state = Pop3State::Login2;
                    Ok(DialogStep::Continue)
                } else {
                    Err(self.login_failure(line))
                }
            }
            Pop3State::Login2 => {
                if let Some(challenge) = line.strip_prefix("+ ") {
                    if self.sasl.is_some() {
                        self.sasl_step(out, challenge)?;
                        return Ok(DialogStep::Continue);
                    }
                    return Err(self.login_failure(line));
                }
                if line.starts_with("+OK") {
                    Ok(DialogStep::Detach {
                        client_reply: Some(line.to_string()),
                    })
                } else {
                    Err(self.login_failure(line))
                }
            }
        }
    }

    fn on_tls_established(&mut self, out: &mut ServerOut) -> Result<DialogStep, LoginFailure> {
        self.send_login(out)
    }

    fn hop_limit(&self) -> u32 {
        self.set.session_ttl
    }

    fn on_redirect(&mut self, target: &RedirectTarget) {
        self.set.session_ttl = self.set.session_ttl.saturating_sub(1);
        if let Some(user) = &target.user {
            self.set.proxy_user = user.clone();
        }
    }

    fn on_side_channel(&mut self, args: &[&str]) -> SideChannelVerdict {
        error!(user = %self.set.user, ?args, "Unknown side-channel command from backend");
        SideChannelVerdict::Continue
    }
}

fn map_mech_error(e: MechError) -> LoginFailure {
    match e {
        MechError::AuthFailed(reason) => LoginFailure::new(FailureKind::AuthNotReplied, reason),
        MechError::Protocol(reason) => LoginFailure::new(FailureKind::Protocol, reason),
        MechError::Internal(reason) => LoginFailure::new(FailureKind::Internal, reason),
    }
}
