use crate::sasl::{MechError, SaslSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStep {
    Init,
    User,
    Pass,
}

/// LOGIN sends the authid and password in two separate exchanges, each
/// prompted by the server. Server prompts are not inspected; every input
/// simply advances the step.
pub struct LoginClient {
    settings: SaslSettings,
    step: LoginStep,
}

impl LoginClient {
    pub(crate) fn new(settings: SaslSettings) -> Self {
        Self {
            settings,
            step: LoginStep::Init,
        }
    }

    pub fn input(&mut self, _input: &[u8]) -> Result<(), MechError> {
        match self.step {
            LoginStep::Init => {
                self.step = LoginStep::User;
                Ok(())
            }
            LoginStep::User => {
                self.step = LoginStep::Pass;
                Ok(())
            }
            LoginStep::Pass => Err(MechError::Protocol(
                "server didn't finish authentication".to_string(),
            )),
        }
    }

    pub fn output(&mut self) -> Result<Vec<u8>, MechError> {
        match self.step {
            LoginStep::Init => Ok(Vec::new()),
            LoginStep::User => {
                let authid = self
                    .settings
                    .authid
                    .as_deref()
                    .ok_or_else(|| MechError::Internal("authid not set".to_string()))?;
                Ok(authid.as_bytes().to_vec())
            }
            LoginStep::Pass => {
                let password = self
                    .settings
                    .password
                    .as_deref()
                    .ok_or_else(|| MechError::Internal("password not set".to_string()))?;
                Ok(password.as_bytes().to_vec())
            }
        }
    }
}
