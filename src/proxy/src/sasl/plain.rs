use crate::sasl::{MechError, SaslSettings};

/// PLAIN completes in a single exchange: the client token carries the
/// authorization identity, authentication identity and password separated by
/// NUL bytes. An unset authzid contributes nothing before the first NUL.
pub struct PlainClient {
    settings: SaslSettings,
    output_sent: bool,
}

impl PlainClient {
    pub(crate) fn new(settings: SaslSettings) -> Self {
        Self {
            settings,
            output_sent: false,
        }
    }

    pub fn input(&mut self, input: &[u8]) -> Result<(), MechError> {
        if self.output_sent {
            Err(MechError::Protocol(
                "server didn't finish authentication".to_string(),
            ))
        } else if !input.is_empty() {
            Err(MechError::Protocol(
                "server sent non-empty initial response".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn output(&mut self) -> Result<Vec<u8>, MechError> {
        let authid = self
            .settings
            .authid
            .as_deref()
            .ok_or_else(|| MechError::Internal("authid not set".to_string()))?;
        let password = self
            .settings
            .password
            .as_deref()
            .ok_or_else(|| MechError::Internal("password not set".to_string()))?;

        let mut token = Vec::new();
        if let Some(authzid) = self.settings.authzid.as_deref() {
            token.extend_from_slice(authzid.as_bytes());
        }
        token.push(b'\0');
        token.extend_from_slice(authid.as_bytes());
        token.push(b'\0');
        token.extend_from_slice(password.as_bytes());
        self.output_sent = true;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use crate::sasl::{MechError, Mechanism, SaslSettings};

    fn settings(authzid: Option<&str>) -> SaslSettings {
        SaslSettings {
            authid: Some("alice".to_string()),
            authzid: authzid.map(str::to_string),
            password: Some("s3cret".to_string()),
        }
    }

    #[test]
    fn test_single_exchange_token() {
        let mut client = Mechanism::Plain.client(settings(Some("master")));
        client.input(b"").unwrap();
        assert_eq!(client.output().unwrap(), b"master\0alice\0s3cret");
    }

    #[test]
    fn test_unset_authzid_writes_nothing_before_first_nul() {
        let mut client = Mechanism::Plain.client(settings(None));
        assert_eq!(client.output().unwrap(), b"\0alice\0s3cret");
    }

    #[test]
    fn test_nonempty_initial_response_rejected() {
        let mut client = Mechanism::Plain.client(settings(None));
        assert!(matches!(
            client.input(b"unexpected"),
            Err(MechError::Protocol(_))
        ));
    }

    #[test]
    fn test_input_after_output_rejected() {
        let mut client = Mechanism::Plain.client(settings(None));
        client.output().unwrap();
        assert!(matches!(client.input(b""), Err(MechError::Protocol(_))));
    }

    #[test]
    fn test_missing_credentials() {
        let mut no_password = Mechanism::Plain.client(SaslSettings {
            authid: Some("alice".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            no_password.output(),
            Err(MechError::Internal(_))
        ));

        let mut no_authid = Mechanism::Plain.client(SaslSettings {
            password: Some("s3cret".to_string()),
            ..Default::default()
        });
        assert!(matches!(no_authid.output(), Err(MechError::Internal(_))));
    }
}
