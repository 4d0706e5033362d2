use crate::sasl::{MechError, SaslSettings};

/// EXTERNAL relies on authentication already established outside the
/// exchange (usually a client certificate). The single client token names
/// the identity to authorize, or is empty to let the server derive it.
pub struct ExternalClient {
    settings: SaslSettings,
    output_sent: bool,
}

impl ExternalClient {
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
        let identity = self
            .settings
            .authzid
            .as_deref()
            .or(self.settings.authid.as_deref())
            .unwrap_or("");
        self.output_sent = true;
        Ok(identity.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use crate::sasl::{MechError, Mechanism, SaslSettings};

    #[test]
    fn test_prefers_authzid_over_authid() {
        let mut client = Mechanism::External.client(SaslSettings {
            authid: Some("alice".to_string()),
            authzid: Some("bob".to_string()),
            password: None,
        });
        assert_eq!(client.output().unwrap(), b"bob");

        let mut client = Mechanism::External.client(SaslSettings {
            authid: Some("alice".to_string()),
            ..Default::default()
        });
        assert_eq!(client.output().unwrap(), b"alice");

        let mut client = Mechanism::External.client(SaslSettings::default());
        assert!(client.output().unwrap().is_empty());
    }

    #[test]
    fn test_no_password_required() {
        let mut client = Mechanism::External.client(SaslSettings::default());
        client.input(b"").unwrap();
        assert!(client.output().is_ok());
    }

    #[test]
    fn test_input_after_output_rejected() {
        let mut client = Mechanism::External.client(SaslSettings::default());
        client.output().unwrap();
        assert!(matches!(client.input(b""), Err(MechError::Protocol(_))));
    }
}
