use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Config, DefaultProvider, EnvDefaults, Protocol, ServerSettings, SettingsHandle, Timeouts};
use crate::mail::imap::ImapMailbox;
use crate::mail::pop3::Pop3Mailbox;
use crate::mail::smtp::Mailer;
use crate::mail::Ack;

/// Replacement settings for any subset of the protocols.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub smtp: Option<ServerSettings>,
    pub imap: Option<ServerSettings>,
    pub pop3: Option<ServerSettings>,
}

/// One entry point for all three protocols.
///
/// Each protocol keeps its own settings handle, so [`MailClient::configure`]
/// can swap them while operations are running; the change is picked up by
/// the next session.
pub struct MailClient {
    imap: ImapMailbox,
    pop3: Pop3Mailbox,
    smtp: Mailer,
}

impl MailClient {
    /// Settings from `config`, gaps filled from the process environment.
    pub fn new(config: &Config) -> Self {
        Self::with_defaults(config, Arc::new(EnvDefaults))
    }

    pub fn with_defaults(config: &Config, defaults: Arc<dyn DefaultProvider>) -> Self {
        let handle = |protocol, settings: &ServerSettings| {
            SettingsHandle::new(protocol, settings.clone(), Arc::clone(&defaults))
        };
        Self {
            imap: ImapMailbox::new(handle(Protocol::Imap, &config.imap)),
            pop3: Pop3Mailbox::new(handle(Protocol::Pop3, &config.pop3)),
            smtp: Mailer::new(handle(Protocol::Smtp, &config.smtp)),
        }
    }

    pub fn with_timeouts(self, timeouts: Timeouts) -> Self {
        Self {
            imap: self.imap.with_timeouts(timeouts),
            pop3: self.pop3.with_timeouts(timeouts),
            smtp: self.smtp.with_timeouts(timeouts),
        }
    }

    pub fn imap(&self) -> &ImapMailbox {
        &self.imap
    }

    pub fn pop3(&self) -> &Pop3Mailbox {
        &self.pop3
    }

    pub fn smtp(&self) -> &Mailer {
        &self.smtp
    }

    pub fn configure(&self, update: ConfigUpdate) -> Ack {
        let mut changed = Vec::new();
        if let Some(s) = update.smtp {
            self.smtp.settings().configure(s);
            changed.push("smtp");
        }
        if let Some(s) = update.imap {
            self.imap.settings().configure(s);
            changed.push("imap");
        }
        if let Some(s) = update.pop3 {
            self.pop3.settings().configure(s);
            changed.push("pop3");
        }

        info!(?changed, "configuration updated");
        if changed.is_empty() {
            Ack::with_message("nothing to update")
        } else {
            Ack::with_message(format!("updated {}", changed.join(", ")))
        }
    }

    /// Snapshot of the explicit settings, without environment fallbacks.
    /// This is what gets written back to the settings file.
    pub fn current_config(&self) -> Config {
        Config {
            smtp: self.smtp.settings().current(),
            imap: self.imap.settings().current(),
            pop3: self.pop3.settings().current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn client() -> MailClient {
        let defaults: HashMap<String, String> = [
            ("EMAIL_USER", "me@example.com"),
            ("IMAP_HOST", "imap.example.com"),
            ("POP3_HOST", "pop.example.com"),
            ("SMTP_HOST", "smtp.example.com"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        MailClient::with_defaults(&Config::default(), Arc::new(defaults))
    }

    #[test]
    fn configure_touches_only_named_protocols() {
        let client = client();
        let ack = client.configure(ConfigUpdate {
            imap: Some(ServerSettings {
                host: Some("mail.local".into()),
                secure: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(ack.message.as_deref(), Some("updated imap"));

        let imap = client.imap().settings().resolve().unwrap();
        assert_eq!(imap.host, "mail.local");
        assert_eq!(imap.port, 993);
        assert_eq!(imap.user, "me@example.com");

        let pop3 = client.pop3().settings().resolve().unwrap();
        assert_eq!(pop3.host, "pop.example.com");
        assert_eq!(client.current_config().smtp, ServerSettings::default());
    }

    #[test]
    fn empty_update_changes_nothing() {
        let client = client();
        let ack = client.configure(ConfigUpdate::default());
        assert!(ack.success);
        assert_eq!(client.current_config(), Config::default());
    }

    #[test]
    fn configured_settings_survive_a_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let client = client();
        client.configure(ConfigUpdate {
            pop3: Some(ServerSettings {
                host: Some("pop.local".into()),
                port: Some(1100),
                secure: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        });

        client.current_config().save_to(&path).unwrap();
        let (reloaded, created, _) = Config::load_or_create(Some(&path)).unwrap();
        assert!(!created);
        assert_eq!(reloaded, client.current_config());
        assert_eq!(reloaded.pop3.host.as_deref(), Some("pop.local"));
        assert_eq!(reloaded.imap, ServerSettings::default());

        let resolved = MailClient::with_defaults(&reloaded, Arc::new(HashMap::<String, String>::new()))
            .pop3()
            .settings()
            .resolve()
            .unwrap();
        assert_eq!(resolved.port, 1100);
    }

    #[test]
    fn update_deserializes_from_partial_json() {
        let update: ConfigUpdate =
            serde_json::from_str(r#"{"pop3":{"host":"pop.local","port":1100}}"#).unwrap();
        assert!(update.smtp.is_none());
        assert_eq!(update.pop3.unwrap().port, Some(1100));
    }
}
