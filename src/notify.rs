//! Failure reports to a maintainer.
//!
//! Mail is handed to the local mail transfer agent: the configured command
//! (`sendmail -t` by default) receives the complete message on stdin.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Maintainer address
    pub to: String,
    pub from: Option<String>,
    /// Mail submission command; reads headers and body from stdin
    pub command: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            to: String::new(),
            from: None,
            command: vec!["sendmail".to_string(), "-t".to_string()],
        }
    }
}

impl NotifyConfig {
    pub fn validate(&self) -> Result<()> {
        let header_safe = |value: &str| !value.is_empty() && !value.contains(['\r', '\n']);
        if !header_safe(&self.to) {
            return Err(SyncError::Config(format!(
                "invalid notification address '{}'",
                self.to
            )));
        }
        if let Some(from) = &self.from {
            if !header_safe(from) {
                return Err(SyncError::Config(format!("invalid sender address '{}'", from)));
            }
        }
        if self.command.is_empty() {
            return Err(SyncError::Config("empty mail command".to_string()));
        }
        Ok(())
    }
}

pub struct MailNotifier {
    config: NotifyConfig,
}

impl MailNotifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self { config }
    }

    fn message(&self, subject: &str, body: &str) -> String {
        let mut message = String::new();
        if let Some(from) = &self.config.from {
            message.push_str(&format!("From: {}\n", from));
        }
        message.push_str(&format!("To: {}\n", self.config.to));
        message.push_str(&format!("Subject: {}\n\n", subject.replace(['\r', '\n'], " ")));
        message.push_str(body);
        if !body.ends_with('\n') {
            message.push('\n');
        }
        message
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| SyncError::Config("empty mail command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.message(subject, body).as_bytes()).await?;
            // dropped here: end of message
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(SyncError::backend(
                program.as_str(),
                format!(
                    "mail command failed ({}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &[&str]) -> NotifyConfig {
        NotifyConfig {
            to: "ops@example.org".to_string(),
            from: Some("relay@box-7".to_string()),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_message_headers() {
        let notifier = MailNotifier::new(config(&["sendmail", "-t"]));
        let message = notifier.message("worker\nstopped", "details");
        assert_eq!(
            message,
            "From: relay@box-7\nTo: ops@example.org\nSubject: worker stopped\n\ndetails\n"
        );
    }

    #[test]
    fn test_validate() {
        assert!(config(&["sendmail", "-t"]).validate().is_ok());
        assert!(NotifyConfig::default().validate().is_err());

        let mut injected = config(&["sendmail"]);
        injected.to = "a@b\nBcc: c@d".to_string();
        assert!(injected.validate().is_err());
        assert!(config(&[]).validate().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_receives_message() {
        let temp = tempfile::TempDir::new().unwrap();
        let out = temp.path().join("mail.txt");
        let notifier =
            MailNotifier::new(config(&["sh", "-c", "cat > \"$0\"", out.to_str().unwrap()]));
        notifier.notify("subject", "body").await.unwrap();
        let sent = std::fs::read_to_string(&out).unwrap();
        assert!(sent.contains("To: ops@example.org\n"));
        assert!(sent.ends_with("\n\nbody\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_an_error() {
        let notifier = MailNotifier::new(config(&["sh", "-c", "cat > /dev/null; exit 3"]));
        let err = notifier.notify("s", "b").await.unwrap_err();
        assert!(matches!(err, SyncError::Backend { .. }));
    }
}
