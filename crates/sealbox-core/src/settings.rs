use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const REDACTED: &str = "********";

/// Database credentials loaded by the SQL access layer.
///
/// Field names follow the documents already written in the field
/// (`ServerName`, `DatabaseName`, ...). Every field is required.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct DbConnectionParams {
    pub server_name: String,
    pub database_name: String,
    pub user_name: String,
    pub password: String,
}

impl DbConnectionParams {
    /// ADO-style connection string, password included.
    pub fn connection_string(&self) -> String {
        self.render(&self.password)
    }

    /// Connection string safe for logs and console output.
    pub fn redacted_connection_string(&self) -> String {
        self.render(REDACTED)
    }

    fn render(&self, password: &str) -> String {
        format!(
            "Data Source={};Initial Catalog={};User ID={};Password={}",
            self.server_name, self.database_name, self.user_name, password
        )
    }
}

impl fmt::Debug for DbConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConnectionParams")
            .field("server_name", &self.server_name)
            .field("database_name", &self.database_name)
            .field("user_name", &self.user_name)
            .field("password", &REDACTED)
            .finish()
    }
}

/// SMTP account used by the mail sender.
///
/// Missing fields fall back to the same defaults a freshly constructed value has.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmailSettings {
    #[serde(rename = "SmtpServerName")]
    pub smtp_server_name: String,
    #[serde(rename = "SmtpPortNumber")]
    pub smtp_port_number: u16,
    #[serde(rename = "EmailAddress")]
    pub email_address: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "UseSSL")]
    pub use_ssl: bool,
    #[serde(rename = "BodyIsHTML")]
    pub body_is_html: bool,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            smtp_server_name: String::new(),
            smtp_port_number: 25,
            email_address: String::new(),
            password: String::new(),
            use_ssl: true,
            body_is_html: true,
        }
    }
}

impl fmt::Debug for EmailSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailSettings")
            .field("smtp_server_name", &self.smtp_server_name)
            .field("smtp_port_number", &self.smtp_port_number)
            .field("email_address", &self.email_address)
            .field("password", &REDACTED)
            .field("use_ssl", &self.use_ssl)
            .field("body_is_html", &self.body_is_html)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message has no recipients")]
    NoRecipients,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// An outgoing mail message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct MessageData {
    pub subject: String,
    pub content: String,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
}

impl MessageData {
    /// Checks the message can be handed to a mail sender: at least one `To`
    /// recipient and every address has the `local@domain` shape.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.to_emails.is_empty() {
            return Err(MessageError::NoRecipients);
        }
        for address in self.to_emails.iter().chain(&self.cc_emails) {
            if !looks_like_address(address) {
                return Err(MessageError::InvalidAddress(address.clone()));
            }
        }
        Ok(())
    }
}

fn looks_like_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}
