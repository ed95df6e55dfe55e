//! Interactive username/password collection

use std::io::IsTerminal;

use dialoguer::{Input, Password};

use crate::error::{EcpError, Result};

/// Source of login credentials for password-based IdPs
pub trait CredentialPrompt: Send + Sync + std::fmt::Debug {
    /// Ask for the username to use at `host`
    fn username(&self, host: &str) -> Result<String>;

    /// Ask for the password of `username`
    fn password(&self, username: &str, host: &str) -> Result<String>;
}

/// Prompts on the controlling terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn require_terminal() -> Result<()> {
        if !std::io::stdin().is_terminal() {
            return Err(EcpError::Prompt(
                "no terminal available, pass --username and a password explicitly".to_string(),
            ));
        }
        Ok(())
    }
}

impl CredentialPrompt for TerminalPrompt {
    fn username(&self, host: &str) -> Result<String> {
        Self::require_terminal()?;
        Input::<String>::new()
            .with_prompt(format!("Enter username for {}", host))
            .interact_text()
            .map_err(|e| EcpError::Prompt(e.to_string()))
    }

    fn password(&self, username: &str, _host: &str) -> Result<String> {
        Self::require_terminal()?;
        Password::new()
            .with_prompt(format!("Enter password for login '{}'", username))
            .interact()
            .map_err(|e| EcpError::Prompt(e.to_string()))
    }
}

/// Fixed answers, for scripting and tests
#[derive(Clone, Default)]
pub struct StaticPrompt {
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for StaticPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPrompt")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl StaticPrompt {
    /// Answer every prompt with `username` and `password`
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Refuse every prompt
    pub fn none() -> Self {
        Self::default()
    }
}

impl CredentialPrompt for StaticPrompt {
    fn username(&self, host: &str) -> Result<String> {
        self.username
            .clone()
            .ok_or_else(|| EcpError::Prompt(format!("no username available for {}", host)))
    }

    fn password(&self, username: &str, _host: &str) -> Result<String> {
        self.password
            .clone()
            .ok_or_else(|| EcpError::Prompt(format!("no password available for '{}'", username)))
    }
}
