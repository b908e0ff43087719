//! Grammaire textuelle du canal de contrôle.
//!
//! - `ssh:host:user::description` (l'ancien champ commande est ignoré)
//! - `api:type:host:api_key:api_endpoint:description`, ou `|` comme
//!   séparateur quand une valeur contient `:`
//! - `rm ssh <host> <user>` / `rm api <host>`
//! - commandes `/xxx`, avec ou sans suffixe `@bot`

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

pub const SHELL_FORMAT: &str = "ssh:host:user::description";
pub const API_FORMAT: &str = "api:type:host:api_key:api_endpoint:description (or use | as delimiter)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellSpec {
    pub host: String,
    pub user: String,
    pub description: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSpec {
    pub api_type: String,
    pub host: String,
    pub api_key: String,
    pub api_endpoint: String,
    pub description: String,
}

impl std::fmt::Debug for ApiSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSpec")
            .field("api_type", &self.api_type)
            .field("host", &self.host)
            .field("api_key", &"<redacted>")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Cible d'une suppression, le type d'hôte est toujours explicite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveTarget {
    Shell { host: String, user: String },
    Api { host: String },
}

impl ShellSpec {
    pub fn parse(text: &str) -> ControlResult<Self> {
        let rest = text
            .trim()
            .strip_prefix("ssh:")
            .ok_or_else(|| malformed(SHELL_FORMAT))?;
        let parts: Vec<&str> = rest.splitn(4, ':').map(str::trim).collect();
        if parts.len() < 2 || !is_shell_field(parts[0]) || !is_shell_field(parts[1]) {
            return Err(malformed(SHELL_FORMAT));
        }
        let description = match parts.len() {
            4 => parts[3],
            3 => parts[2],
            _ => "",
        };
        Ok(Self {
            host: parts[0].to_string(),
            user: parts[1].to_string(),
            description: description.to_string(),
        })
    }
}

impl ApiSpec {
    pub fn parse(text: &str) -> ControlResult<Self> {
        let text = text.trim();
        let (delimiter, rest) = if let Some(rest) = text.strip_prefix("api:") {
            (':', rest)
        } else if let Some(rest) = text.strip_prefix("api|") {
            ('|', rest)
        } else {
            return Err(malformed(API_FORMAT));
        };

        let parts: Vec<&str> = rest.splitn(5, delimiter).map(str::trim).collect();
        if parts.len() < 3 || parts[..3].iter().any(|p| p.is_empty()) {
            return Err(malformed(API_FORMAT));
        }
        let field = |i: usize| parts.get(i).copied().unwrap_or("").to_string();
        Ok(Self {
            api_type: field(0),
            host: field(1),
            api_key: field(2),
            api_endpoint: field(3),
            description: field(4),
        })
    }
}

impl RemoveTarget {
    /// `ssh <host> <user>` ou `api <host>`
    pub fn parse_args(args: &str) -> ControlResult<Self> {
        let words: Vec<&str> = args.split_whitespace().collect();
        match words.as_slice() {
            ["ssh", host, user] => Ok(RemoveTarget::Shell {
                host: host.to_string(),
                user: user.to_string(),
            }),
            ["api", host] => Ok(RemoveTarget::Api {
                host: host.to_string(),
            }),
            _ => Err(malformed("rm ssh <host> <user> | rm api <host>")),
        }
    }
}

/// Hôte ou utilisateur transmis tel quel à `ssh` : ni option, ni espace, ni `@`
fn is_shell_field(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('-')
        && !value.chars().any(|c| c.is_whitespace() || c.is_control() || c == '@')
}

fn malformed(expected: &str) -> ControlError {
    ControlError::MalformedInput(format!("expected {expected}"))
}

/// Commande reçue sur le canal de contrôle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Login,
    Status,
    Logout,
    ListShell,
    ListApi,
    /// Sans argument : instructions d'ajout
    AddShell(Option<String>),
    AddApi(Option<String>),
    Remove(RemoveTarget),
    Shutdown,
    SelectiveShutdown,
    /// Texte libre : réponse à un flux en cours ou requête `ssh:`/`api:`/`rm`
    Text(String),
}

impl Command {
    pub fn parse(text: &str) -> ControlResult<Self> {
        let text = text.trim();
        let Some(slash) = text.strip_prefix('/') else {
            return Ok(Command::Text(text.to_string()));
        };

        let (head, args) = match slash.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (slash, ""),
        };
        let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
        let arg = || (!args.is_empty()).then(|| args.to_string());

        let command = match name.as_str() {
            "start" | "menu" => Command::Start,
            "login" => Command::Login,
            "status" => Command::Status,
            "logout" => Command::Logout,
            "ssh" | "listssh" => Command::ListShell,
            "api" | "listapi" => Command::ListApi,
            "addssh" => Command::AddShell(arg()),
            "addapi" => Command::AddApi(arg()),
            "rmssh" => Command::Remove(RemoveTarget::parse_args(&format!("ssh {args}"))?),
            "rmapi" => Command::Remove(RemoveTarget::parse_args(&format!("api {args}"))?),
            "shutdown" => Command::Shutdown,
            "select" => Command::SelectiveShutdown,
            other => return Err(ControlError::MalformedInput(format!("unknown command /{other}"))),
        };
        Ok(command)
    }
}
