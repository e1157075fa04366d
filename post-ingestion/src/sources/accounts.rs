use crate::types::{IngestError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Session cookies, either as a ready-made header or as name/value pairs.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum Cookies {
    Header(String),
    Map(BTreeMap<String, String>),
}

impl Cookies {
    pub fn header_value(&self) -> String {
        match self {
            Cookies::Header(raw) => raw.trim().to_string(),
            Cookies::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        match self {
            Cookies::Header(raw) => raw.split(';').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k.trim() == name).then(|| v.trim().to_string())
            }),
            Cookies::Map(map) => map.get(name).cloned(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Cookies::Header(raw) => raw.trim().is_empty(),
            Cookies::Map(map) => map.is_empty(),
        }
    }
}

/// One logged-in platform account used to read timelines.
#[derive(Clone, Deserialize)]
pub struct AccountCredential {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_password: String,
    pub cookies: Cookies,
}

impl AccountCredential {
    /// CSRF token the platform expects mirrored from the `ct0` cookie.
    pub fn csrf_token(&self) -> Option<String> {
        self.cookies.get("ct0")
    }
}

// Secrets stay out of logs.
impl fmt::Debug for AccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredential")
            .field("username", &self.username)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Accounts loaded from the credentials file, handed out round-robin.
#[derive(Debug)]
pub struct AccountPool {
    accounts: Vec<AccountCredential>,
    next: AtomicUsize,
}

impl AccountPool {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("reading credentials from {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let accounts: Vec<AccountCredential> = serde_json::from_str(s)
            .map_err(|e| IngestError::Config(format!("invalid credentials file: {}", e)))?;
        Self::new(accounts)
    }

    pub fn new(accounts: Vec<AccountCredential>) -> Result<Self> {
        if accounts.is_empty() {
            return Err(IngestError::Config("credentials file lists no accounts".to_string()));
        }
        if let Some(bad) = accounts
            .iter()
            .find(|a| a.username.trim().is_empty() || a.cookies.is_empty())
        {
            return Err(IngestError::Config(format!(
                "account {:?} is missing a username or cookies",
                bad.username
            )));
        }
        Ok(Self {
            accounts,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn next_account(&self) -> &AccountCredential {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.accounts.len();
        &self.accounts[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"[
        {"username": "reader1", "password": "pw", "email": "r1@example.com",
         "cookies": "auth_token=abc; ct0=tok1"},
        {"username": "reader2", "cookies": {"auth_token": "def", "ct0": "tok2"}}
    ]"#;

    #[test]
    fn both_cookie_shapes_parse() {
        let pool = AccountPool::from_json_str(FILE).unwrap();
        assert_eq!(pool.len(), 2);

        let first = pool.next_account();
        assert_eq!(first.username, "reader1");
        assert_eq!(first.csrf_token().as_deref(), Some("tok1"));
        assert_eq!(first.cookies.header_value(), "auth_token=abc; ct0=tok1");

        let second = pool.next_account();
        assert_eq!(second.csrf_token().as_deref(), Some("tok2"));
        assert_eq!(second.cookies.header_value(), "auth_token=def; ct0=tok2");

        assert_eq!(pool.next_account().username, "reader1");
    }

    #[test]
    fn debug_hides_secrets() {
        let pool = AccountPool::from_json_str(FILE).unwrap();
        let shown = format!("{:?}", pool.next_account());
        assert!(shown.contains("reader1"));
        assert!(!shown.contains("abc"));
        assert!(!shown.contains("pw"));
    }

    #[test]
    fn unusable_files_are_config_errors() {
        assert!(matches!(AccountPool::from_json_str("[]"), Err(IngestError::Config(_))));
        assert!(matches!(AccountPool::from_json_str("{"), Err(IngestError::Config(_))));
        assert!(matches!(
            AccountPool::from_json_str(r#"[{"username": "x", "cookies": ""}]"#),
            Err(IngestError::Config(_))
        ));
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            AccountPool::load(&tmp.path().join("accounts.json")),
            Err(IngestError::Config(_))
        ));
    }
}
