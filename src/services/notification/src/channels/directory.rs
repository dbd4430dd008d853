//! Contact lookup for channels that need an address

use async_trait::async_trait;
use dashmap::DashMap;

/// Resolves a user id to the addresses channels deliver to.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn user_email(&self, user_id: &str) -> Option<String>;

    async fn user_phone(&self, user_id: &str) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    emails: DashMap<String, String>,
    phones: DashMap<String, String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_email(&self, user_id: impl Into<String>, email: impl Into<String>) {
        self.emails.insert(user_id.into(), email.into());
    }

    pub fn set_phone(&self, user_id: impl Into<String>, phone: impl Into<String>) {
        self.phones.insert(user_id.into(), phone.into());
    }

    pub fn with_email(self, user_id: impl Into<String>, email: impl Into<String>) -> Self {
        self.set_email(user_id, email);
        self
    }

    pub fn with_phone(self, user_id: impl Into<String>, phone: impl Into<String>) -> Self {
        self.set_phone(user_id, phone);
        self
    }
}

#[async_trait]
impl ContactDirectory for InMemoryDirectory {
    async fn user_email(&self, user_id: &str) -> Option<String> {
        self.emails.get(user_id).map(|e| e.clone())
    }

    async fn user_phone(&self, user_id: &str) -> Option<String> {
        self.phones.get(user_id).map(|p| p.clone())
    }
}
