//! Account registry.
//!
//! Root of the ownership graph: every account owns its credential, its
//! device token and the list of channels it subscribed to. Registration is
//! implicit: the first successful handshake for an unseen id creates the
//! account with the presented secret.

use std::collections::HashMap;

use tracing::{debug, info};

use parkping_shared::protocol::AccountSummary;
use parkping_shared::types::{AccountId, ChannelId};

use crate::error::HubError;

/// A person that can own vehicle channels.
#[derive(Clone)]
pub struct Account {
    pub id: AccountId,
    secret: String,
    pub blocked: bool,
    /// Push token of the last device that logged in.
    pub device_token: Option<String>,
    /// Owned channels, in registration order.
    pub channels: Vec<ChannelId>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("blocked", &self.blocked)
            .field("device_token", &self.device_token.is_some())
            .field("channels", &self.channels)
            .finish()
    }
}

impl Account {
    fn new(id: AccountId, secret: String, device_token: Option<String>) -> Self {
        Self {
            id,
            secret,
            blocked: false,
            device_token,
            channels: Vec::new(),
        }
    }

    fn secret_matches(&self, secret: &str) -> bool {
        self.secret == secret
    }

    /// Record ownership of `channel_id`. Returns `false` if already owned.
    pub fn add_channel(&mut self, channel_id: &ChannelId) -> bool {
        if self.channels.contains(channel_id) {
            return false;
        }
        self.channels.push(channel_id.clone());
        true
    }

    pub fn summary(&self, online: bool) -> AccountSummary {
        AccountSummary {
            id: self.id.clone(),
            blocked: self.blocked,
            online,
            has_device_token: self.device_token.is_some(),
            channels: self.channels.clone(),
        }
    }
}

/// Outcome of a successful owner login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Login {
    /// An unseen id was registered with the presented secret.
    Registered,
    /// An existing account's secret matched.
    Returning,
}

#[derive(Debug, Default)]
pub struct AccountRegistry {
    accounts: HashMap<AccountId, Account>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log in as `id`, registering it if unseen.
    ///
    /// A blocked account is rejected without touching any state. On a
    /// returning login the device token is overwritten when one is
    /// presented.
    pub fn login(
        &mut self,
        id: &AccountId,
        secret: &str,
        device_token: Option<String>,
    ) -> Result<Login, HubError> {
        let Some(account) = self.accounts.get_mut(id) else {
            self.accounts.insert(
                id.clone(),
                Account::new(id.clone(), secret.to_string(), device_token),
            );
            info!(account = %id, "New account registered");
            return Ok(Login::Registered);
        };

        if !account.secret_matches(secret) {
            debug!(account = %id, "Login rejected: wrong secret");
            return Err(HubError::InvalidCredential);
        }
        if account.blocked {
            debug!(account = %id, "Login rejected: account blocked");
            return Err(HubError::AccountBlocked);
        }
        if device_token.is_some() {
            account.device_token = device_token;
        }
        Ok(Login::Returning)
    }

    /// Check `secret` against an existing account.
    pub fn verify(&self, id: &AccountId, secret: &str) -> Result<&Account, HubError> {
        match self.accounts.get(id) {
            Some(account) if account.secret_matches(secret) => Ok(account),
            _ => Err(HubError::InvalidCredential),
        }
    }

    /// Flip the block flag. Returns the new value.
    pub fn toggle_block(&mut self, id: &AccountId) -> Result<bool, HubError> {
        let account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| HubError::NotFound(id.to_string()))?;
        account.blocked = !account.blocked;
        info!(account = %id, blocked = account.blocked, "Block flag toggled");
        Ok(account.blocked)
    }

    pub fn get(&self, id: &AccountId) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn get_mut(&mut self, id: &AccountId) -> Option<&mut Account> {
        self.accounts.get_mut(id)
    }

    pub fn contains(&self, id: &AccountId) -> bool {
        self.accounts.contains_key(id)
    }

    /// Remove an account. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &AccountId) -> Option<Account> {
        self.accounts.remove(id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.accounts.values().filter(|a| a.blocked).count()
    }

    /// Accounts sorted by id.
    pub fn sorted(&self) -> Vec<&Account> {
        let mut accounts: Vec<&Account> = self.accounts.values().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }
}
