//! CLI arguments for accounting configuration.

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::config::AccountingConfig;
use crate::constants::*;

/// Resource accounting CLI arguments.
#[derive(Debug, Args, Clone, Serialize, Deserialize)]
#[command(next_help_heading = "Resource Accounting")]
#[serde(default)]
pub struct AccountingArgs {
    /// Ceiling on outstanding messages per sender in one peer's pool
    #[arg(long = "accounting.max-messages", default_value_t = DEFAULT_MAX_MESSAGES_PER_SENDER)]
    pub max_messages_per_sender: u32,

    /// Domain-wide in-flight handle budget per identity
    #[arg(long = "accounting.max-inflight-handles", default_value_t = DEFAULT_MAX_INFLIGHT_HANDLES)]
    pub max_inflight_handles: u64,

    /// Maximum number of distinct live identities
    #[arg(long = "accounting.max-users", default_value_t = DEFAULT_MAX_USERS)]
    pub max_users: u32,
}

impl Default for AccountingArgs {
    fn default() -> Self {
        Self {
            max_messages_per_sender: DEFAULT_MAX_MESSAGES_PER_SENDER,
            max_inflight_handles: DEFAULT_MAX_INFLIGHT_HANDLES,
            max_users: DEFAULT_MAX_USERS,
        }
    }
}

impl AccountingArgs {
    /// Validate argument combinations.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_messages_per_sender == 0 {
            return Err("accounting.max-messages must be non-zero".to_string());
        }
        if self.max_inflight_handles == 0 {
            return Err("accounting.max-inflight-handles must be non-zero".to_string());
        }
        if self.max_users == 0 {
            return Err("accounting.max-users must be non-zero".to_string());
        }
        Ok(())
    }

    /// Resolve the arguments into an [`AccountingConfig`].
    pub fn config(&self) -> AccountingConfig {
        AccountingConfig {
            max_messages_per_sender: self.max_messages_per_sender,
            max_inflight_handles: self.max_inflight_handles,
            max_users: self.max_users,
        }
    }
}
