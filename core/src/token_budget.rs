//! Per-session token accounting.
//!
//! The budget is charged with an estimate *before* each LLM call is made;
//! a call whose estimate does not fit is refused outright, so no request is
//! ever sent that the session cannot afford. After the call the estimate is
//! reconciled against the provider-reported usage.

use std::sync::Mutex;

use quarry_protocol::TokenUsage;
use quarry_protocol::TokenUsageInfo;

use crate::error::QuarryErr;
use crate::error::Result;

/// Rough tokens-per-character divisor used when no tokenizer is available.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a prompt string.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() / CHARS_PER_TOKEN) as i64 + 1
}

#[derive(Debug)]
pub struct TokenBudget {
    info: Mutex<TokenUsageInfo>,
}

impl TokenBudget {
    pub fn new(session_budget: i64) -> Self {
        Self {
            info: Mutex::new(TokenUsageInfo::new(Some(session_budget))),
        }
    }

    pub fn remaining(&self) -> i64 {
        self.lock().remaining().unwrap_or(i64::MAX)
    }

    /// Refuse the call if `estimate` does not fit in the remaining budget.
    /// Nothing is recorded here; usage lands via [`TokenBudget::record`]
    /// once the call returns.
    pub fn check(&self, estimate: i64) -> Result<()> {
        let remaining = self.remaining();
        if estimate > remaining {
            return Err(QuarryErr::BudgetExhausted {
                needed: estimate,
                remaining,
            });
        }
        Ok(())
    }

    /// Record the actual usage of a completed call (or the estimate, when
    /// the provider reports none).
    pub fn record(&self, usage: &TokenUsage) {
        self.lock().append_last_usage(usage);
    }

    pub fn snapshot(&self) -> TokenUsageInfo {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenUsageInfo> {
        // Mutex poisoning cannot leave the accounting in a torn state; the
        // inner struct is only ever replaced wholesale.
        match self.info.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
