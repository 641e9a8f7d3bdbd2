//! Keyword schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A search term loaded at the start of every run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Keyword {
    pub id: i64,
    pub term: String,
    pub category: Option<String>,
    /// Higher is more important
    pub priority: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewKeyword {
    #[validate(length(min = 1, max = 200))]
    pub term: String,
    #[validate(length(max = 100))]
    pub category: Option<String>,
    #[validate(range(min = 0, max = 100))]
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_priority() -> i64 {
    5
}

fn default_active() -> bool {
    true
}

impl NewKeyword {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into().trim().to_string(),
            category: None,
            priority: default_priority(),
            is_active: true,
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}
