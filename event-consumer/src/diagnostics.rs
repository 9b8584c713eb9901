//! Stable log categories.
//!
//! Every diagnostic event carries a `category` field rendered from `Category`
//! and a `correlation_id` field, which is empty when no event is in scope. Log
//! aggregation keys on these two fields, so their names and values must not
//! change.

use std::fmt;

/// Correlation id used when a log line is not tied to any record.
pub const NO_CORRELATION_ID: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Lifecycle,
    Rebalance,
    Record,
    Commit,
    Watermark,
    Broker,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Lifecycle => "lifecycle",
            Category::Rebalance => "rebalance",
            Category::Record => "record",
            Category::Commit => "commit",
            Category::Watermark => "watermark",
            Category::Broker => "broker",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
