use chrono::Utc;

use crate::errors::AppError;

/// One external correspondent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Debug)]
pub struct NewContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    FromContact,
    FromOrganization,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::FromContact => "FROM_CONTACT",
            Direction::FromOrganization => "FROM_ORGANIZATION",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "FROM_CONTACT" => Ok(Direction::FromContact),
            "FROM_ORGANIZATION" => Ok(Direction::FromOrganization),
            other => Err(AppError::Database(format!("unknown message direction {other:?}"))),
        }
    }
}

/// One unit of conversation. `parent_id == None` marks a conversation root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub contact_id: i64,
    pub subject: Option<String>,
    pub body: String,
    pub direction: Direction,
    pub read: bool,
    pub parent_id: Option<i64>,
    pub created_at: i64,
}

impl Message {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct NewMessage {
    pub contact_id: i64,
    pub subject: Option<String>,
    pub body: String,
    pub direction: Direction,
    pub read: bool,
    pub parent_id: Option<i64>,
    pub created_at: i64,
}

/// Idempotency record for one received email, keyed by its protocol message id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub message_id: String,
    pub from_addr: String,
    pub to_addr: String,
    pub in_reply_to: Option<String>,
    /// Whether the email was materialized as a `Message`.
    pub saved: bool,
    pub contact_id: Option<i64>,
    pub created_at: i64,
}

/// Normalized view of one fetched email.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEmail {
    pub message_id: String,
    pub from: String,
    pub from_name: Option<String>,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    pub in_reply_to: Option<String>,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
