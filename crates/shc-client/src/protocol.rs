//! Packet catalogue: typed bodies for every outbound packet, and the
//! inbound packets the client itself consumes.

use serde::{Deserialize, Serialize};
use shc_core::ChatId;
use shc_transport::Request;
use std::collections::BTreeMap;

pub const LOGIN_SUCCESS: &str = "login_success";
pub const LOGIN_FAILED: &str = "login_failed";
pub const CHATS: &str = "chats";

/// Default page size for listing requests
pub const PAGE_SIZE: u32 = 50;

/// Largest integer a JavaScript server reads back exactly (2^53 - 1); the
/// "no upper bound" cursor for paged listings.
pub const MAX_SAFE_CURSOR: i64 = 9_007_199_254_740_991;

macro_rules! request {
    ($ty:ident, $kind:literal) => {
        impl Request for $ty {
            const KIND: &'static str = $kind;
        }
    };
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// `password` is the HMAC auth token, never the password itself.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Login {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Login")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GetChats;

impl Request for GetChats {
    const KIND: &'static str = "get_chats";
    const BARE: bool = true;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetMessages {
    pub chat_id: ChatId,
    /// Offset from the newest message
    pub begin: u64,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetBroadcasts {
    /// `None` asks for both system and user broadcasts
    pub system: Option<bool>,
    /// Only broadcasts with ids below this
    pub before: i64,
    pub count: u32,
}

impl GetBroadcasts {
    pub fn latest() -> Self {
        Self {
            system: None,
            before: MAX_SAFE_CURSOR,
            count: PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddFriend {
    pub target_username: String,
    /// Fresh chat key wrapped for the friend
    pub key_for_friend: String,
    /// The same key wrapped for ourselves
    pub key_for_self: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroup {
    pub name: Option<String>,
    pub member_usernames: Vec<String>,
    /// username → chat key wrapped for that member, creator included
    pub encrypted_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberToChat {
    pub chat_id: ChatId,
    pub username: String,
    pub encrypted_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetChatDetails {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RenameChat {
    pub chat_id: ChatId,
    pub new_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KickMemberFromChat {
    pub chat_id: ChatId,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetDoNotDisturb {
    pub chat_id: ChatId,
    pub do_not_disturb: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub message_id: i64,
    /// Envelope of the new text under the chat key; `None` withdraws the
    /// message and goes out as `"message":null`.
    pub message: Option<String>,
}

impl EditMessage {
    pub fn edit(message_id: i64, envelope: impl Into<String>) -> Self {
        Self {
            message_id,
            message: Some(envelope.into()),
        }
    }

    pub fn withdraw(message_id: i64) -> Self {
        Self {
            message_id,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetUserMoments {
    pub user_id: i64,
    pub before: i64,
    pub count: u32,
}

request!(Login, "login");
request!(GetMessages, "get_messages");
request!(GetBroadcasts, "get_broadcasts");
request!(AddFriend, "add_friend");
request!(CreateGroup, "create_group");
request!(AddMemberToChat, "add_member_to_chat");
request!(GetChatDetails, "get_chat_details");
request!(RenameChat, "rename_chat");
request!(KickMemberFromChat, "kick_member_from_chat");
request!(SetDoNotDisturb, "set_do_not_disturb");
request!(EditMessage, "edit_message");
request!(GetUserMoments, "get_user_moments");

// ── Inbound ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LoginSuccess {
    pub user: UserRecord,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub public_key: String,
    /// Private key envelope under the password wrapping key
    pub private_key: String,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginFailed {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatsList {
    pub chats: Vec<ChatSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: ChatId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    /// Chat key wrapped for this user
    pub key: String,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub do_not_disturb: bool,
}
