//! Chat texts shown to requesters and the administrator.

use keygate_contracts::{RequesterId, ResourceId};

use crate::PendingRequest;

pub const REQUEST_BUTTON: &str = "🔑 Request config";
pub const APPROVE_BUTTON: &str = "✅ Approve";
pub const REJECT_BUTTON: &str = "❌ Reject";

pub const REQUEST_FORWARDED: &str =
    "✅ Your request has been sent to the administrator. Please wait for a decision.";
pub const ALREADY_PENDING: &str =
    "⏳ You already have a request waiting for the administrator's decision.";
pub const POOL_EXHAUSTED: &str =
    "⚠️ All keys have run out for now. The administrator has been notified.";
pub const POOL_EXHAUSTED_ALERT: &str = "⚠️ ATTENTION! No configs left in the pool!";
pub const PROCESSING_FAILED: &str = "⚠️ Error while processing the request. Please try again later.";
pub const DECISION_FAILED: &str = "⚠️ Error while processing the request";
pub const NOT_FOUND: &str = "⚠️ Request not found or already handled";
pub const REJECTED_NOTICE: &str = "❌ Your request was rejected by the administrator";
pub const TEXT_HINT: &str = "Use /start or the request button";

const NO_HANDLE: &str = "no username";

pub fn greeting(first_name: &str, bot_handle: Option<&str>) -> String {
    format!(
        "Hello, {first_name}!\n\
         I hand out WireGuard VPN configurations.\n\n\
         ⚠️ Before requesting one:\n\
         1. Start a private chat with me ({})\n\
         2. Do not block the bot\n\
         3. Wait for the administrator to approve",
        handle_or_generic(bot_handle)
    )
}

pub fn open_private_chat(bot_handle: Option<&str>) -> String {
    format!(
        "⚠️ To receive a config, message me privately first: {}",
        handle_or_generic(bot_handle)
    )
}

pub fn admin_prompt(pending: &PendingRequest, open_requests: usize) -> String {
    let handle = pending
        .requester
        .handle
        .as_deref()
        .map(|h| format!("@{h}"))
        .unwrap_or_else(|| NO_HANDLE.to_string());
    format!(
        "🆕 New config request:\n\
         👤 Name: {}\n\
         📌 Username: {}\n\
         🆔 ID: {}\n\
         🕒 Time: {}\n\
         📁 File: {}\n\
         📋 Open requests: {}",
        pending.requester.display_name,
        handle,
        pending.requester.id,
        pending.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        pending.resource_id,
        open_requests
    )
}

pub fn delivery_caption(resource: &ResourceId) -> String {
    format!("Your config: {resource}")
}

pub fn issued(requester: RequesterId, resource: &ResourceId) -> String {
    format!("✅ Config {resource} issued to user ID: {requester}")
}

pub fn delivery_failed(reason: &str) -> String {
    format!("🚫 Config delivery failed: {reason}")
}

pub fn requester_unreachable(requester: RequesterId) -> String {
    format!("❌ Could not send the config to user {requester}")
}

pub fn rejected(requester: RequesterId) -> String {
    format!("❌ Request from user ID: {requester} rejected")
}

pub fn commit_conflict(requester: RequesterId, resource: &ResourceId) -> String {
    format!(
        "🚨 Config {resource} was delivered to user {requester} but was no longer in the \
         available pool. Check the pool directories."
    )
}

pub fn commit_failed(requester: RequesterId, resource: &ResourceId, reason: &str) -> String {
    format!(
        "🚨 Config {resource} was delivered to user {requester} but could not be moved to the \
         issued directory: {reason}. It is withheld until the move succeeds; move it out of the \
         available directory by hand before restarting the bot."
    )
}

fn handle_or_generic(bot_handle: Option<&str>) -> String {
    match bot_handle {
        Some(h) if !h.is_empty() => format!("@{}", h.trim_start_matches('@')),
        _ => "this bot".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PendingState;
    use chrono::{TimeZone, Utc};
    use keygate_contracts::Requester;

    fn pending(handle: Option<&str>) -> PendingRequest {
        let mut requester = Requester::new(42, "Ann Lee");
        requester.handle = handle.map(|h| h.to_string());
        PendingRequest {
            requester,
            resource_id: ResourceId::new("a.conf"),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap(),
            state: PendingState::Open,
        }
    }

    #[test]
    fn admin_prompt_lists_request_details() {
        let text = admin_prompt(&pending(Some("ann")), 3);
        assert!(text.contains("Ann Lee"));
        assert!(text.contains("@ann"));
        assert!(text.contains("42"));
        assert!(text.contains("2026-03-01 12:30:05 UTC"));
        assert!(text.contains("a.conf"));
        assert!(text.contains("Open requests: 3"));
    }

    #[test]
    fn admin_prompt_uses_sentinel_without_handle() {
        assert!(admin_prompt(&pending(None), 1).contains("Username: no username"));
    }

    #[test]
    fn commit_failure_tells_operator_to_move_file() {
        let text = commit_failed(
            keygate_contracts::ChatId(42),
            &ResourceId::new("a.conf"),
            "Not a directory",
        );
        assert!(text.contains("a.conf"));
        assert!(text.contains("Not a directory"));
        assert!(text.contains("by hand"));
        assert!(!text.contains("no longer in the available pool"));
    }

    #[test]
    fn bot_handle_is_normalized() {
        assert!(open_private_chat(Some("@keygate_bot")).ends_with("@keygate_bot"));
        assert!(open_private_chat(Some("keygate_bot")).ends_with("@keygate_bot"));
        assert!(open_private_chat(None).ends_with("this bot"));
    }
}
