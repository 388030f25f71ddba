//! Push messages and notification clicks.

use finsync_common::NotificationConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Action id that opens the app.
pub const ACTION_OPEN: &str = "open";
/// Action id that only closes the notification.
pub const ACTION_DISMISS: &str = "dismiss";

/// Fields read from a push message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl PushPayload {
    /// Parse a raw payload. Missing or malformed data yields an empty
    /// payload; a field of the wrong type is ignored on its own.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(bytes) = data else {
            return Self::default();
        };

        let value: JsonValue = match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Push payload is not JSON; using defaults");
                return Self::default();
            }
        };

        let field = |name: &str| value.get(name).and_then(JsonValue::as_str).map(str::to_string);
        Self {
            title: field("title"),
            body: field("body"),
        }
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// A notification to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    /// Build the notification for a payload, filling gaps from `config`.
    pub fn from_payload(payload: PushPayload, config: &NotificationConfig) -> Self {
        Self {
            title: payload
                .title
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| config.default_title.clone()),
            body: payload
                .body
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| config.default_body.clone()),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            actions: vec![
                NotificationAction {
                    action: ACTION_OPEN.to_string(),
                    title: "Open app".to_string(),
                },
                NotificationAction {
                    action: ACTION_DISMISS.to_string(),
                    title: "Dismiss".to_string(),
                },
            ],
        }
    }
}

/// What a click should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickResponse {
    /// Close and open the app.
    OpenApp,
    /// Close only.
    Close,
}

/// Decide the response to a click. `None` is a click on the notification body.
pub fn click_response(action: Option<&str>) -> ClickResponse {
    match action {
        None | Some("") | Some(ACTION_OPEN) => ClickResponse::OpenApp,
        Some(_) => ClickResponse::Close,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NotificationConfig {
        NotificationConfig::default()
    }

    #[test]
    fn test_payload_parse() {
        let payload = PushPayload::parse(Some(br#"{"title":"Budget alert","body":"Food at 90%"}"#));
        assert_eq!(payload.title.as_deref(), Some("Budget alert"));
        assert_eq!(payload.body.as_deref(), Some("Food at 90%"));
    }

    #[test]
    fn test_invalid_payload_is_empty() {
        assert_eq!(PushPayload::parse(Some(b"not json")), PushPayload::default());
        assert_eq!(PushPayload::parse(Some(b"[1,2]")), PushPayload::default());
        assert_eq!(PushPayload::parse(None), PushPayload::default());
    }

    #[test]
    fn test_mistyped_field_keeps_the_other() {
        let payload = PushPayload::parse(Some(br#"{"title": 5, "body": "Invoice due"}"#));
        assert_eq!(payload.title, None);
        assert_eq!(payload.body.as_deref(), Some("Invoice due"));

        let notification = Notification::from_payload(payload, &config());
        assert_eq!(notification.title, config().default_title);
        assert_eq!(notification.body, "Invoice due");
    }

    #[test]
    fn test_notification_fallbacks() {
        let config = config();
        let notification = Notification::from_payload(
            PushPayload {
                title: None,
                body: Some("Invoice due tomorrow".to_string()),
            },
            &config,
        );

        assert_eq!(notification.title, config.default_title);
        assert_eq!(notification.body, "Invoice due tomorrow");
        assert_eq!(notification.icon, config.icon);
        let actions: Vec<_> = notification.actions.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(actions, vec![ACTION_OPEN, ACTION_DISMISS]);
    }

    #[test]
    fn test_click_response() {
        assert_eq!(click_response(Some("open")), ClickResponse::OpenApp);
        assert_eq!(click_response(None), ClickResponse::OpenApp);
        assert_eq!(click_response(Some("dismiss")), ClickResponse::Close);
        assert_eq!(click_response(Some("snooze")), ClickResponse::Close);
    }
}
