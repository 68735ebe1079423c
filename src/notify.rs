use crate::undo::UndoToken;
use serde::Serialize;

/// User-visible outcome of an action: a toast, a failure, or an upgrade
/// prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationAction {
    Undo { token: UndoToken },
    UpgradePlan,
}

impl Notification {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: None,
            actions: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn failure(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(title).with_body(body)
    }

    pub fn upsell(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(title)
            .with_body(body)
            .with_action(NotificationAction::UpgradePlan)
    }

    pub fn undo_token(&self) -> Option<&UndoToken> {
        self.actions.iter().find_map(|action| match action {
            NotificationAction::Undo { token } => Some(token),
            NotificationAction::UpgradePlan => None,
        })
    }
}

/// "1 thread", "3 threads".
pub fn thread_count(n: usize) -> String {
    if n == 1 {
        "1 thread".to_string()
    } else {
        format!("{} threads", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::undo::UndoableAction;

    #[test]
    fn test_thread_count() {
        assert_eq!(thread_count(1), "1 thread");
        assert_eq!(thread_count(0), "0 threads");
        assert_eq!(thread_count(12), "12 threads");
    }

    #[test]
    fn test_upsell_carries_upgrade_action() {
        let prompt = Notification::upsell("Folder limit reached", "Upgrade to use more.");
        assert_eq!(prompt.actions, vec![NotificationAction::UpgradePlan]);
        assert!(prompt.undo_token().is_none());

        let json = serde_json::to_value(&prompt).unwrap();
        assert_eq!(json["actions"][0]["type"], "upgrade_plan");
    }

    #[test]
    fn test_undo_token_round_trip_through_toast() {
        let token = UndoToken {
            action: UndoableAction::Trash,
            previous: Vec::new(),
        };
        let toast = Notification::new("Moved 1 thread to Trash").with_action(NotificationAction::Undo { token: token.clone() });
        assert_eq!(toast.undo_token(), Some(&token));

        let json = serde_json::to_value(&toast).unwrap();
        assert_eq!(json["actions"][0]["type"], "undo");
        assert_eq!(json["actions"][0]["token"]["action"]["kind"], "trash");
        assert!(json.get("body").is_some());
    }
}
