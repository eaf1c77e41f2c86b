use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A normalized chat message as it flows between pipeline stages.
///
/// The layout fields (`x`, `y`) and cluster fields are filled in by the
/// projection and clustering stages and omitted from JSON until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub channel: Option<String>,
    pub channel_name: String,
    pub guild_id: Option<String>,
    pub guild_name: String,
    pub author: String,
    pub content: String,
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: Option<String>,
    pub category: Option<String>,
    pub count: usize,
}

/// Channel metadata keyed by channel id.
pub type ChannelMap = BTreeMap<String, ChannelInfo>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// --- DiscordChatExporter schema ---

#[derive(Debug, Default, Deserialize)]
pub struct ExportFile {
    #[serde(default)]
    pub guild: ExportGuild,
    #[serde(default)]
    pub channel: ExportChannel,
    #[serde(default)]
    pub messages: Vec<ExportMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportGuild {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportChannel {
    pub id: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportMessage {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: String,
    pub timestamp: Option<String>,
    #[serde(default)]
    pub author: ExportAuthor,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAuthor {
    pub name: Option<String>,
    pub nickname: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl ExportAuthor {
    /// Nickname when set, else the account name.
    pub fn display_name(&self) -> String {
        self.nickname
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| self.name.as_deref())
            .unwrap_or("Unknown")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_omits_unset_layout_fields() {
        let record = MessageRecord {
            id: "1".to_string(),
            channel: Some("c1".to_string()),
            channel_name: "general".to_string(),
            guild_id: None,
            guild_name: "Unknown Server".to_string(),
            author: "ana".to_string(),
            content: "hello there everyone in chat".to_string(),
            timestamp: None,
            x: None,
            y: None,
            cluster: None,
            cluster_name: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("x").is_none());
        assert!(json.get("cluster_name").is_none());
        assert!(json.get("guild_id").unwrap().is_null());
    }

    #[test]
    fn test_export_defaults() {
        let raw = r#"{"messages": [{"id": "9", "type": "Default", "author": {"name": "bo"}}]}"#;
        let export: ExportFile = serde_json::from_str(raw).unwrap();

        assert!(export.guild.id.is_none());
        let msg = &export.messages[0];
        assert_eq!(msg.content, "");
        assert!(!msg.author.is_bot);
        assert_eq!(msg.author.display_name(), "bo");
    }

    #[test]
    fn test_display_name_prefers_nickname() {
        let author = ExportAuthor {
            name: Some("account".to_string()),
            nickname: Some("Nick".to_string()),
            is_bot: false,
        };
        assert_eq!(author.display_name(), "Nick");

        let empty_nick = ExportAuthor {
            name: Some("account".to_string()),
            nickname: Some(String::new()),
            is_bot: false,
        };
        assert_eq!(empty_nick.display_name(), "account");
        assert_eq!(ExportAuthor::default().display_name(), "Unknown");
    }
}
