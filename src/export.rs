use crate::artifacts::{self, Artifacts};
use crate::model::{ChannelInfo, ChannelMap, ExportFile, GuildInfo, MessageRecord};
use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Characters bot commands commonly start with.
const COMMAND_PREFIX_CHARS: &[char] = &['!', '#', '$', '@', '%', '^', '&', '*'];

/// Channel-level metadata of one export file.
#[derive(Debug, Clone, Default)]
pub struct ExportMeta {
    pub guild_id: Option<String>,
    pub guild_name: Option<String>,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Default)]
pub struct ParsedExports {
    pub messages: Vec<MessageRecord>,
    pub channels: ChannelMap,
    pub guild: GuildInfo,
    pub files_seen: usize,
    pub files_failed: usize,
}

/// Removes a leading run of command prefix characters and the whitespace after it.
pub fn strip_command_prefix(content: &str) -> &str {
    let rest = content.trim_start_matches(COMMAND_PREFIX_CHARS);
    if rest.len() == content.len() {
        return content;
    }
    rest.trim_start()
}

/// Lists `*.json` files in `dir`, sorted by file name.
pub fn list_export_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parses a single export, applying the message filters.
pub fn parse_export_file(
    path: &Path,
    min_length: usize,
) -> anyhow::Result<(Vec<MessageRecord>, ExportMeta)> {
    let raw = fs::read_to_string(path)?;
    let export: ExportFile = serde_json::from_str(&raw)?;
    Ok(filter_export(export, min_length))
}

pub fn filter_export(export: ExportFile, min_length: usize) -> (Vec<MessageRecord>, ExportMeta) {
    let ExportFile {
        guild,
        channel,
        messages: raw_messages,
    } = export;

    let mut messages = Vec::new();
    for msg in raw_messages {
        // Joins, pins, thread notices etc.
        if msg.kind.as_deref() != Some("Default") {
            continue;
        }
        if msg.content.chars().count() < min_length {
            continue;
        }
        if msg.author.is_bot {
            continue;
        }
        let Some(id) = msg.id.clone() else {
            continue;
        };

        messages.push(MessageRecord {
            id,
            channel: channel.id.clone(),
            channel_name: channel.name.clone().unwrap_or_else(|| "unknown".to_string()),
            guild_id: guild.id.clone(),
            guild_name: guild
                .name
                .clone()
                .unwrap_or_else(|| "Unknown Server".to_string()),
            author: msg.author.display_name(),
            content: strip_command_prefix(&msg.content).to_string(),
            timestamp: msg.timestamp,
            x: None,
            y: None,
            cluster: None,
            cluster_name: None,
        });
    }

    let meta = ExportMeta {
        guild_id: guild.id,
        guild_name: guild.name,
        channel_id: channel.id,
        channel_name: channel.name,
        category: channel.category,
    };

    (messages, meta)
}

/// Parses every export in `dir`. Files that fail to parse are logged and skipped.
pub fn parse_exports(dir: &Path, min_length: usize) -> anyhow::Result<ParsedExports> {
    let files = list_export_files(dir)?;
    let mut out = ParsedExports {
        files_seen: files.len(),
        ..Default::default()
    };
    let mut seen_ids: HashSet<String> = HashSet::new();

    for path in &files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Parsing {}...", file_name);

        let (messages, meta) = match parse_export_file(path, min_length) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Error parsing {}: {}", file_name, e);
                out.files_failed += 1;
                continue;
            }
        };

        if out.guild.id.is_none() && meta.guild_id.is_some() {
            out.guild = GuildInfo {
                id: meta.guild_id.clone(),
                name: meta.guild_name.clone(),
            };
        }

        let before = out.messages.len();
        for msg in messages {
            if seen_ids.insert(msg.id.clone()) {
                out.messages.push(msg);
            }
        }
        let added = out.messages.len() - before;

        let channel_key = meta.channel_id.clone().unwrap_or_default();
        out.channels
            .entry(channel_key)
            .or_insert_with(|| ChannelInfo {
                name: meta.channel_name.clone(),
                category: meta.category.clone(),
                count: 0,
            })
            .count += added;

        info!("  {} messages extracted", added);
    }

    Ok(out)
}

/// Earliest and latest parseable timestamps among `messages`.
pub fn time_span(
    messages: &[MessageRecord],
) -> Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
    let mut stamps = messages
        .iter()
        .filter_map(|m| m.timestamp.as_deref())
        .filter_map(|ts| DateTime::parse_from_rfc3339(ts).ok());

    let first = stamps.next()?;
    Some(stamps.fold((first, first), |(lo, hi), ts| (lo.min(ts), hi.max(ts))))
}

/// Runs the parse stage: exports dir in, `messages_raw.json`, `channels.json`
/// and `guild.json` out. Returns the number of unique messages written.
pub fn run(exports_dir: &Path, out: &Artifacts, min_length: usize) -> anyhow::Result<usize> {
    let parsed = parse_exports(exports_dir, min_length)?;

    if parsed.files_seen == 0 {
        warn!("No JSON files found in {}", exports_dir.display());
        warn!("Please export your Discord channels using DiscordChatExporter:");
        warn!("  DiscordChatExporter.Cli export -t TOKEN -c CHANNEL_ID -f Json -o exports/");
        return Ok(0);
    }

    info!(
        "Total: {} unique messages from {} file(s) ({} failed)",
        parsed.messages.len(),
        parsed.files_seen,
        parsed.files_failed
    );

    let mut distribution: Vec<_> = parsed.channels.values().collect();
    distribution.sort_by(|a, b| b.count.cmp(&a.count));
    info!("Channel distribution:");
    for channel in distribution {
        info!(
            "  {}: {} messages",
            channel.name.as_deref().unwrap_or("unknown"),
            channel.count
        );
    }

    if let Some((earliest, latest)) = time_span(&parsed.messages) {
        info!("Time span: {} .. {}", earliest.to_rfc3339(), latest.to_rfc3339());
    }

    out.ensure_dir()?;
    artifacts::write_json(&out.path(artifacts::MESSAGES_RAW), &parsed.messages)?;
    artifacts::write_json(&out.path(artifacts::CHANNELS), &parsed.channels)?;
    artifacts::write_json(&out.path(artifacts::GUILD), &parsed.guild)?;
    info!(
        "Saved {} messages to {}",
        parsed.messages.len(),
        out.path(artifacts::MESSAGES_RAW).display()
    );

    Ok(parsed.messages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn export(messages: serde_json::Value) -> ExportFile {
        serde_json::from_value(json!({
            "guild": {"id": "g1", "name": "Guild"},
            "channel": {"id": "c1", "name": "general", "category": "Text"},
            "messages": messages,
        }))
        .unwrap()
    }

    #[test]
    fn test_strip_command_prefix() {
        assert_eq!(strip_command_prefix("!play some long song name"), "play some long song name");
        assert_eq!(strip_command_prefix("$$  balance please"), "balance please");
        assert_eq!(strip_command_prefix("plain message"), "plain message");
        assert_eq!(strip_command_prefix("  !not at start"), "  !not at start");
    }

    #[test]
    fn test_filters_bots_short_and_system_messages() {
        let (messages, meta) = filter_export(
            export(json!([
                {"id": "1", "type": "Default", "content": "this message is long enough to keep",
                 "author": {"name": "ana", "isBot": false}},
                {"id": "2", "type": "Default", "content": "too short",
                 "author": {"name": "ana"}},
                {"id": "3", "type": "Default", "content": "bot output that is long enough here",
                 "author": {"name": "bot", "isBot": true}},
                {"id": "4", "type": "GuildMemberJoin", "content": "someone joined the server just now",
                 "author": {"name": "new"}},
            ])),
            20,
        );

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "1");
        assert_eq!(messages[0].channel_name, "general");
        assert_eq!(messages[0].guild_name, "Guild");
        assert_eq!(meta.category.as_deref(), Some("Text"));
    }

    #[test]
    fn test_length_checked_before_prefix_strip() {
        // 20 characters including the prefix
        let (messages, _) = filter_export(
            export(json!([
                {"id": "1", "type": "Default", "content": "!! abcdefghijklmnopq", "author": {"name": "a"}},
            ])),
            20,
        );
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "abcdefghijklmnopq");
    }

    #[test]
    fn test_time_span() {
        let (mut messages, _) = filter_export(
            export(json!([
                {"id": "1", "type": "Default", "content": "first message of the export",
                 "timestamp": "2024-03-02T10:00:00+00:00", "author": {"name": "a"}},
                {"id": "2", "type": "Default", "content": "second message of the export",
                 "timestamp": "2024-01-05T08:30:00+00:00", "author": {"name": "a"}},
            ])),
            20,
        );
        let (lo, hi) = time_span(&messages).unwrap();
        assert_eq!(lo.to_rfc3339(), "2024-01-05T08:30:00+00:00");
        assert_eq!(hi.to_rfc3339(), "2024-03-02T10:00:00+00:00");

        messages.iter_mut().for_each(|m| m.timestamp = None);
        assert!(time_span(&messages).is_none());
    }
}
