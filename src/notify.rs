use std::thread;

use log::{debug, error, info};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::{Channel, RelationshipKind, Settings};
use crate::retry::{RetryPolicy, Retryable};
use crate::roblox::MemberId;

pub const COLOR_NEW: u32 = 2_330_091;
pub const COLOR_REMOVED: u32 = 16_711_680;
pub const DEFAULT_ICON_URL: &str =
    "https://github.com/Nieznany237/-Public_Images/blob/main/Roblox/RobloxDeletedContent.png?raw=true";
pub const EMBEDS_PER_MESSAGE: usize = 10;
const UNKNOWN_NAME: &str = "Unknown";
const PROGRESS_EVERY_WEBHOOKS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Error: {status}, {body}")]
    Status { status: StatusCode, body: String },
}

impl Retryable for WebhookError {
    /// A 5xx may arrive after the message was already posted, so only
    /// rate limiting is repeated.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// What is known about a member beyond their ID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub headshot_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: MemberId,
    pub profile: Profile,
    pub removed: bool,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookMessage {
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub footer: EmbedFooter,
    pub author: EmbedAuthor,
    pub thumbnail: EmbedImage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedAuthor {
    pub name: String,
    pub url: String,
    pub icon_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedImage {
    pub url: String,
}

pub fn footer_text(timestamp: Option<&str>) -> String {
    let version = env!("CARGO_PKG_VERSION");
    match timestamp {
        Some(timestamp) => format!("Automatic script - Version {version} | {timestamp}"),
        None => format!("Automatic script - Version {version}"),
    }
}

/// Title and description for one entry. `link` is the markdown profile link.
fn template(kind: RelationshipKind, removed: bool, link: &str) -> (&'static str, String) {
    match (kind, removed) {
        (RelationshipKind::Friends, false) => {
            ("New Friend", format!("You became friends with {link}."))
        }
        (RelationshipKind::Friends, true) => (
            "Friend Removed",
            format!("You and {link} are no longer friends."),
        ),
        (RelationshipKind::Followers, false) => {
            ("New Follower", format!("{link} is now following you."))
        }
        (RelationshipKind::Followers, true) => {
            ("Lost a Follower", format!("{link} has unfollowed you."))
        }
        (RelationshipKind::Followings, false) => {
            ("Now Following", format!("You started following {link}."))
        }
        (RelationshipKind::Followings, true) => {
            ("Unfollowed a User", format!("You stopped following {link}."))
        }
    }
}

pub fn render_embed(kind: RelationshipKind, entry: &Entry, footer: &str) -> Embed {
    let name = entry.profile.name.as_deref().unwrap_or(UNKNOWN_NAME);
    let profile_url = entry.id.profile_url();
    let link = format!("[{name}]({})", entry.id.link_url());
    let (title, description) = template(kind, entry.removed, &link);

    Embed {
        title: title.to_owned(),
        description: format!("{description}\nYou currently have: {}", entry.total_count),
        color: if entry.removed { COLOR_REMOVED } else { COLOR_NEW },
        footer: EmbedFooter {
            text: footer.to_owned(),
        },
        author: EmbedAuthor {
            name: format!("{name} [{}]", entry.id),
            url: profile_url,
            icon_url: entry
                .profile
                .headshot_url
                .clone()
                .unwrap_or_else(|| DEFAULT_ICON_URL.to_owned()),
        },
        thumbnail: EmbedImage {
            url: entry
                .profile
                .avatar_url
                .clone()
                .unwrap_or_else(|| DEFAULT_ICON_URL.to_owned()),
        },
    }
}

/// One message per `EMBEDS_PER_MESSAGE` entries.
pub fn build_messages(kind: RelationshipKind, entries: &[Entry], footer: &str) -> Vec<WebhookMessage> {
    entries
        .chunks(EMBEDS_PER_MESSAGE)
        .map(|chunk| WebhookMessage {
            embeds: chunk
                .iter()
                .map(|entry| render_embed(kind, entry, footer))
                .collect(),
        })
        .filter(|message| !message.embeds.is_empty())
        .collect()
}

pub const fn message_count(entries: usize) -> usize {
    entries.div_ceil(EMBEDS_PER_MESSAGE)
}

/// Where rendered messages go.
pub trait Sink {
    fn deliver(&self, channel: Channel, url: &str, message: &WebhookMessage) -> Result<(), WebhookError>;
}

pub struct WebhookSink {
    client: Client,
    retry: RetryPolicy,
}

impl WebhookSink {
    pub fn new(settings: &Settings) -> Result<Self, WebhookError> {
        Ok(Self {
            client: Client::builder().timeout(settings.request_timeout).build()?,
            retry: settings.retry,
        })
    }
}

impl Sink for WebhookSink {
    fn deliver(&self, channel: Channel, url: &str, message: &WebhookMessage) -> Result<(), WebhookError> {
        self.retry.run(&format!("[{channel}] webhook"), || {
            let response = self.client.post(url).json(message).send()?;
            match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
                status => Err(WebhookError::Status {
                    status,
                    body: response.text().unwrap_or_default(),
                }),
            }
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub failed: usize,
}

/// Sends batches to every enabled channel, pacing batches by `embed_wait`.
/// Delivery failures are logged and counted, never propagated.
pub struct Notifier<'a, S> {
    settings: &'a Settings,
    sink: &'a S,
    footer: String,
    channels: Vec<Channel>,
    total: usize,
    batches: usize,
    delivery: Delivery,
}

impl<'a, S: Sink> Notifier<'a, S> {
    /// `planned_messages` is the number of batches across both phases, used
    /// for progress reporting.
    pub fn new(settings: &'a Settings, sink: &'a S, footer: String, planned_messages: usize) -> Self {
        let channels = settings.enabled_channels();
        Self {
            settings,
            sink,
            footer,
            total: planned_messages * channels.len(),
            channels,
            batches: 0,
            delivery: Delivery::default(),
        }
    }

    pub fn send(&mut self, entries: &[Entry]) {
        if self.channels.is_empty() {
            return;
        }

        for message in build_messages(self.settings.relationship, entries, &self.footer) {
            if self.batches > 0 {
                thread::sleep(self.settings.embed_wait);
            }
            self.batches += 1;

            for channel in &self.channels {
                let url = self.settings.webhook_url(*channel);
                match self.sink.deliver(*channel, url, &message) {
                    Ok(()) => {
                        self.delivery.sent += 1;
                        debug!("[{channel}] - OK");
                    }
                    Err(err) => {
                        self.delivery.failed += 1;
                        error!("[{channel}] - {err}");
                    }
                }
                self.log_progress();
            }
        }
    }

    fn log_progress(&self) {
        let done = self.delivery.sent + self.delivery.failed;
        if done % PROGRESS_EVERY_WEBHOOKS == 0 || done == self.total {
            info!(
                "Webhooks sent: {done} | Webhooks waiting: {}",
                self.total.saturating_sub(done)
            );
        }
    }

    pub const fn delivery(&self) -> Delivery {
        self.delivery
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::Path;

    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn entry(id: &str, removed: bool) -> Entry {
        Entry {
            id: MemberId::new(id),
            profile: Profile {
                name: Some(format!("user{id}")),
                avatar_url: Some(format!("https://cdn/avatar/{id}.png")),
                headshot_url: Some(format!("https://cdn/headshot/{id}.png")),
            },
            removed,
            total_count: 42,
        }
    }

    #[test_case(RelationshipKind::Friends, false, "New Friend", "You became friends with [user7](https://roblox.com/users/7/profile).")]
    #[test_case(RelationshipKind::Friends, true, "Friend Removed", "You and [user7](https://roblox.com/users/7/profile) are no longer friends.")]
    #[test_case(RelationshipKind::Followers, false, "New Follower", "[user7](https://roblox.com/users/7/profile) is now following you.")]
    #[test_case(RelationshipKind::Followers, true, "Lost a Follower", "[user7](https://roblox.com/users/7/profile) has unfollowed you.")]
    #[test_case(RelationshipKind::Followings, false, "Now Following", "You started following [user7](https://roblox.com/users/7/profile).")]
    #[test_case(RelationshipKind::Followings, true, "Unfollowed a User", "You stopped following [user7](https://roblox.com/users/7/profile).")]
    fn templates(kind: RelationshipKind, removed: bool, title: &str, description: &str) {
        let embed = render_embed(kind, &entry("7", removed), "footer");

        assert_eq!(embed.title, title);
        assert_eq!(embed.description, format!("{description}\nYou currently have: 42"));
        assert_eq!(embed.color, if removed { COLOR_REMOVED } else { COLOR_NEW });
    }

    #[test]
    fn templates_are_distinct() {
        let kinds = [
            RelationshipKind::Friends,
            RelationshipKind::Followers,
            RelationshipKind::Followings,
        ];
        let mut titles = Vec::new();
        for kind in kinds {
            for removed in [false, true] {
                titles.push(template(kind, removed, "x").0);
            }
        }
        titles.sort_unstable();
        titles.dedup();
        assert_eq!(titles.len(), 6);
    }

    #[test]
    fn missing_profile_falls_back_to_placeholders() {
        let entry = Entry {
            id: MemberId::new("9"),
            profile: Profile::default(),
            removed: false,
            total_count: 1,
        };
        let embed = render_embed(RelationshipKind::Followers, &entry, "footer");

        assert_eq!(embed.author.name, "Unknown [9]");
        assert_eq!(embed.author.icon_url, DEFAULT_ICON_URL);
        assert_eq!(embed.thumbnail.url, DEFAULT_ICON_URL);
        assert!(embed.description.starts_with("[Unknown](https://roblox.com/users/9/profile)"));
    }

    #[test]
    fn embed_wire_format() {
        let embed = render_embed(RelationshipKind::Friends, &entry("3", false), "Automatic script");
        let message = WebhookMessage { embeds: vec![embed] };

        assert_eq!(
            serde_json::to_value(&message).expect("serialize"),
            json!({
                "embeds": [{
                    "title": "New Friend",
                    "description": "You became friends with [user3](https://roblox.com/users/3/profile).\nYou currently have: 42",
                    "color": COLOR_NEW,
                    "footer": { "text": "Automatic script" },
                    "author": {
                        "name": "user3 [3]",
                        "url": "https://www.roblox.com/users/3/profile",
                        "icon_url": "https://cdn/headshot/3.png"
                    },
                    "thumbnail": { "url": "https://cdn/avatar/3.png" }
                }]
            })
        );
    }

    #[test_case(0, 0)]
    #[test_case(1, 1)]
    #[test_case(10, 1)]
    #[test_case(11, 2)]
    #[test_case(25, 3)]
    fn batches_ten_embeds_per_message(entries: usize, messages: usize) {
        let entries: Vec<_> = (0..entries).map(|i| entry(&i.to_string(), false)).collect();
        let built = build_messages(RelationshipKind::Friends, &entries, "f");

        assert_eq!(built.len(), messages);
        assert_eq!(message_count(entries.len()), messages);
        assert!(built.iter().all(|m| !m.embeds.is_empty() && m.embeds.len() <= EMBEDS_PER_MESSAGE));
        assert_eq!(built.iter().map(|m| m.embeds.len()).sum::<usize>(), entries.len());
    }

    #[test]
    fn footer_carries_version() {
        assert_eq!(
            footer_text(Some("01.02.2026 10:00")),
            format!("Automatic script - Version {} | 01.02.2026 10:00", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn footer_without_timestamp_has_no_separator() {
        assert_eq!(
            footer_text(None),
            format!("Automatic script - Version {}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test_case(StatusCode::TOO_MANY_REQUESTS, true)]
    #[test_case(StatusCode::INTERNAL_SERVER_ERROR, false)]
    #[test_case(StatusCode::BAD_GATEWAY, false)]
    #[test_case(StatusCode::NOT_FOUND, false)]
    fn webhook_status_retryability(status: StatusCode, expected: bool) {
        let err = WebhookError::Status { status, body: String::new() };
        assert_eq!(err.is_retryable(), expected);
    }

    #[derive(Default)]
    struct FlakySink {
        fail: Option<Channel>,
        delivered: RefCell<Vec<(Channel, String, usize)>>,
    }

    impl Sink for FlakySink {
        fn deliver(&self, channel: Channel, url: &str, message: &WebhookMessage) -> Result<(), WebhookError> {
            if self.fail == Some(channel) {
                return Err(WebhookError::Status {
                    status: StatusCode::BAD_REQUEST,
                    body: "nope".into(),
                });
            }
            self.delivered
                .borrow_mut()
                .push((channel, url.to_owned(), message.embeds.len()));
            Ok(())
        }
    }

    fn settings(discord: &str, guilded: &str) -> Settings {
        let config = json!({
            "discord_webhook_url": discord,
            "guilded_webhook_url": guilded,
            "relationshipType": "followers",
            "Your_User_ID": 1,
            "send_discord_log": true,
            "send_guilded_log": true,
            "send_new_entries": true,
            "send_removed_entries": true,
            "embed_wait_HTTP": 0
        });
        Settings::parse(&config.to_string(), Path::new("")).expect("settings")
    }

    #[test]
    fn failing_channel_does_not_stop_the_other() {
        let settings = settings(
            "https://discord.com/api/webhooks/1/a",
            "https://media.guilded.gg/webhooks/2/b",
        );
        let sink = FlakySink {
            fail: Some(Channel::Discord),
            ..FlakySink::default()
        };
        let entries: Vec<_> = (0..15).map(|i| entry(&i.to_string(), true)).collect();

        let mut notifier = Notifier::new(&settings, &sink, "f".into(), 2);
        notifier.send(&entries);

        assert_eq!(notifier.delivery(), Delivery { sent: 2, failed: 2 });
        assert_eq!(
            sink.delivered.into_inner(),
            vec![
                (Channel::Guilded, "https://media.guilded.gg/webhooks/2/b".to_owned(), 10),
                (Channel::Guilded, "https://media.guilded.gg/webhooks/2/b".to_owned(), 5),
            ]
        );
    }

    #[test]
    fn disabled_channel_receives_nothing() {
        let settings = settings("https://evil.example/hook", "https://media.guilded.gg/webhooks/2/b");
        let sink = FlakySink::default();

        let mut notifier = Notifier::new(&settings, &sink, "f".into(), 1);
        notifier.send(&[entry("1", false)]);

        let delivered = sink.delivered.into_inner();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, Channel::Guilded);
    }

    #[test]
    fn empty_entries_send_nothing() {
        let settings = settings(
            "https://discord.com/api/webhooks/1/a",
            "https://media.guilded.gg/webhooks/2/b",
        );
        let sink = FlakySink::default();

        let mut notifier = Notifier::new(&settings, &sink, "f".into(), 0);
        notifier.send(&[]);

        assert_eq!(notifier.delivery(), Delivery::default());
        assert!(sink.delivered.into_inner().is_empty());
    }
}
