use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use reqwest::StatusCode;
use reqwest::blocking::{Client, ClientBuilder, RequestBuilder};
use serde::{Deserialize, Serialize};
use strum::VariantArray;
use strum_macros::{Display, VariantArray};

use crate::config::{RelationshipKind, Settings};
use crate::retry::{RetryPolicy, Retryable};

const FRIENDS_API: &str = "https://friends.roblox.com/v1/users";
const PROFILES_API: &str = "https://apis.roblox.com/user-profile-api/v1/user/profiles/get-profiles";
const THUMBNAILS_API: &str = "https://thumbnails.roblox.com/v1/users";

/// Base URLs the client talks to.
#[derive(Debug, Clone)]
struct Endpoints {
    friends: String,
    profiles: String,
    thumbnails: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            friends: FRIENDS_API.to_owned(),
            profiles: PROFILES_API.to_owned(),
            thumbnails: THUMBNAILS_API.to_owned(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::Decode(_) => false,
        }
    }
}

/// Opaque Roblox account ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn profile_url(&self) -> String {
        format!("https://www.roblox.com/users/{}/profile", self.0)
    }

    /// Shorter form used for markdown links in message text.
    pub fn link_url(&self) -> String {
        format!("https://roblox.com/users/{}/profile", self.0)
    }
}

impl From<u64> for MemberId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Thumbnails {
    pub avatar_url: Option<String>,
    pub headshot_url: Option<String>,
}

/// The remote side of a run: who is linked to the account, and what they
/// look like.
pub trait Directory {
    /// Complete member list for `kind`, in API order. Any failure is fatal.
    fn members(&self, user_id: &str, kind: RelationshipKind) -> Result<Vec<MemberId>, ApiError>;

    /// Best effort: failed batches contribute no entries.
    fn usernames(&self, ids: &[MemberId]) -> HashMap<MemberId, String>;

    /// Best effort: failed batches contribute no entries.
    fn thumbnails(&self, ids: &[MemberId]) -> HashMap<MemberId, Thumbnails>;
}

pub const fn page_limit(kind: RelationshipKind) -> u32 {
    match kind {
        RelationshipKind::Friends => 50,
        RelationshipKind::Followers | RelationshipKind::Followings => 100,
    }
}

#[derive(Debug, Deserialize)]
struct RawMember {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct FriendsPage {
    #[serde(rename = "PageItems", default)]
    page_items: Vec<RawMember>,
    #[serde(rename = "NextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FollowPage {
    #[serde(default)]
    data: Vec<RawMember>,
    next_page_cursor: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Page {
    pub members: Vec<MemberId>,
    pub next_cursor: Option<String>,
}

impl Page {
    fn parse(kind: RelationshipKind, body: &str) -> Result<Self, serde_json::Error> {
        let (items, next_cursor) = match kind {
            RelationshipKind::Friends => {
                let page: FriendsPage = serde_json::from_str(body)?;
                (page.page_items, page.next_cursor)
            }
            RelationshipKind::Followers | RelationshipKind::Followings => {
                let page: FollowPage = serde_json::from_str(body)?;
                (page.data, page.next_page_cursor)
            }
        };
        Ok(Self {
            members: items.into_iter().map(|m| MemberId::from(m.id)).collect(),
            next_cursor,
        })
    }
}

/// Follows continuation cursors until a page comes back without one.
pub fn paginate<F>(
    label: &str,
    wait: Duration,
    progress_every: Option<usize>,
    mut fetch_page: F,
) -> Result<Vec<MemberId>, ApiError>
where
    F: FnMut(Option<&str>) -> Result<Page, ApiError>,
{
    let mut members = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;

    loop {
        let page = fetch_page(cursor.as_deref())?;
        members.extend(page.members);
        pages += 1;
        if progress_every.is_some_and(|every| pages % every == 0) {
            info!("Fetched {} {label} IDs so far...", members.len());
        }

        match page.next_cursor.filter(|next| !next.is_empty()) {
            Some(next) => {
                cursor = Some(next);
                thread::sleep(wait);
            }
            None => break,
        }
    }

    info!("Fetched total {} {label} IDs.", members.len());
    Ok(members)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest<'a> {
    fields: [&'static str; 1],
    user_ids: &'a [MemberId],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    #[serde(default)]
    profile_details: Vec<ProfileDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileDetail {
    user_id: u64,
    #[serde(default)]
    names: Names,
}

#[derive(Default, Deserialize)]
struct Names {
    username: Option<String>,
}

fn parse_usernames(body: &str) -> Result<HashMap<MemberId, String>, serde_json::Error> {
    let response: ProfileResponse = serde_json::from_str(body)?;
    Ok(response
        .profile_details
        .into_iter()
        .filter_map(|detail| {
            let id = MemberId::from(detail.user_id);
            match detail.names.username {
                Some(name) if !name.is_empty() => Some((id, name)),
                _ => {
                    warn!("[Usernames] User ID {id} has an unknown username.");
                    None
                }
            }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, Display, VariantArray)]
enum ThumbnailKind {
    #[strum(to_string = "avatar")]
    Avatar,
    #[strum(to_string = "avatar-headshot")]
    Headshot,
}

#[derive(Deserialize)]
struct ThumbnailResponse {
    #[serde(default)]
    data: Vec<ThumbnailEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThumbnailEntry {
    target_id: u64,
    image_url: Option<String>,
}

fn parse_thumbnails(body: &str) -> Result<Vec<(MemberId, String)>, serde_json::Error> {
    let response: ThumbnailResponse = serde_json::from_str(body)?;
    Ok(response
        .data
        .into_iter()
        .filter_map(|entry| Some((MemberId::from(entry.target_id), entry.image_url?)))
        .collect())
}

pub struct RobloxApi {
    client: Client,
    endpoints: Endpoints,
    retry: RetryPolicy,
    wait: Duration,
    progress_every: Option<usize>,
    username_batch_size: usize,
    thumbnail_batch_size: usize,
    avatar_size: String,
    headshot_size: String,
}

impl RobloxApi {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        Self::with_endpoints(settings, Endpoints::default(), Client::builder())
    }

    fn with_endpoints(
        settings: &Settings,
        endpoints: Endpoints,
        builder: ClientBuilder,
    ) -> Result<Self, ApiError> {
        let client = builder
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoints,
            retry: settings.retry,
            wait: settings.api_wait,
            progress_every: settings.progress_every,
            username_batch_size: settings.username_batch_size,
            thumbnail_batch_size: settings.thumbnail_batch_size,
            avatar_size: settings.avatar_size.clone(),
            headshot_size: settings.headshot_size.clone(),
        })
    }

    /// Sends the request built by `build` under the retry policy and returns
    /// the body of a 200 response.
    fn send(&self, label: &str, build: impl Fn(&Client) -> RequestBuilder) -> Result<String, ApiError> {
        self.retry.run(label, || {
            let response = build(&self.client).send()?;
            let status = response.status();
            let url = response.url().clone();
            let body = response.text()?;
            debug!("{label} {url} [{status}]: {body}");
            if status != StatusCode::OK {
                return Err(ApiError::Status { status, body });
            }
            Ok(body)
        })
    }

    fn page_request(
        &self,
        user_id: &str,
        kind: RelationshipKind,
        cursor: Option<&str>,
    ) -> RequestBuilder {
        let limit = page_limit(kind).to_string();
        let request = match kind {
            RelationshipKind::Friends => self
                .client
                .get(format!("{}/{user_id}/friends/find", self.endpoints.friends))
                .query(&[("limit", limit.as_str()), ("userSort", "")]),
            RelationshipKind::Followers | RelationshipKind::Followings => self
                .client
                .get(format!("{}/{user_id}/{kind}", self.endpoints.friends))
                .query(&[("limit", limit.as_str()), ("sortOrder", "Asc")]),
        };
        match cursor {
            Some(cursor) => request.query(&[("cursor", cursor)]),
            None => request,
        }
    }

    fn fetch_page(
        &self,
        user_id: &str,
        kind: RelationshipKind,
        cursor: Option<&str>,
    ) -> Result<Page, ApiError> {
        let body = self.send(&format!("{kind} page"), |_| {
            self.page_request(user_id, kind, cursor)
        })?;
        Ok(Page::parse(kind, &body)?)
    }

    fn fetch_username_batch(&self, ids: &[MemberId]) -> Result<HashMap<MemberId, String>, ApiError> {
        let payload = ProfileRequest {
            fields: ["names.username"],
            user_ids: ids,
        };
        let body = self.send("[Usernames]", |client| {
            client
                .post(&self.endpoints.profiles)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&payload)
        })?;
        Ok(parse_usernames(&body)?)
    }

    fn thumbnail_request(&self, kind: ThumbnailKind, ids: &str) -> RequestBuilder {
        let size = match kind {
            ThumbnailKind::Avatar => &self.avatar_size,
            ThumbnailKind::Headshot => &self.headshot_size,
        };
        self.client
            .get(format!("{}/{kind}", self.endpoints.thumbnails))
            .query(&[
                ("userIds", ids),
                ("size", size.as_str()),
                ("format", "Png"),
                ("isCircular", "false"),
            ])
    }

    fn fill_thumbnails(&self, kind: ThumbnailKind, ids: &str, results: &DashMap<MemberId, Thumbnails>) {
        let fetched = self
            .send(&format!("[Thumbnails] {kind}"), |_| self.thumbnail_request(kind, ids))
            .and_then(|body| Ok(parse_thumbnails(&body)?));

        match fetched {
            Ok(entries) => {
                debug!("[Thumbnails] {kind} API returned {} results.", entries.len());
                for (id, url) in entries {
                    let mut thumbnails = results.entry(id).or_default();
                    match kind {
                        ThumbnailKind::Avatar => thumbnails.avatar_url = Some(url),
                        ThumbnailKind::Headshot => thumbnails.headshot_url = Some(url),
                    }
                }
            }
            Err(err) => warn!("[Thumbnails] failed to fetch {kind} batch: {err}"),
        }
    }

    fn log_progress(&self, batch: usize, done: usize, total: usize, what: &str) {
        if self.progress_every.is_some_and(|every| batch % every == 0) {
            info!("Fetched {what} for {done}/{total} user IDs so far...");
        }
    }
}

impl Directory for RobloxApi {
    fn members(&self, user_id: &str, kind: RelationshipKind) -> Result<Vec<MemberId>, ApiError> {
        info!("Fetching {kind} for user ID {user_id}");
        paginate(&kind.to_string(), self.wait, self.progress_every, |cursor| {
            self.fetch_page(user_id, kind, cursor)
        })
    }

    fn usernames(&self, ids: &[MemberId]) -> HashMap<MemberId, String> {
        let mut names = HashMap::new();
        let batches = ids.chunks(self.username_batch_size).collect::<Vec<_>>();

        for (index, batch) in batches.iter().enumerate() {
            match self.fetch_username_batch(batch) {
                Ok(found) => names.extend(found),
                Err(err) => warn!("[Usernames] batch {} failed: {err}", index + 1),
            }
            self.log_progress(index + 1, names.len(), ids.len(), "usernames");
            if index + 1 < batches.len() {
                thread::sleep(self.wait);
            }
        }

        info!("Fetched usernames for {}/{} user IDs.", names.len(), ids.len());
        names
    }

    fn thumbnails(&self, ids: &[MemberId]) -> HashMap<MemberId, Thumbnails> {
        info!("Fetching avatars and headshots for {} user IDs", ids.len());
        let results = DashMap::new();
        let batches = ids.chunks(self.thumbnail_batch_size).collect::<Vec<_>>();

        for (index, batch) in batches.iter().enumerate() {
            let joined = batch.iter().map(MemberId::as_str).collect::<Vec<_>>().join(",");
            let (joined, results) = (joined.as_str(), &results);

            // the avatar and headshot requests for one batch run side by side.
            thread::scope(|scope| {
                for kind in ThumbnailKind::VARIANTS {
                    scope.spawn(move || self.fill_thumbnails(*kind, joined, results));
                }
            });

            self.log_progress(index + 1, results.len(), ids.len(), "avatars/headshots");
            if index + 1 < batches.len() {
                thread::sleep(self.wait);
            }
        }

        info!("Fetched avatars and headshots for {}/{} user IDs.", results.len(), ids.len());
        results.into_iter().collect()
    }
}
