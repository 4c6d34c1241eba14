use std::collections::{HashMap, HashSet};

use color_eyre::{Result, eyre::Context};
use log::{debug, info, warn};

use crate::config::Settings;
use crate::diff::{self, MemberDiff};
use crate::notify::{self, Entry, Notifier, Profile, Sink};
use crate::roblox::{Directory, MemberId};
use crate::storage;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub total_members: usize,
    pub new_members: usize,
    pub removed_members: usize,
    pub webhooks_sent: usize,
    pub webhooks_failed: usize,
    pub snapshot_updated: bool,
}

/// One full run: fetch, diff, enrich, notify, persist.
///
/// A fetch failure returns before anything is written, so the next run diffs
/// against the same snapshot.
pub fn run<D: Directory, S: Sink>(settings: &Settings, directory: &D, sink: &S) -> Result<RunReport> {
    storage::ensure_files(
        &[
            settings.local_data_file.as_path(),
            settings.last_run_time_file.as_path(),
        ],
        settings.create_missing_files,
    )?;
    if settings.show_loaded_settings {
        settings.log_summary();
    }

    let fetched = directory
        .members(&settings.user_id, settings.relationship)
        .wrap_err_with(|| {
            format!(
                "failed to fetch {} for user {}",
                settings.relationship, settings.user_id
            )
        })?;
    let current = dedup(fetched);
    info!("Fetched {} user IDs from Roblox API.", current.len());

    let previous = storage::load_snapshot(&settings.local_data_file)?;
    let diff = diff::compute_diff(&previous, &current);
    if diff.is_empty() {
        info!("No changes since the last run.");
    } else {
        info!(
            "{} new, {} removed since the last run.",
            diff.new_members.len(),
            diff.removed_members.len()
        );
    }

    let mut report = RunReport {
        total_members: current.len(),
        new_members: diff.new_members.len(),
        removed_members: diff.removed_members.len(),
        ..RunReport::default()
    };

    let (new_members, removed_members) = notified_members(settings, &diff);
    if new_members.is_empty() && removed_members.is_empty() {
        info!("No new or removed users to fetch usernames or avatars for.");
    } else {
        let to_enrich: Vec<MemberId> = new_members.iter().chain(removed_members).cloned().collect();
        let profiles = enrich(directory, &to_enrich);

        let footer = embed_footer(storage::timestamp("%d.%m.%Y %H:%M"));
        let planned = notify::message_count(new_members.len()) + notify::message_count(removed_members.len());
        let mut notifier = Notifier::new(settings, sink, footer, planned);
        notifier.send(&entries(new_members, &profiles, false, current.len()));
        notifier.send(&entries(removed_members, &profiles, true, current.len()));

        let delivery = notifier.delivery();
        report.webhooks_sent = delivery.sent;
        report.webhooks_failed = delivery.failed;
    }

    report.snapshot_updated = storage::update_snapshot(&settings.local_data_file, &previous, &current)?;
    storage::write_last_run(&settings.last_run_time_file)?;
    Ok(report)
}

/// The slices of `diff` that will actually be posted somewhere.
fn notified_members<'d>(settings: &Settings, diff: &'d MemberDiff) -> (&'d [MemberId], &'d [MemberId]) {
    let none: &[MemberId] = &[];
    if settings.enabled_channels().is_empty() {
        return (none, none);
    }
    let new_members = if settings.send_new_entries { &diff.new_members[..] } else { none };
    let removed_members = if settings.send_removed_entries { &diff.removed_members[..] } else { none };
    (new_members, removed_members)
}

fn dedup(ids: Vec<MemberId>) -> Vec<MemberId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn enrich<D: Directory>(directory: &D, ids: &[MemberId]) -> HashMap<MemberId, Profile> {
    let mut names = directory.usernames(ids);
    let mut thumbnails = directory.thumbnails(ids);

    ids.iter()
        .map(|id| {
            let images = thumbnails.remove(id).unwrap_or_default();
            let profile = Profile {
                name: names.remove(id),
                avatar_url: images.avatar_url,
                headshot_url: images.headshot_url,
            };
            (id.clone(), profile)
        })
        .collect()
}

fn entries(
    ids: &[MemberId],
    profiles: &HashMap<MemberId, Profile>,
    removed: bool,
    total_count: usize,
) -> Vec<Entry> {
    ids.iter()
        .map(|id| {
            let entry = Entry {
                id: id.clone(),
                profile: profiles.get(id).cloned().unwrap_or_default(),
                removed,
                total_count,
            };
            debug!("{} user data: {entry:?}", if removed { "Removed" } else { "New" });
            entry
        })
        .collect()
}

/// Embed footer. A clock failure drops the timestamp instead of the run.
fn embed_footer(timestamp: Result<String, storage::StorageError>) -> String {
    let timestamp = timestamp
        .map_err(|err| warn!("Could not format the embed timestamp: {err}"))
        .ok();
    notify::footer_text(timestamp.as_deref())
}
