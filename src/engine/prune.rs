//! Garbage-collects obsolete backup tags (and any other unused tag of a
//! repository that is otherwise in use), per spec.md §4.E.5.

use crate::engine_gateway::{ContainerInfo, EngineGateway, ImageInfo};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{info, warn};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

struct RepoEntry {
    tag: String,
    image_id: String,
}

pub async fn prune(engine: &dyn EngineGateway, backup_retention: chrono::Duration, cancel: &CancellationToken) {
    info!("Prune phase starting.");

    let containers = match engine.list_containers(true).await {
        Ok(c) => c,
        Err(e) => {
            warn!("Prune phase: failed to list containers, skipping this cycle: {e}");
            return;
        }
    };
    let used_ids: HashSet<String> = containers.into_iter().map(|c: ContainerInfo| c.image_id).collect();

    let images = match engine.list_images(true).await {
        Ok(i) => i,
        Err(e) => {
            warn!("Prune phase: failed to list images, skipping this cycle: {e}");
            return;
        }
    };

    let mut by_repo: HashMap<String, Vec<RepoEntry>> = HashMap::new();
    for image in &images {
        let Some(repo) = repo_from_digests(image) else { continue };
        let entries = by_repo.entry(repo.clone()).or_default();
        for repo_tag in &image.repo_tags {
            if let Some((tag_repo, tag)) = repo_tag.rsplit_once(':') {
                if tag_repo == repo {
                    entries.push(RepoEntry { tag: tag.to_string(), image_id: image.id.clone() });
                }
            }
        }
    }

    let backup_re = Regex::new(r"^backup-(\d{14})$").expect("static regex");
    let now = Utc::now();
    let mut deleted = 0usize;

    for (repo, entries) in by_repo {
        if cancel.is_cancelled() {
            info!("Prune phase: cancellation requested, stopping before repository `{repo}`.");
            break;
        }

        let repo_in_use = entries.iter().any(|e| used_ids.contains(&e.image_id));
        if !repo_in_use {
            continue;
        }

        for entry in entries {
            if used_ids.contains(&entry.image_id) {
                continue;
            }

            let should_delete = match backup_re.captures(&entry.tag) {
                Some(caps) => match parse_backup_stamp(&caps[1]) {
                    Some(stamp) => now.signed_duration_since(stamp) > backup_retention,
                    None => true,
                },
                None => true,
            };

            if should_delete {
                let reference = format!("{repo}:{}", entry.tag);
                match engine.delete_image(&reference, false).await {
                    Ok(()) => {
                        deleted += 1;
                        info!("Prune phase: deleted `{reference}`.");
                    }
                    Err(e) => warn!("Prune phase: failed to delete `{reference}`: {e}"),
                }
            }
        }
    }

    info!("Prune phase complete: {deleted} image(s) deleted.");
}

fn repo_from_digests(image: &ImageInfo) -> Option<String> {
    image.repo_digests.first().and_then(|d| d.rsplit_once('@')).map(|(repo, _)| repo.to_string())
}

fn parse_backup_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok().map(|naive| naive.and_utc())
}
