//! Folder path resolution and subtree membership.

use bridge_traits::change_feed::{ChangeFeedClient, FolderCredentials, RemoteFolder};
use bridge_traits::error::Result as BridgeResult;
use std::collections::{HashMap, HashSet};

/// Build a remote folder id → display path map for a synced root.
///
/// The root maps to `root_name`; every descendant maps to
/// `<parent path>/<name>`. Folders whose parent chain never reaches the root
/// (or loops) are left out.
pub fn build_folder_paths(
    root_id: &str,
    root_name: &str,
    folders: &[RemoteFolder],
) -> HashMap<String, String> {
    let by_id: HashMap<&str, &RemoteFolder> = folders.iter().map(|f| (f.id.as_str(), f)).collect();
    let mut paths: HashMap<String, String> = HashMap::with_capacity(folders.len() + 1);
    paths.insert(root_id.to_string(), root_name.to_string());

    for folder in folders {
        if paths.contains_key(&folder.id) {
            continue;
        }

        // Walk up until a folder with a known path, collecting the chain
        let mut chain: Vec<&RemoteFolder> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut cursor = Some(folder);
        let mut base: Option<String> = None;

        while let Some(current) = cursor {
            if let Some(path) = paths.get(&current.id) {
                base = Some(path.clone());
                break;
            }
            if !seen.insert(current.id.as_str()) {
                break;
            }
            chain.push(current);
            cursor = current
                .parent_id
                .as_deref()
                .and_then(|parent| {
                    if parent == root_id {
                        base = Some(root_name.to_string());
                        None
                    } else {
                        by_id.get(parent).copied()
                    }
                });
            if base.is_some() {
                break;
            }
        }

        let Some(mut path) = base else {
            continue;
        };
        for link in chain.into_iter().rev() {
            path = format!("{}/{}", path, link.name);
            paths.insert(link.id.clone(), path.clone());
        }
    }

    paths
}

/// Decide whether an entry with `parents` lives below `root_id`.
///
/// `known` holds folder ids already known to be inside the subtree and
/// short-circuits the walk. Otherwise parents are fetched level by level up
/// to `max_depth`, with a visited set so cyclic parent data terminates.
pub async fn is_within_root(
    client: &dyn ChangeFeedClient,
    credentials: &FolderCredentials,
    root_id: &str,
    parents: &[String],
    known: &HashMap<String, String>,
    max_depth: usize,
) -> BridgeResult<bool> {
    let mut frontier: Vec<String> = parents.to_vec();
    let mut visited: HashSet<String> = HashSet::new();

    for _ in 0..max_depth {
        if frontier.is_empty() {
            return Ok(false);
        }

        let mut next = Vec::new();
        for id in frontier {
            if id == root_id || known.contains_key(&id) {
                return Ok(true);
            }
            if !visited.insert(id.clone()) {
                continue;
            }
            next.extend(client.get_parent_ids(credentials, &id).await?);
        }
        frontier = next;
    }

    Ok(false)
}
