//! Folder reconstruction for torrent/magnet file listings.
//!
//! Engines and debrid services report files as flat `a/b/c.ext` paths. The
//! dashboard wants a nested tree with folder sizes, and selection has to cascade
//! through that tree.

use std::collections::{BTreeMap, HashSet};

use crate::models::MagnetFile;

#[derive(Default)]
struct Node {
    folders: BTreeMap<String, Node>,
    files: Vec<MagnetFile>,
}

/// Groups flat files into nested folders. Folder ids are `folder_<n>_<path>`,
/// folder sizes are the sum of their descendants, and each level lists folders
/// before files, both alphabetically.
pub fn build_tree(files: Vec<MagnetFile>) -> Vec<MagnetFile> {
    let mut root = Node::default();

    for file in files {
        let path = if file.path.trim().is_empty() {
            file.name.clone()
        } else {
            file.path.clone()
        };
        let mut parts = path
            .split('/')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        let leaf = parts.pop().map(str::to_string).unwrap_or_default();

        let mut node = &mut root;
        for part in parts {
            node = node.folders.entry(part.to_string()).or_default();
        }

        let name = if leaf.is_empty() { file.name.clone() } else { leaf };
        node.files.push(MagnetFile {
            name,
            path,
            is_folder: false,
            children: Vec::new(),
            ..file
        });
    }

    let mut counter = 0usize;
    materialize(root, "", &mut counter)
}

fn materialize(node: Node, prefix: &str, counter: &mut usize) -> Vec<MagnetFile> {
    let mut out = Vec::with_capacity(node.folders.len() + node.files.len());

    for (name, child) in node.folders {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let id = format!("folder_{}_{}", *counter, path);
        *counter += 1;

        let children = materialize(child, &path, counter);
        let size = children.iter().map(|c| c.size).sum();
        out.push(MagnetFile {
            id,
            name,
            path,
            size,
            link: String::new(),
            is_folder: true,
            children,
            index: 0,
        });
    }

    let mut files = node.files;
    files.sort_by(|a, b| a.name.cmp(&b.name));
    out.extend(files);
    out
}

/// Ids of every leaf file in the tree.
pub fn all_file_ids(files: &[MagnetFile]) -> Vec<String> {
    flatten(files).into_iter().map(|f| f.id.clone()).collect()
}

/// Leaf files in display order.
pub fn flatten(files: &[MagnetFile]) -> Vec<&MagnetFile> {
    let mut out = Vec::new();
    collect_leaves(files, &mut out);
    out
}

fn collect_leaves<'a>(files: &'a [MagnetFile], out: &mut Vec<&'a MagnetFile>) {
    for file in files {
        if file.is_folder {
            collect_leaves(&file.children, out);
        } else {
            out.push(file);
        }
    }
}

pub fn find_file<'a>(files: &'a [MagnetFile], id: &str) -> Option<&'a MagnetFile> {
    for file in files {
        if file.id == id {
            return Some(file);
        }
        if file.is_folder {
            if let Some(found) = find_file(&file.children, id) {
                return Some(found);
            }
        }
    }
    None
}

pub fn selected_size(files: &[MagnetFile], selected: &HashSet<String>) -> i64 {
    flatten(files)
        .into_iter()
        .filter(|f| selected.contains(&f.id))
        .map(|f| f.size)
        .sum()
}

/// Toggles `id` in `selected` and cascades the change.
///
/// Selecting adds the node and all descendants, then marks each ancestor whose
/// children are now fully selected. Deselecting removes the node, its
/// descendants and every ancestor.
pub fn set_selected(files: &[MagnetFile], selected: &mut HashSet<String>, id: &str, on: bool) {
    let Some(chain) = ancestor_chain(files, id) else {
        return;
    };
    let Some(target) = chain.last().copied() else {
        return;
    };

    let mut subtree = vec![target.id.clone()];
    collect_descendant_ids(&target.children, &mut subtree);

    if on {
        selected.extend(subtree);
        for ancestor in chain.iter().rev().skip(1) {
            if ancestor.children.iter().all(|c| selected.contains(&c.id)) {
                selected.insert(ancestor.id.clone());
            } else {
                break;
            }
        }
    } else {
        for sid in subtree {
            selected.remove(&sid);
        }
        for ancestor in chain.iter().rev().skip(1) {
            selected.remove(&ancestor.id);
        }
    }
}

fn collect_descendant_ids(files: &[MagnetFile], out: &mut Vec<String>) {
    for file in files {
        out.push(file.id.clone());
        collect_descendant_ids(&file.children, out);
    }
}

/// Path from a root-level node down to `id`, inclusive.
fn ancestor_chain<'a>(files: &'a [MagnetFile], id: &str) -> Option<Vec<&'a MagnetFile>> {
    for file in files {
        if file.id == id {
            return Some(vec![file]);
        }
        if let Some(mut rest) = ancestor_chain(&file.children, id) {
            rest.insert(0, file);
            return Some(rest);
        }
    }
    None
}

/// Lowercased info hash from a magnet link, or empty when absent.
pub fn extract_hash_from_magnet(magnet: &str) -> String {
    let lower = magnet.to_ascii_lowercase();
    let Some(start) = lower.find("btih:") else {
        return String::new();
    };
    let rest = &lower[start + 5..];
    let end = rest.find('&').unwrap_or(rest.len());
    rest[..end].to_string()
}
