//! Unified diff application for `UpdateFiles`'s `patch` field.
//!
//! `diffy` parses and applies a single-file unified diff; a `patch`
//! payload here is the concatenation of one or more such diffs (the
//! ordinary multi-file unified diff shape `git diff` / `diff -u` produce),
//! so this module splits on each `--- ` file header before handing the
//! per-file chunk to `diffy`.

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Split a concatenated unified diff into per-file chunks, each starting
/// at its `--- ` header line.
fn split_file_patches(patch: &str) -> Vec<&str> {
    let mut starts = Vec::new();
    for (i, _) in patch.match_indices("--- ") {
        if i == 0 || patch[..i].ends_with('\n') {
            starts.push(i);
        }
    }
    starts
        .iter()
        .enumerate()
        .map(|(idx, &start)| {
            let end = starts.get(idx + 1).copied().unwrap_or(patch.len());
            &patch[start..end]
        })
        .collect()
}

/// Extract the target path from a single-file patch's `+++ ` header,
/// stripping the conventional `a/`/`b/` prefix git-style diffs use.
fn target_path(file_patch: &str) -> Result<&str> {
    let line = file_patch
        .lines()
        .find(|l| l.starts_with("+++ "))
        .context("patch chunk has no +++ header")?;
    let path = line
        .trim_start_matches("+++ ")
        .split('\t')
        .next()
        .unwrap_or("")
        .trim();
    let path = path.strip_prefix("b/").unwrap_or(path);
    if path.is_empty() || path == "/dev/null" {
        bail!("patch chunk has no usable target path");
    }
    Ok(path)
}

/// Apply every file patch in `patch_text` against files rooted at
/// `base_path`, atomically in the sense that parsing all chunks happens
/// before any file is written — a malformed later chunk won't leave an
/// earlier file half-patched.
pub async fn apply(base_path: &Path, patch_text: &str) -> Result<()> {
    let chunks = split_file_patches(patch_text);
    if chunks.is_empty() {
        bail!("patch contained no recognizable file headers");
    }

    let mut planned = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let rel_path = target_path(chunk)?;
        let full_path = base_path.join(rel_path);
        let original = tokio::fs::read_to_string(&full_path)
            .await
            .unwrap_or_default();
        let parsed = diffy::Patch::from_str(chunk)
            .with_context(|| format!("parsing patch for {rel_path}"))?;
        let patched = diffy::apply(&original, &parsed)
            .with_context(|| format!("applying patch to {rel_path}"))?;
        planned.push((full_path, patched));
    }

    for (path, content) in planned {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
    }

    Ok(())
}
