//! Deterministic branch and worktree naming.
//!
//! Names are derived from the worker name and a task slug so no two active
//! sessions collide: `agent/{name}/{taskId}-{slug}` and
//! `.stoneforge/.worktrees/{name}-{slug}`. Slugs are lowercased, restricted
//! to `[a-z0-9-]`, and capped at 30 characters.

use stoneforge_core::model::ElementId;

/// Maximum slug length, in bytes (the slug is ASCII after sanitization).
pub const MAX_SLUG_LEN: usize = 30;

/// Lowercase and replace anything outside `[a-z0-9-]` with `-`, capping the
/// result at [`MAX_SLUG_LEN`].
#[must_use]
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len().min(MAX_SLUG_LEN));
    for c in input.chars() {
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
        let lower = c.to_ascii_lowercase();
        if lower.is_ascii_lowercase() || lower.is_ascii_digit() || lower == '-' {
            slug.push(lower);
        } else {
            slug.push('-');
        }
    }
    slug
}

/// `agent/{name}/{taskId}-{slug30}`.
#[must_use]
pub fn generate_branch_name(worker_name: &str, task_id: &ElementId, title: &str) -> String {
    format!(
        "agent/{}/{task_id}-{}",
        slugify(worker_name),
        slugify(title)
    )
}

/// `.stoneforge/.worktrees/{name}-{slug30}`.
#[must_use]
pub fn generate_worktree_path(worker_name: &str, title: &str) -> String {
    format!(
        ".stoneforge/.worktrees/{}-{}",
        slugify(worker_name),
        slugify(title)
    )
}
