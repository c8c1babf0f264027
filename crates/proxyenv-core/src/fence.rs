//! Fenced configuration block editing.
//!
//! A managed block is a run of lines opened by [`BLOCK_BEGIN`] and closed by
//! [`BLOCK_END`]. All editing works on whole lines; lines outside a block are
//! carried through byte-for-byte, including their line endings.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{EnvironmentProxyState, ProxyVar};

/// Opening sentinel line.
pub const BLOCK_BEGIN: &str = "# BEGIN: ProxyEnvSync Configuration";

/// Closing sentinel line.
pub const BLOCK_END: &str = "# END: ProxyEnvSync Configuration";

static EXPORT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*export\s+([A-Za-z_][A-Za-z0-9_]*)="([^"]*)"\s*$"#).expect("Invalid regex pattern")
});

fn content_of(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

fn is_begin(line: &str) -> bool {
    content_of(line).trim() == BLOCK_BEGIN
}

fn is_end(line: &str) -> bool {
    content_of(line).trim() == BLOCK_END
}

/// Returns true for an `export VAR="..."` line naming a tracked variable.
fn is_managed_export(line: &str) -> bool {
    EXPORT_LINE
        .captures(content_of(line))
        .is_some_and(|caps| ProxyVar::from_name(&caps[1]).is_some())
}

/// Removes every managed block from `content`.
///
/// - complete begin/end pairs are removed together with everything between
/// - a begin line with no matching end is removed along with the managed
///   `export` lines directly after it, leaving unrelated lines alone
/// - a stray end line is removed
pub fn strip_blocks(content: &str) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let mut kept = String::with_capacity(content.len());
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if is_begin(line) {
            let close = lines[i + 1..]
                .iter()
                .position(|l| is_end(l) || is_begin(l))
                .map(|offset| i + 1 + offset)
                .filter(|&j| is_end(lines[j]));

            match close {
                Some(end) => i = end + 1,
                None => {
                    i += 1;
                    while i < lines.len() && is_managed_export(lines[i]) {
                        i += 1;
                    }
                }
            }
            continue;
        }

        if !is_end(line) {
            kept.push_str(line);
        }
        i += 1;
    }

    kept
}

/// Renders the managed block exporting `vars` with `proxy_url`.
///
/// The result ends with a single newline.
pub fn render_block(proxy_url: &str, vars: &[ProxyVar]) -> String {
    let mut block = String::new();
    block.push_str(BLOCK_BEGIN);
    block.push('\n');
    for var in vars {
        block.push_str(&format!("export {}=\"{}\"\n", var.as_str(), proxy_url));
    }
    block.push_str(BLOCK_END);
    block.push('\n');
    block
}

/// Replaces any managed block in `content`.
///
/// With `Some(url)` a fresh block is appended after the remaining content;
/// with `None` the block is only removed.
pub fn replace_block(content: &str, proxy_url: Option<&str>, vars: &[ProxyVar]) -> String {
    let mut out = strip_blocks(content);

    if let Some(url) = proxy_url {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&render_block(url, vars));
    }

    out
}

/// Reads the tracked variables from the first complete managed block.
pub fn parse_block(content: &str, vars: &[ProxyVar]) -> EnvironmentProxyState {
    let mut state = EnvironmentProxyState::unset(vars);
    let mut inside = false;

    for line in content.lines() {
        if is_begin(line) {
            inside = true;
            continue;
        }
        if is_end(line) {
            if inside {
                break;
            }
            continue;
        }
        if !inside {
            continue;
        }
        if let Some(caps) = EXPORT_LINE.captures(line) {
            if let Some(var) = ProxyVar::from_name(&caps[1]).filter(|v| vars.contains(v)) {
                state.set(var, &caps[2]);
            }
        }
    }

    if !inside {
        return EnvironmentProxyState::unset(vars);
    }

    state
}
