//! Exact-path block filter for rewritten requests.

use http::Uri;

use crate::config::PolicyConfig;

/// Returns whether the rewritten URL's path is on the block list.
///
/// Only exact path equality counts (ASCII case-insensitive); prefixes and
/// substrings of a blocked path are forwarded.
pub fn should_block(rewritten: &Uri, config: &PolicyConfig) -> bool {
    let path = rewritten.path();
    let blocked = config
        .block_paths()
        .iter()
        .any(|blocked| blocked.eq_ignore_ascii_case(path));

    if blocked {
        tracing::info!("Blocking request to path: {}", path);
    }
    blocked
}
