//! Timestamped stderr logging for the relay.
//!
//! Provides the [`plog!`] macro:
//!
//! ```text
//! 20260802T14:05:31.204 - src/relay.rs:88 - relay: push k-Qm3aU1b idx 0/2
//! ```
//!
//! On a colour terminal the timestamp and source location are dimmed and
//! record tags (storage keys, session ids) are coloured by content so the
//! same session reads as the same colour across lines. Call [`set_writer`]
//! to capture output in tests; installing a writer disables colour.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static COLOUR: AtomicBool = AtomicBool::new(false);

static WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize logging. Call once at startup.
pub fn init() {
    COLOUR.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Redirect all subsequent [`plog!`] output to `w` and disable colour.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR.store(false, Ordering::Relaxed);
    *WRITER.lock().unwrap() = w;
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

const TAG_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m",
];

fn tag_colour(tag: &str) -> &'static str {
    let h = tag
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(131).wrapping_add(b as u32));
    TAG_COLOURS[(h as usize) % TAG_COLOURS.len()]
}

const TAG_LEN: usize = 8;

fn shorten(id: &str) -> &str {
    // Storage keys are "prefix/hash"; tag by the hash part.
    let tail = id.rsplit('/').next().unwrap_or(id);
    let end = tail
        .char_indices()
        .nth(TAG_LEN)
        .map(|(i, _)| i)
        .unwrap_or(tail.len());
    &tail[..end]
}

/// Format a storage key as a short coloured tag, e.g. `k-Qm3aU1bR`.
pub fn key_tag(key: &str) -> String {
    let short = shorten(key);
    if COLOUR.load(Ordering::Relaxed) {
        format!("{}k-{short}{RESET}", tag_colour(key))
    } else {
        format!("k-{short}")
    }
}

/// Format a handshake session id as a short coloured tag, e.g. `s-9f2c61d4`.
pub fn sid_tag(session_id: &str) -> String {
    let short = shorten(session_id);
    if COLOUR.load(Ordering::Relaxed) {
        format!("{}s-{short}{RESET}", tag_colour(session_id))
    } else {
        format!("s-{short}")
    }
}

/// Current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn timestamp() -> String {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();

    let tod = secs % 86400;
    let (hh, mm, ss) = (tod / 3600, (tod % 3600) / 60, tod % 60);

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let z = (secs / 86400) as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + i64::from(m <= 2);

    format!("{y:04}{m:02}{d:02}T{hh:02}:{mm:02}:{ss:02}.{millis:03}")
}

/// Write one log line. Called by [`plog!`]; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = timestamp();
    let formatted = if COLOUR.load(Ordering::Relaxed) {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// plog!("relay: push {} idx {}/{}", logging::key_tag(&key), idx, total);
/// ```
#[macro_export]
macro_rules! plog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), "YYYYMMDDTHH:MM:SS.mmm".len());
        assert_eq!(&ts[8..9], "T");
    }

    #[test]
    fn key_tag_uses_hash_part() {
        let tag = key_tag("sess/AbCdEfGhIjKlMnOp");
        assert_eq!(tag, "k-AbCdEfGh");
    }

    #[test]
    fn sid_tag_truncates() {
        let tag = sid_tag("9f2c61d4-0000-4000-8000-000000000000");
        assert!(tag.starts_with("s-"));
        assert!(tag.len() <= 2 + TAG_LEN);
    }
}
