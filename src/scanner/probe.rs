//! Video duration probing.
//!
//! Durations come from `ffprobe`. A missing binary or an unreadable file is
//! not an error for indexing: the item is stored without a duration and the
//! thumbnail offset falls back to its default.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, trace};

/// Probes media files for their duration.
pub trait DurationProbe: Send + Sync {
    fn duration(&self, path: &Path) -> Option<Duration>;
}

/// `ffprobe`-backed probe.
#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    binary: PathBuf,
}

impl FfprobeDuration {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl DurationProbe for FfprobeDuration {
    fn duration(&self, path: &Path) -> Option<Duration> {
        trace!(?path, "Probing duration");
        let output = Command::new(&self.binary)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .stdin(Stdio::null())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                debug!(binary = ?self.binary, error = %e, "ffprobe not runnable");
                return None;
            }
        };
        if !output.status.success() {
            debug!(?path, status = ?output.status, "ffprobe failed");
            return None;
        }

        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }
}

/// A probe that never reports a duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl DurationProbe for NoProbe {
    fn duration(&self, _path: &Path) -> Option<Duration> {
        None
    }
}

/// Parses ffprobe's `format=duration` output (seconds as a decimal).
fn parse_duration(text: &str) -> Option<Duration> {
    let secs: f64 = text.lines().next()?.trim().parse().ok()?;
    if secs.is_finite() && secs > 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.500000\n"), Some(Duration::from_millis(12_500)));
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("-1"), None);
    }

    #[test]
    fn test_missing_binary_is_none() {
        let probe = FfprobeDuration::new("/nonexistent/ffprobe-binary");
        assert_eq!(probe.duration(Path::new("/tmp/whatever.mp4")), None);
    }
}
