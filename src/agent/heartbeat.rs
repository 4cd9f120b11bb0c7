//! Liveness file touched by the agent on every successful poll.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Record the current time in the heartbeat file.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, Utc::now().to_rfc3339())?;
    Ok(())
}

/// Time of the last heartbeat, `None` if the agent never wrote one.
pub fn last_beat(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let beat = DateTime::parse_from_rfc3339(content.trim())
        .map_err(|e| Error::Config(format!("corrupt heartbeat file {}: {}", path.display(), e)))?;
    Ok(Some(beat.with_timezone(&Utc)))
}

/// Whether the last heartbeat is younger than `freshness`.
pub fn pong(path: &Path, freshness: Duration) -> Result<bool> {
    let Some(beat) = last_beat(path)? else {
        return Ok(false);
    };
    let age = Utc::now().signed_duration_since(beat);
    Ok(age.to_std().map(|age| age <= freshness).unwrap_or(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_then_pong() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent").join("heartbeat");
        assert!(!pong(&path, Duration::from_secs(60)).unwrap());

        touch(&path).unwrap();
        assert!(pong(&path, Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_stale_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat");
        let old = Utc::now() - chrono::Duration::seconds(600);
        std::fs::write(&path, old.to_rfc3339()).unwrap();
        assert!(!pong(&path, Duration::from_secs(30)).unwrap());
    }

    #[test]
    fn test_corrupt_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat");
        std::fs::write(&path, "yesterday").unwrap();
        assert_eq!(pong(&path, Duration::from_secs(30)).unwrap_err().code(), "CONFIG_ERROR");
    }
}
