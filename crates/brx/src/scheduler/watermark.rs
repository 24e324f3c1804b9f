//! 💾 The watermark log: an append-only file of "we got this far" timestamps.
//!
//! One RFC 3339 timestamp per line, newest last. Reading seeks to the end of the file and pulls
//! in a small tail, doubling it until `memrchr` finds the newline in front of the last line, so
//! a log that has been growing since 2020 is never read in full.
//! Nothing is ever rewritten in place. A missing file, an empty file or a garbled last line
//! all mean "no prior watermark".

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::report::SyncState;

/// 📏 First tail read, in bytes. Plenty for one timestamp line.
const TAIL_CHUNK: u64 = 4096;

#[derive(Debug, Clone)]
pub struct WatermarkLog {
    path: PathBuf,
}

impl WatermarkLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 🔍 The last recorded watermark, if there is a readable one.
    pub async fn last(&self) -> Result<Option<DateTime<Utc>>> {
        match self.last_line().await {
            Ok(Some(line)) => match DateTime::parse_from_rfc3339(line.trim()) {
                Ok(timestamp) => Ok(Some(timestamp.with_timezone(&Utc))),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        line = %line,
                        "⚠️ last watermark line does not parse ({err}); treating it as no watermark"
                    );
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("💀 Could not read watermark log '{}'", self.path.display())),
        }
    }

    /// 📜 The last non-blank line of the log, read from the end.
    async fn last_line(&self) -> std::io::Result<Option<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let len = file.metadata().await?.len();
        let mut window = TAIL_CHUNK.min(len);
        loop {
            file.seek(SeekFrom::Start(len - window)).await?;
            let mut tail = vec![0u8; window as usize];
            file.read_exact(&mut tail).await?;
            let end = tail
                .iter()
                .rposition(|byte| !byte.is_ascii_whitespace())
                .map_or(0, |last| last + 1);
            let content = &tail[..end];
            match memchr::memrchr(b'\n', content) {
                Some(newline) => {
                    return Ok(Some(String::from_utf8_lossy(&content[newline + 1..]).into_owned()));
                }
                None if window == len => {
                    return Ok((!content.is_empty())
                        .then(|| String::from_utf8_lossy(content).into_owned()));
                }
                None => window = (window * 2).min(len),
            }
        }
    }

    /// 💾 Read the state a cycle starts from. Read errors are logged and treated as "no watermark".
    pub async fn load_state(&self) -> SyncState {
        match self.last().await {
            Ok(last_synced) => SyncState { last_synced },
            Err(err) => {
                warn!("⚠️ {err:#}; starting from the historical start");
                SyncState::default()
            }
        }
    }

    /// ✍️ Append the watermark of `state`. A state without one writes nothing.
    pub async fn append(&self, state: SyncState) -> Result<()> {
        let Some(at) = state.last_synced else {
            return Ok(());
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("💀 Could not open watermark log '{}'", self.path.display()))?;
        let line = format!("{}\n", at.to_rfc3339_opts(SecondsFormat::Millis, true));
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("💀 Could not append to watermark log '{}'", self.path.display()))?;
        file.flush().await?;
        debug!(path = %self.path.display(), watermark = %line.trim_end(), "💾 watermark appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn the_one_where_there_is_no_file_and_no_drama() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = WatermarkLog::new(dir.path().join("nope.log"));
        assert_eq!(log.last().await?, None);
        assert_eq!(log.load_state().await, SyncState::default());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_last_line_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = WatermarkLog::new(dir.path().join("watermark.log"));
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap();
        log.append(SyncState { last_synced: Some(first) }).await?;
        log.append(SyncState { last_synced: Some(second) }).await?;

        assert_eq!(log.last().await?, Some(second));
        let content = tokio::fs::read_to_string(log.path()).await?;
        assert_eq!(content.lines().count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_garbage_and_emptiness_mean_no_watermark() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let empty = dir.path().join("empty.log");
        tokio::fs::write(&empty, "\n\n").await?;
        assert_eq!(WatermarkLog::new(&empty).last().await?, None);

        let garbled = dir.path().join("garbled.log");
        tokio::fs::write(&garbled, "2024-01-01T00:00:00Z\nyesterday-ish\n").await?;
        assert_eq!(WatermarkLog::new(&garbled).last().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_offsets_are_normalised_to_utc() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("offset.log");
        tokio::fs::write(&path, "2024-01-01T02:00:00+02:00").await?;
        assert_eq!(
            WatermarkLog::new(&path).last().await?,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_long_history_is_read_from_the_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = WatermarkLog::new(dir.path().join("history.log"));
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut history = String::new();
        for hour in 0..1000 {
            let at = start + chrono::Duration::hours(hour);
            history.push_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true));
            history.push('\n');
        }
        tokio::fs::write(log.path(), &history).await?;
        assert!(history.len() as u64 > TAIL_CHUNK * 4);
        assert_eq!(log.last().await?, Some(start + chrono::Duration::hours(999)));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_blank_lines_outgrow_the_first_tail_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("padded.log");
        let padding = "\n".repeat(TAIL_CHUNK as usize * 3);
        tokio::fs::write(&path, format!("2024-01-01T00:00:00Z\n2024-02-01T00:00:00Z{padding}")).await?;
        assert_eq!(
            WatermarkLog::new(&path).last().await?,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );
        Ok(())
    }
}
