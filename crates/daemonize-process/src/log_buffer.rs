use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

use crate::error::LogError;

pub const DEFAULT_MAX_LINES: usize = 1024;

#[derive(Debug)]
struct Lines {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl Lines {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        // One eviction per write, matching one line per write.
        if self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn take_from(&mut self, offset: i64) -> Result<Vec<String>, LogError> {
        if offset < 0 || offset >= self.lines.len() as i64 {
            return Err(LogError::EndOfData);
        }
        Ok(self.lines.split_off(offset as usize).into())
    }
}

/// Capped in-memory line log with a consuming read.
///
/// Clones share the same lines. Writes from stdout and stderr are serialized
/// by the inner lock, so a line is never interleaved with another.
#[derive(Clone, Debug)]
pub struct LogBuffer {
    inner: Arc<Mutex<Lines>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_max_lines(DEFAULT_MAX_LINES)
    }
}

impl LogBuffer {
    pub fn with_max_lines(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            inner: Arc::new(Mutex::new(Lines {
                max_lines,
                lines: VecDeque::with_capacity(max_lines.min(DEFAULT_MAX_LINES)),
            })),
        }
    }

    /// Appends `buf` as one line, minus a single trailing `\n`.
    /// Returns the number of bytes accepted, always `buf.len()`.
    pub async fn write(&self, buf: &[u8]) -> usize {
        let body = buf.strip_suffix(b"\n").unwrap_or(buf);
        let line = String::from_utf8_lossy(body).into_owned();
        self.inner.lock().await.push_line(line);
        buf.len()
    }

    /// Returns every line from `offset` to the end and removes them.
    ///
    /// Fails with [`LogError::EndOfData`] for a negative offset or one at or
    /// past the current line count (any offset on an empty buffer).
    pub async fn read_line(&self, offset: i64) -> Result<Vec<String>, LogError> {
        self.inner.lock().await.take_from(offset)
    }

    pub async fn lines(&self) -> i64 {
        self.inner.lock().await.lines.len() as i64
    }

    pub async fn clear(&self) {
        self.inner.lock().await.lines.clear();
    }

    /// No-op; the buffer holds no OS resources.
    pub async fn close(&self) -> Result<(), LogError> {
        Ok(())
    }

    pub async fn max_lines(&self) -> usize {
        self.inner.lock().await.max_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_consumes_lines() {
        let logger = LogBuffer::default();
        let n = logger.write(b"hello world\n").await;
        assert_eq!(n, "hello world\n".len());
        assert_eq!(logger.lines().await, 1);

        let lines = logger.read_line(0).await.unwrap();
        assert_eq!(lines, vec!["hello world".to_string()]);
        assert_eq!(logger.lines().await, 0);

        assert_eq!(logger.read_line(0).await, Err(LogError::EndOfData));
        assert_eq!(logger.read_line(-1).await, Err(LogError::EndOfData));
        assert!(logger.close().await.is_ok());
    }

    #[tokio::test]
    async fn read_from_offset_keeps_prefix() {
        let logger = LogBuffer::default();
        for l in ["a", "b", "c", "d"] {
            logger.write(l.as_bytes()).await;
        }

        let tail = logger.read_line(2).await.unwrap();
        assert_eq!(tail, vec!["c".to_string(), "d".to_string()]);
        assert_eq!(logger.lines().await, 2);

        // Those lines are gone now.
        assert_eq!(logger.read_line(2).await, Err(LogError::EndOfData));
        assert_eq!(logger.read_line(0).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn negative_offset_is_end_of_data_even_with_content() {
        let logger = LogBuffer::default();
        logger.write(b"x\n").await;
        assert_eq!(logger.read_line(-5).await, Err(LogError::EndOfData));
        assert_eq!(logger.lines().await, 1);
    }

    #[tokio::test]
    async fn strips_only_one_trailing_newline() {
        let logger = LogBuffer::default();
        logger.write(b"two\n\n").await;
        logger.write(b"").await;
        logger.write(b"caf\xc3\xa9\n").await;
        let lines = logger.read_line(0).await.unwrap();
        assert_eq!(lines, vec!["two\n", "", "café"]);
    }

    #[tokio::test]
    async fn cap_evicts_oldest() {
        let logger = LogBuffer::with_max_lines(3);
        for i in 0..10 {
            logger.write(format!("line {i}\n").as_bytes()).await;
            assert!(logger.lines().await <= 3);
        }
        let lines = logger.read_line(0).await.unwrap();
        assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);
    }

    #[tokio::test]
    async fn default_cap_is_1024() {
        let logger = LogBuffer::default();
        assert_eq!(logger.max_lines().await, DEFAULT_MAX_LINES);
        for i in 0..(DEFAULT_MAX_LINES + 10) {
            logger.write(i.to_string().as_bytes()).await;
        }
        assert_eq!(logger.lines().await, DEFAULT_MAX_LINES as i64);
        let lines = logger.read_line(0).await.unwrap();
        assert_eq!(lines.first().map(String::as_str), Some("10"));
    }

    #[tokio::test]
    async fn clones_share_lines() {
        let logger = LogBuffer::default();
        let other = logger.clone();
        other.write(b"shared").await;
        assert_eq!(logger.lines().await, 1);
        logger.clear().await;
        assert_eq!(other.lines().await, 0);
    }
}
