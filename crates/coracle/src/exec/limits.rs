//! Resource limits for guest execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits applied to one guest execution.
///
/// The timeout is carried as plain milliseconds so the struct round-trips
/// through the sandbox protocol without any adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Maximum engine heap in bytes.
    pub max_memory_bytes: usize,
    /// Maximum captured output (stdout + stderr) in bytes.
    pub max_output_bytes: usize,
    /// Wall-clock budget for the script in milliseconds, enforced via the
    /// engine interrupt handler.
    pub timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 32 << 20,
            max_output_bytes: 512 * 1024,
            timeout_ms: 1500,
        }
    }
}

impl ResourceLimits {
    /// The script timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Buffer that limits how much data can be written.
#[derive(Debug, Clone)]
pub struct LimitedBuffer {
    buffer: String,
    limit: usize,
    truncated: bool,
}

impl LimitedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn write(&mut self, data: &str) {
        let remaining = self.limit.saturating_sub(self.buffer.len());
        if remaining == 0 {
            self.truncated = true;
            return;
        }
        if data.len() <= remaining {
            self.buffer.push_str(data);
            return;
        }
        let mut cut = remaining;
        while cut > 0 && !data.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buffer.push_str(&data[..cut]);
        self.buffer.push_str("\n... [output truncated] ...\n");
        self.truncated = true;
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_memory_bytes, 32 << 20);
        assert_eq!(limits.max_output_bytes, 512 * 1024);
        assert_eq!(limits.timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_limits_round_trip_as_millis() {
        let limits = ResourceLimits {
            max_memory_bytes: 1024,
            max_output_bytes: 512,
            timeout_ms: 5000,
        };
        let json = serde_json::to_string(&limits).unwrap();
        assert!(json.contains("\"timeoutMs\":5000"), "{json}");
        let back: ResourceLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_limited_buffer_truncates() {
        let mut buffer = LimitedBuffer::new(5);
        buffer.write("hello world");
        assert!(buffer.was_truncated());
        let content = buffer.into_string();
        assert!(content.starts_with("hello"));
        assert!(content.contains("truncated"));
    }

    #[test]
    fn test_limited_buffer_under_limit() {
        let mut buffer = LimitedBuffer::new(100);
        buffer.write("hello");
        buffer.write(" world");
        assert!(!buffer.was_truncated());
        assert_eq!(buffer.into_string(), "hello world");
    }

    #[test]
    fn test_limited_buffer_multibyte_boundary() {
        let mut buffer = LimitedBuffer::new(4);
        buffer.write("aé€");
        assert!(buffer.was_truncated());
        let content = buffer.into_string();
        assert!(content.is_char_boundary(content.len()));
    }
}
