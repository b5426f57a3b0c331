use std::collections::VecDeque;

use redwave_process::{InstanceId, LogLine, Severity};

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Renders a line the way the console view shows it: `[HH:MM:SS] ERROR text`.
pub fn render_line(line: &LogLine) -> String {
    let time = chrono::DateTime::from_timestamp_millis(line.at_unix_ms as i64)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    match line.severity {
        Severity::Error => format!("[{time}] ERROR {}", line.text),
        Severity::Info => format!("[{time}] {}", line.text),
    }
}

/// Per-instance history. Oldest lines are evicted once `max_lines` is
/// exceeded (`0` keeps everything); `seq` keeps counting across evictions.
#[derive(Debug)]
pub struct LogBuffer {
    instance_id: InstanceId,
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    pub fn new(instance_id: InstanceId, max_lines: usize) -> Self {
        Self {
            instance_id,
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, severity: Severity, text: impl Into<String>) -> LogLine {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        let line = LogLine {
            instance_id: self.instance_id.clone(),
            seq,
            at_unix_ms: now_unix_ms(),
            severity,
            text: text.into(),
        };
        self.lines.push_back(line.clone());
        while self.max_lines > 0 && self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        line
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<LogLine>, u64) {
        // Convenience for UI polling: if cursor is 0, return the most recent lines.
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let out: Vec<LogLine> = self.lines.iter().skip(start).cloned().collect();
            let last = out.last().map(|l| l.seq).unwrap_or(0);
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for line in self.lines.iter().filter(|l| l.seq > cursor) {
            out.push(line.clone());
            last = line.seq;
            if out.len() >= limit {
                break;
            }
        }
        (out, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(max: usize) -> LogBuffer {
        LogBuffer::new(InstanceId("i-1".to_string()), max)
    }

    #[test]
    fn push_assigns_increasing_seq() {
        let mut b = buffer(0);
        let a = b.push(Severity::Info, "one");
        let c = b.push(Severity::Error, "two");
        assert_eq!(a.seq, 1);
        assert_eq!(c.seq, 2);
        assert!(c.is_error());
        assert_eq!(c.instance_id.as_str(), "i-1");
    }

    #[test]
    fn ring_evicts_oldest_and_keeps_order() {
        let mut b = buffer(3);
        for i in 0..5 {
            b.push(Severity::Info, format!("line {i}"));
        }
        let texts: Vec<_> = b.snapshot().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
        // Sequence numbers survive eviction.
        assert_eq!(b.push(Severity::Info, "next").seq, 6);
    }

    #[test]
    fn unbounded_when_max_is_zero() {
        let mut b = buffer(0);
        for i in 0..2000 {
            b.push(Severity::Info, i.to_string());
        }
        assert_eq!(b.snapshot().len(), 2000);
    }

    #[test]
    fn tail_after_zero_returns_most_recent() {
        let mut b = buffer(0);
        for i in 1..=10 {
            b.push(Severity::Info, i.to_string());
        }
        let (lines, next) = b.tail_after(0, 3);
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["8", "9", "10"]);
        assert_eq!(next, 10);
    }

    #[test]
    fn tail_after_cursor_pages_forward() {
        let mut b = buffer(0);
        for i in 1..=10 {
            b.push(Severity::Info, i.to_string());
        }
        let (lines, next) = b.tail_after(4, 2);
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["5", "6"]);
        assert_eq!(next, 6);

        let (lines, next) = b.tail_after(10, 5);
        assert!(lines.is_empty());
        assert_eq!(next, 10);
    }

    #[test]
    fn render_marks_errors() {
        let mut b = buffer(0);
        let info = b.push(Severity::Info, "ready");
        let err = b.push(Severity::Error, "boom");
        assert!(render_line(&info).ends_with("] ready"));
        assert!(render_line(&err).ends_with("] ERROR boom"));
        assert!(render_line(&err).starts_with('['));
    }
}
