use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Mutex;

const MAX_LOG_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Info,
    Upload,
    Chat,
    Sources,
    Error,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub text: String,
    pub kind: Kind,
}

static ACTIVITY_LOG: Lazy<Mutex<VecDeque<Entry>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(MAX_LOG_LINES)));

pub fn log_with<T: Into<String>>(kind: Kind, line: T) {
    let text = line.into();
    match kind {
        Kind::Error => tracing::warn!(target: "activity", "{}", text),
        _ => tracing::info!(target: "activity", "{}", text),
    }
    if let Ok(mut buf) = ACTIVITY_LOG.lock() {
        if buf.len() >= MAX_LOG_LINES {
            buf.pop_front();
        }
        buf.push_back(Entry { text, kind });
    }
}

pub fn recent(n: usize) -> Vec<Entry> {
    if let Ok(buf) = ACTIVITY_LOG.lock() {
        let len = buf.len();
        let take = n.min(len);
        buf.iter().skip(len - take).cloned().collect()
    } else {
        Vec::new()
    }
}

/// The newest entry, shown as the status line.
pub fn latest() -> Option<Entry> {
    recent(1).pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_and_ordered() {
        for i in 0..(MAX_LOG_LINES + 5) {
            log_with(Kind::Upload, format!("bounded-{}", i));
        }
        let entries = recent(MAX_LOG_LINES + 10);
        assert!(entries.len() <= MAX_LOG_LINES);

        let ours: Vec<&Entry> = entries.iter().filter(|e| e.text.starts_with("bounded-")).collect();
        let last = ours.last().unwrap();
        assert_eq!(last.text, format!("bounded-{}", MAX_LOG_LINES + 4));
        assert_eq!(last.kind, Kind::Upload);
    }
}
