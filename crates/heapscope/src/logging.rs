//! Walk and Query Event Log
//!
//! Structured record of what a session did, useful for:
//! - Explaining partial results (abandoned segments, unreadable objects)
//! - Timing queries
//! - Cache tuning
//!
//! Log Levels:
//! - ERROR: Topology could not be established
//! - WARN: Corruption, unreadable objects, interrupted queries
//! - INFO: Topology built, queries finished
//! - DEBUG: Query start, cache statistics
//! - TRACE: Per-segment progress
//!
//! Every recorded event is also rendered through the `log` facade, either as
//! a human-readable line or as one JSON object.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Log level for session events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Session event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WalkEvent {
    /// Topology established
    TopologyBuilt {
        heaps: usize,
        segments: usize,
        bytes: u64,
    },

    /// Remainder of a segment skipped after corruption
    SegmentAbandoned {
        segment: u64,
        address: u64,
        reason: String,
    },

    /// An object or slot could not be read during a query
    ObjectUnreadable { address: u64, reason: String },

    /// Object walk completed
    WalkFinished {
        objects: u64,
        bytes: u64,
        segments: u64,
        segments_abandoned: u64,
    },

    /// Graph query started
    QueryStarted { query: String, target: u64 },

    /// Graph query completed
    QueryFinished {
        query: String,
        results: usize,
        duration_ms: f64,
    },

    /// Graph query aborted by cancellation
    QueryInterrupted { query: String },

    /// Cache statistics snapshot
    CacheStats {
        cache: String,
        hits: u64,
        misses: u64,
        bypasses: u64,
    },
}

impl WalkEvent {
    /// Level at which this event is recorded
    pub fn level(&self) -> LogLevel {
        match self {
            WalkEvent::SegmentAbandoned { .. }
            | WalkEvent::ObjectUnreadable { .. }
            | WalkEvent::QueryInterrupted { .. } => LogLevel::Warn,
            WalkEvent::TopologyBuilt { .. }
            | WalkEvent::QueryFinished { .. }
            | WalkEvent::WalkFinished { .. } => LogLevel::Info,
            WalkEvent::QueryStarted { .. } | WalkEvent::CacheStats { .. } => LogLevel::Debug,
        }
    }
}

/// Event log configuration
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Minimum level that is recorded
    pub level: LogLevel,

    /// Forward recorded events to the `log` facade
    pub echo: bool,

    /// Render forwarded events as JSON
    pub json: bool,

    /// Prefix forwarded events with a wall-clock timestamp
    pub timestamps: bool,

    /// Events kept in memory; the oldest are dropped past this
    pub capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            echo: true,
            json: false,
            timestamps: false,
            capacity: 10_000,
        }
    }
}

/// Per-session event log
pub struct EventLog {
    config: EventLogConfig,
    events: Mutex<VecDeque<(Instant, WalkEvent)>>,
    dropped: AtomicU64,
    enabled: AtomicBool,
}

impl EventLog {
    pub fn new(config: EventLogConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record an event
    pub fn record(&self, event: WalkEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = event.level();
        if level > self.config.level {
            return;
        }

        if self.config.echo {
            log::log!(level.into(), "{}", self.render(&event));
        }

        let mut events = self.events.lock();
        if self.config.capacity == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        while events.len() >= self.config.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back((Instant::now(), event));
    }

    /// Events discarded to stay within capacity
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> Vec<WalkEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Render an event the way it is forwarded to `log`
    pub fn render(&self, event: &WalkEvent) -> String {
        let body = if self.config.json {
            serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event))
        } else {
            render_human(event)
        };

        if self.config.timestamps {
            let now = chrono::Local::now();
            format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), body)
        } else {
            body
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EventLogConfig::default())
    }
}

fn render_human(event: &WalkEvent) -> String {
    match event {
        WalkEvent::TopologyBuilt {
            heaps,
            segments,
            bytes,
        } => format!(
            "[heap] topology built: {} heap(s), {} segment(s), {} bytes",
            heaps, segments, bytes
        ),
        WalkEvent::SegmentAbandoned {
            segment,
            address,
            reason,
        } => format!(
            "[heap] segment {:#x} abandoned at {:#x}: {}",
            segment, address, reason
        ),
        WalkEvent::ObjectUnreadable { address, reason } => {
            format!("[roots] object {:#x} unreadable: {}", address, reason)
        },
        WalkEvent::WalkFinished {
            objects,
            bytes,
            segments,
            segments_abandoned,
        } => format!(
            "[heap] walk finished: {} objects, {} bytes, {} segment(s), {} abandoned",
            objects, bytes, segments, segments_abandoned
        ),
        WalkEvent::QueryStarted { query, target } => {
            format!("[roots] {} started for {:#x}", query, target)
        },
        WalkEvent::QueryFinished {
            query,
            results,
            duration_ms,
        } => format!(
            "[roots] {} finished: {} result(s) in {:.3}ms",
            query, results, duration_ms
        ),
        WalkEvent::QueryInterrupted { query } => format!("[roots] {} interrupted", query),
        WalkEvent::CacheStats {
            cache,
            hits,
            misses,
            bypasses,
        } => format!(
            "[cache] {}: {} hits, {} misses, {} bypasses",
            cache, hits, misses, bypasses
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filtering() {
        let log = EventLog::new(EventLogConfig {
            level: LogLevel::Info,
            echo: false,
            ..Default::default()
        });

        log.record(WalkEvent::QueryStarted {
            query: "find_roots".into(),
            target: 0x1000,
        });
        assert!(log.is_empty(), "debug event recorded at info level");

        log.record(WalkEvent::QueryInterrupted {
            query: "find_roots".into(),
        });
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_disabled_log_records_nothing() {
        let log = EventLog::default();
        log.disable();
        log.record(WalkEvent::TopologyBuilt {
            heaps: 1,
            segments: 1,
            bytes: 64,
        });
        assert!(log.is_empty());
        log.enable();
        assert!(log.is_enabled());
    }

    /// **Bug this finds:** a long-lived session growing its log without bound
    #[test]
    fn test_capacity_drops_oldest() {
        let log = EventLog::new(EventLogConfig {
            level: LogLevel::Warn,
            echo: false,
            capacity: 3,
            ..Default::default()
        });

        for address in 0..5u64 {
            log.record(WalkEvent::ObjectUnreadable {
                address,
                reason: "unmapped".into(),
            });
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.dropped(), 2);
        let kept: Vec<u64> = log
            .events()
            .iter()
            .filter_map(|e| match e {
                WalkEvent::ObjectUnreadable { address, .. } => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.dropped(), 0);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let log = EventLog::new(EventLogConfig {
            echo: false,
            capacity: 0,
            ..Default::default()
        });
        log.record(WalkEvent::QueryInterrupted {
            query: "find_roots".into(),
        });
        assert!(log.is_empty());
        assert_eq!(log.dropped(), 1);
    }

    #[test]
    fn test_json_rendering() {
        let log = EventLog::new(EventLogConfig {
            json: true,
            echo: false,
            ..Default::default()
        });
        let line = log.render(&WalkEvent::ObjectUnreadable {
            address: 16,
            reason: "unmapped".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "object_unreadable");
        assert_eq!(value["address"], 16);
    }

    #[test]
    fn test_human_rendering_with_timestamp() {
        let log = EventLog::new(EventLogConfig {
            timestamps: true,
            echo: false,
            ..Default::default()
        });
        let line = log.render(&WalkEvent::QueryInterrupted {
            query: "retained_size".into(),
        });
        assert!(line.starts_with('['));
        assert!(line.ends_with("[roots] retained_size interrupted"));
    }
}
