use crate::error::CollectorError;
use crate::events::{ObservedEvent, Timestamp};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::io::BufRead;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// One parsed event line, ready for `Observer::ingest`
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub module: String,
    pub entity_id: String,
    pub event: ObservedEvent,
}

/// Raw shape of an input line
///
/// A line with both `from` and `to` is a transition; a line with neither is
/// a liveness ping.
#[derive(Debug, Deserialize)]
struct EventLine {
    module: String,
    entity_id: EntityId,
    from: Option<String>,
    to: Option<String>,
    #[serde(default)]
    writes: BTreeSet<String>,
    at: Option<Timestamp>,
}

/// Entity ids arrive as strings or bare JSON numbers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntityId {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Text(text) => write!(f, "{}", text),
            EntityId::Number(number) => write!(f, "{}", number),
        }
    }
}

/// Line counts from one pass over an input stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub lines: usize,
    pub events: usize,
    pub skipped: usize,
}

/// Reads JSON-lines events from a stream on a background thread
///
/// Parsed records are sent to a channel; the consumer feeds them to the
/// observer. Malformed lines are logged and skipped, they never stop the
/// reader. The channel disconnects once the reader thread finishes.
pub struct EventReader {
    output_channel: Option<Sender<EventRecord>>,
    thread_handle: Option<JoinHandle<ReadStats>>,
    running: Arc<Mutex<bool>>,
}

impl EventReader {
    pub fn new(channel: Sender<EventRecord>) -> Self {
        Self {
            output_channel: Some(channel),
            thread_handle: None,
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Start reading `input` on a background thread
    ///
    /// The thread ends at end of input, when the receiving side hangs up, or
    /// after [`EventReader::stop`] once the next line arrives. A reader can
    /// only be started once.
    pub fn start<R>(&mut self, input: R)
    where
        R: BufRead + Send + 'static,
    {
        let Some(channel) = self.output_channel.take() else {
            warn!("EventReader already started");
            return;
        };
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = true;

        let running = Arc::clone(&self.running);
        let handle = thread::spawn(move || {
            let stats = match Self::read_events(input, &channel, &running) {
                Ok(stats) => stats,
                Err(e) => {
                    error!("Event input failed: {}", e);
                    ReadStats::default()
                }
            };
            *running.lock().unwrap_or_else(|e| e.into_inner()) = false;
            info!(
                "Event input closed: {} lines, {} events, {} skipped",
                stats.lines, stats.events, stats.skipped
            );
            stats
        });

        self.thread_handle = Some(handle);
        info!("EventReader started");
    }

    /// Ask the reader thread to stop after its current line
    pub fn stop(&self) {
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for the reader thread to finish
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::ParseError` if the reader thread panicked.
    pub fn join(&mut self) -> Result<ReadStats, CollectorError> {
        match self.thread_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CollectorError::ParseError("Reader thread panicked".to_string())),
            None => Ok(ReadStats::default()),
        }
    }

    /// Parse every line of `input` and forward the records
    ///
    /// # Errors
    ///
    /// Returns `CollectorError::IoError` if reading the stream fails.
    pub fn read_events<R: BufRead>(
        input: R,
        channel: &Sender<EventRecord>,
        running: &Mutex<bool>,
    ) -> Result<ReadStats, CollectorError> {
        let mut stats = ReadStats::default();

        for line in input.lines() {
            if !*running.lock().unwrap_or_else(|e| e.into_inner()) {
                debug!("EventReader stopping on request");
                break;
            }
            let line = line?;
            stats.lines += 1;
            if line.trim().is_empty() {
                continue;
            }

            match Self::parse_line(&line) {
                Ok(record) => {
                    if channel.send(record).is_err() {
                        warn!("Event consumer hung up, stopping reader");
                        break;
                    }
                    stats.events += 1;
                }
                Err(e) => {
                    debug!("Skipping line {}: {}", stats.lines, e);
                    stats.skipped += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Parse a single JSON event line
    ///
    /// A missing `at` means "now".
    pub fn parse_line(line: &str) -> Result<EventRecord, CollectorError> {
        let raw: EventLine = serde_json::from_str(line.trim())
            .map_err(|e| CollectorError::ParseError(e.to_string()))?;

        if raw.module.trim().is_empty() {
            return Err(CollectorError::ParseError("empty module name".to_string()));
        }
        let entity_id = raw.entity_id.to_string();
        if entity_id.is_empty() {
            return Err(CollectorError::ParseError("empty entity_id".to_string()));
        }

        let at = raw.at.unwrap_or_else(Utc::now);
        let event = match (raw.from, raw.to) {
            (Some(from), Some(to)) => ObservedEvent::Transition {
                from,
                to,
                writes: raw.writes,
                at,
            },
            (None, None) => ObservedEvent::Interaction { at },
            _ => {
                return Err(CollectorError::ParseError(
                    "transition needs both 'from' and 'to'".to_string(),
                ))
            }
        };

        Ok(EventRecord {
            module: raw.module,
            entity_id,
            event,
        })
    }
}
