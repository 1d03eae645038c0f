//! Deterministic WAL replay for crash recovery.
//!
//! On startup the runner reconstructs the committed chain state from the
//! state store, then drives the consensus machine through every WAL record
//! after the last `#HEIGHT` marker. Network side effects are discarded (the
//! log already contains the messages they produced); the signer's
//! idempotency on identical sign-bytes reproduces our own signatures without
//! double-signing.

use crate::wal::{TimedWalMessage, WalMessage};
use stanchion_core::{Action, Event, MessageSource, StateMachine};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Errors from reading or replaying the WAL.
///
/// Any corruption is fatal to startup: the WAL is authoritative and must not
/// be silently truncated.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt wal record at line {line}: {error}")]
    Corrupt { line: usize, error: String },
    #[error("corrupt height marker: {0}")]
    BadMarker(String),
}

/// Find the last `#HEIGHT: <h>` marker by scanning backward from EOF.
///
/// Returns the marker's height and the byte offset of the line following it,
/// or `None` when the file holds no marker.
pub fn seek_last_height_marker(path: &Path) -> Result<Option<(u64, u64)>, ReplayError> {
    const CHUNK: u64 = 4096;

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    // Scan chunks from the end, tracking the earliest chunk we have covered;
    // within the covered suffix, look for the *last* marker line.
    let mut low = len;
    let mut buf: Vec<u8> = Vec::new();
    while low > 0 {
        let start = low.saturating_sub(CHUNK);
        let mut chunk = vec![0u8; (low - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        low = start;

        // Only consider complete lines: unless we've reached the file start,
        // the first line in the buffer may be cut off.
        let first_newline = match buf.iter().position(|&b| b == b'\n') {
            Some(i) => i,
            None if low == 0 => buf.len(),
            None => continue,
        };
        let search_from = if low == 0 { 0 } else { first_newline + 1 };

        let mut offset = low + search_from as u64;
        let mut found: Option<(u64, u64)> = None;
        for line in buf[search_from..].split_inclusive(|&b| b == b'\n') {
            let text = String::from_utf8_lossy(line);
            let trimmed = text.trim_end();
            if let Some(rest) = trimmed.strip_prefix("#HEIGHT: ") {
                let height: u64 = rest
                    .parse()
                    .map_err(|_| ReplayError::BadMarker(trimmed.to_string()))?;
                found = Some((height, offset + line.len() as u64));
            }
            offset += line.len() as u64;
        }
        if let Some(marker) = found {
            return Ok(Some(marker));
        }
    }
    Ok(None)
}

/// Read all records starting at `offset`, skipping marker lines.
pub fn read_records(path: &Path, offset: u64) -> Result<Vec<TimedWalMessage>, ReplayError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with("#HEIGHT: ") {
            continue;
        }
        let record: TimedWalMessage =
            serde_json::from_str(&line).map_err(|e| ReplayError::Corrupt {
                line: line_no,
                error: e.to_string(),
            })?;
        records.push(record);
    }
    Ok(records)
}

/// Drive `machine` through `records`.
///
/// The clock is set from each record's timestamp, so regenerated votes carry
/// the timestamps they were originally signed with. `EnqueueInternal`
/// actions are processed depth-first (the machine's own re-signed messages);
/// every other action is a network or persistence side effect that already
/// happened before the crash, and is dropped.
pub fn replay_records<M: StateMachine>(machine: &mut M, records: &[TimedWalMessage]) -> usize {
    let mut applied = 0usize;
    for record in records {
        machine.set_time(Duration::from_millis(record.time_ms));
        let event = match &record.msg {
            WalMessage::Step(info) => {
                debug!(height = info.height, round = info.round, step = %info.step,
                       "Replay: step checkpoint");
                continue;
            }
            WalMessage::Received { msg, from } => Event::Message {
                msg: msg.clone(),
                from: from.clone(),
            },
            WalMessage::Timeout(ti) => Event::Timeout(*ti),
        };

        let mut queue: VecDeque<Event> = VecDeque::new();
        queue.push_back(event);
        while let Some(event) = queue.pop_front() {
            for action in machine.handle(event) {
                match action {
                    Action::EnqueueInternal { message } => queue.push_back(Event::Message {
                        msg: message,
                        from: MessageSource::Local,
                    }),
                    // Already happened before the crash.
                    Action::Broadcast { .. }
                    | Action::ScheduleTimeout(_)
                    | Action::PublishStep(_)
                    | Action::PersistEvidence { .. } => {}
                }
            }
        }
        applied += 1;
    }
    applied
}

/// Replay the WAL tail for the height in progress.
///
/// Seeks the last `#HEIGHT` marker and feeds every later record through the
/// machine. Returns the number of records applied.
pub fn catchup<M: StateMachine>(machine: &mut M, wal_path: &Path) -> Result<usize, ReplayError> {
    if !wal_path.exists() {
        info!("No WAL to replay");
        return Ok(0);
    }
    let Some((height, offset)) = seek_last_height_marker(wal_path)? else {
        warn!("WAL holds no height marker; nothing to replay");
        return Ok(0);
    };
    let records = read_records(wal_path, offset)?;
    info!(
        height,
        records = records.len(),
        "Catching up from WAL"
    );
    Ok(replay_records(machine, &records))
}
