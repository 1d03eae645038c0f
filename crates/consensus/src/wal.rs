//! Write-ahead log.
//!
//! One JSON record per line. Before acting on any event, the runner appends
//! it here and fsyncs; replaying the log therefore reproduces every state
//! transition up to the last durable record. A `#HEIGHT: <h>` marker line
//! precedes the NewHeight step record of each height so recovery can seek to
//! the start of the in-progress height.

use serde::{Deserialize, Serialize};
use stanchion_core::{ConsensusMessage, MessageSource, RoundStep, RoundStepInfo, TimeoutInfo};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One logged consensus input or checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalMessage {
    /// A completed step (replay checkpoint).
    Step(RoundStepInfo),
    /// A consumed message, peer or local.
    Received {
        msg: ConsensusMessage,
        from: MessageSource,
    },
    /// A fired timeout.
    Timeout(TimeoutInfo),
}

/// A WAL record with the wall time it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedWalMessage {
    /// Milliseconds since epoch.
    pub time_ms: u64,
    pub msg: WalMessage,
}

/// Append-only write-ahead logger.
///
/// In light mode, peer-sourced block parts are skipped: they dominate the
/// log's size, and replay only needs our own records to retrace the same
/// transitions (peers re-send the parts).
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    light: bool,
    max_file_size: u64,
    written: u64,
    rotations: u32,
}

impl Wal {
    /// Open (or create) the WAL head file `wal` inside `dir`.
    pub fn open(dir: impl AsRef<Path>, light: bool, max_file_size: u64) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("wal");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        let rotations = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("wal.")
                    .is_some_and(|s| s.parse::<u32>().is_ok())
            })
            .count() as u32;
        info!(path = %path.display(), light, existing_bytes = written, "Opened WAL");
        Ok(Wal {
            path,
            writer: BufWriter::new(file),
            light,
            max_file_size,
            written,
            rotations,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record (and the height marker, when it is a NewHeight
    /// step), then fsync.
    ///
    /// # Panics
    ///
    /// Panics on any write or sync failure. The WAL is what makes crash
    /// recovery sound; making progress past an unlogged event would lose
    /// that guarantee.
    pub fn save(&mut self, record: &TimedWalMessage) {
        if self.light {
            // Light mode: skip peer block parts.
            if let WalMessage::Received {
                msg: ConsensusMessage::BlockPart { .. },
                from: MessageSource::Peer(_),
            } = &record.msg
            {
                return;
            }
        }

        if let WalMessage::Step(info) = &record.msg {
            if info.step == RoundStep::NewHeight {
                self.write_line(&format!("#HEIGHT: {}", info.height));
            }
        }

        let json = serde_json::to_string(record)
            .expect("wal record encoding must succeed - this is a bug if it fails");
        self.write_line(&json);

        self.writer
            .flush()
            .expect("SAFETY CRITICAL: wal flush failed - cannot continue");
        self.writer
            .get_ref()
            .sync_data()
            .expect("SAFETY CRITICAL: wal fsync failed - cannot continue");

        if self.written > self.max_file_size {
            self.rotate();
        }
    }

    fn write_line(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .expect("SAFETY CRITICAL: wal write failed - cannot continue");
        self.written += line.len() as u64 + 1;
    }

    /// Roll the head file over to `wal.<n>` and start a fresh head.
    fn rotate(&mut self) {
        self.writer
            .flush()
            .expect("SAFETY CRITICAL: wal flush failed during rotation");
        let rotated = self
            .path
            .with_file_name(format!("wal.{}", self.rotations));
        fs::rename(&self.path, &rotated)
            .expect("SAFETY CRITICAL: wal rotation rename failed");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .expect("SAFETY CRITICAL: wal reopen after rotation failed");
        debug!(rotated = %rotated.display(), "Rotated WAL");
        self.rotations += 1;
        self.writer = BufWriter::new(file);
        self.written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stanchion_core::PeerId;
    use stanchion_types::{Part, MerkleProof, Hash};
    use tempfile::TempDir;

    fn step_record(height: u64, step: RoundStep) -> TimedWalMessage {
        TimedWalMessage {
            time_ms: 1000,
            msg: WalMessage::Step(RoundStepInfo {
                height,
                round: 0,
                step,
            }),
        }
    }

    fn part_record(from: MessageSource) -> TimedWalMessage {
        TimedWalMessage {
            time_ms: 1000,
            msg: WalMessage::Received {
                msg: ConsensusMessage::BlockPart {
                    height: 1,
                    round: 0,
                    part: Part {
                        index: 0,
                        bytes: vec![0u8; 64],
                        proof: MerkleProof {
                            index: 0,
                            total: 1,
                            siblings: vec![Hash::ZERO],
                        },
                    },
                },
                from,
            },
        }
    }

    #[test]
    fn writes_height_marker_before_new_height_step() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), false, u64::MAX).unwrap();
        wal.save(&step_record(5, RoundStep::NewHeight));
        wal.save(&step_record(5, RoundStep::Propose));

        let contents = fs::read_to_string(dir.path().join("wal")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "#HEIGHT: 5");
        assert!(lines[1].contains("NewHeight"));
        assert!(lines[2].contains("Propose"));
    }

    #[test]
    fn records_roundtrip_through_json() {
        let record = step_record(2, RoundStep::Prevote);
        let json = serde_json::to_string(&record).unwrap();
        let back: TimedWalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn light_mode_skips_peer_block_parts() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), true, u64::MAX).unwrap();
        wal.save(&part_record(MessageSource::Peer(PeerId("p1".into()))));
        wal.save(&part_record(MessageSource::Local));

        let contents = fs::read_to_string(dir.path().join("wal")).unwrap();
        // Only the local part was logged.
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn rotates_when_over_size() {
        let dir = TempDir::new().unwrap();
        let mut wal = Wal::open(dir.path(), false, 64).unwrap();
        for _ in 0..4 {
            wal.save(&step_record(1, RoundStep::Propose));
        }
        assert!(dir.path().join("wal.0").exists());
        assert!(dir.path().join("wal").exists());
    }
}
