/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The append-only event log: one file per thread, fixed-shape records.
//!
//! The scheduler's exclusive-turn discipline already totally orders turn
//! numbers across threads, so each thread can buffer and write its own file
//! without any cross-thread coordination; merging by turn number reproduces
//! the global order.  Records are bincode-encoded with the default fixed-int
//! encoding, so every `Sync` record has the same width on disk.
//!
//! A record carries at most [`MAX_INLINE_ARGS`] arguments inline; wider
//! operations spill into chained [`ExtraArgsRec`]s of up to
//! [`MAX_EXTRA_ARGS`] each, bounded overall by [`MAX_LOG_ARGS`].

use std::fs;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::path::Path;
use std::path::PathBuf;

use detturn_model::DetTid;
use detturn_model::Ins;
use detturn_model::SyncOp;
use detturn_model::Turn;
use serde::Deserialize;
use serde::Serialize;

/// Arguments carried inline in a `Sync` record.
pub const MAX_INLINE_ARGS: usize = 2;

/// Arguments carried by each chained extra-args record.
pub const MAX_EXTRA_ARGS: usize = 3;

/// The most arguments any operation may log.
pub const MAX_LOG_ARGS: usize = MAX_INLINE_ARGS + 3 * MAX_EXTRA_ARGS;

/// One record on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A serialized operation (or the first/second half of one).
    Sync(SyncRec),
    /// Continuation of the preceding `Sync` record's arguments.
    ExtraArgs(ExtraArgsRec),
}

/// The fixed-width body of a sync event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRec {
    /// Call-site id.
    pub ins: Ins,
    /// Operation code.
    pub op: SyncOp,
    /// Turn number at which this record was produced.
    pub turn: u64,
    /// False for the first half of a two-half operation, true otherwise.
    pub second_half: bool,
    /// Did the operation's wait end in a timeout?
    pub timedout: bool,
    /// Total argument count, across this record and its chained extras.
    pub narg: u8,
    /// The first arguments, zero-padded.
    pub args: [u64; MAX_INLINE_ARGS],
    /// Time spent in application code since the previous record.
    pub app_ns: u64,
    /// Time spent in the operation itself.
    pub syscall_ns: u64,
    /// Time spent waiting for the turn.
    pub sched_ns: u64,
}

/// Spill record for operations with more than [`MAX_INLINE_ARGS`] arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraArgsRec {
    /// Position of this record in its chain, starting at 1.
    pub seq: u8,
    /// Up to [`MAX_EXTRA_ARGS`] further arguments, zero-padded.
    pub args: [u64; MAX_EXTRA_ARGS],
}

/// A fully reassembled event, as surfaced by [`read_log`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    /// Call-site id.
    pub ins: Ins,
    /// Operation code.
    pub op: SyncOp,
    /// Turn number.
    pub turn: u64,
    /// Second-half flag.
    pub second_half: bool,
    /// Timeout flag.
    pub timedout: bool,
    /// All arguments, chained extras included.
    pub args: Vec<u64>,
    /// Timing triple in nanoseconds: (app, syscall, sched).
    pub timing_ns: (u64, u64, u64),
}

/// Create the log directory for this process.
pub(crate) fn prog_begin(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// The file receiving one thread's records.
pub fn log_file_path(dir: &Path, tid: DetTid) -> PathBuf {
    dir.join(format!("tid-{}-{}.log", std::process::id(), tid))
}

/// A buffered, append-only writer for one thread's log.
#[derive(Debug)]
pub struct ThreadLogger {
    w: BufWriter<File>,
}

impl ThreadLogger {
    /// Open (truncating) this thread's log file under `dir`.
    pub fn open(dir: &Path, tid: DetTid) -> io::Result<Self> {
        let f = File::create(log_file_path(dir, tid))?;
        Ok(ThreadLogger {
            w: BufWriter::new(f),
        })
    }

    /// Append one event, spilling wide argument lists into chained records.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        ins: Ins,
        op: SyncOp,
        turn: Turn,
        second_half: bool,
        timedout: bool,
        args: &[u64],
        timing_ns: (u64, u64, u64),
    ) -> io::Result<()> {
        assert!(
            args.len() <= MAX_LOG_ARGS,
            "operation {} logs {} args, more than the record format's {}",
            op,
            args.len(),
            MAX_LOG_ARGS
        );
        let mut inline = [0u64; MAX_INLINE_ARGS];
        for (slot, a) in inline.iter_mut().zip(args.iter()) {
            *slot = *a;
        }
        let rec = LogRecord::Sync(SyncRec {
            ins,
            op,
            turn: turn.as_u64(),
            second_half,
            timedout,
            narg: args.len() as u8,
            args: inline,
            app_ns: timing_ns.0,
            syscall_ns: timing_ns.1,
            sched_ns: timing_ns.2,
        });
        self.write(&rec)?;

        for (i, chunk) in args[args.len().min(MAX_INLINE_ARGS)..]
            .chunks(MAX_EXTRA_ARGS)
            .enumerate()
        {
            let mut extra = [0u64; MAX_EXTRA_ARGS];
            for (slot, a) in extra.iter_mut().zip(chunk.iter()) {
                *slot = *a;
            }
            self.write(&LogRecord::ExtraArgs(ExtraArgsRec {
                seq: (i + 1) as u8,
                args: extra,
            }))?;
        }
        Ok(())
    }

    fn write(&mut self, rec: &LogRecord) -> io::Result<()> {
        bincode::serialize_into(&mut self.w, rec)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    /// Flush buffered records to disk.
    pub fn flush(&mut self) -> io::Result<()> {
        use std::io::Write;
        self.w.flush()
    }
}

/// Read a thread's log back, reassembling chained argument records.
pub fn read_log(path: &Path) -> io::Result<Vec<SyncEvent>> {
    let mut r = BufReader::new(File::open(path)?);
    // The Sync record's narg is authoritative for trimming the chained
    // records' zero padding.
    let mut events: Vec<(SyncEvent, usize)> = Vec::new();
    loop {
        let rec: LogRecord = match bincode::deserialize_from(&mut r) {
            Ok(rec) => rec,
            Err(e) => match *e {
                bincode::ErrorKind::Io(ref ioe)
                    if ioe.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                _ => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            },
        };
        match rec {
            LogRecord::Sync(s) => {
                let narg = s.narg as usize;
                let inline = narg.min(MAX_INLINE_ARGS);
                let ev = SyncEvent {
                    ins: s.ins,
                    op: s.op,
                    turn: s.turn,
                    second_half: s.second_half,
                    timedout: s.timedout,
                    args: s.args[..inline].to_vec(),
                    timing_ns: (s.app_ns, s.syscall_ns, s.sched_ns),
                };
                events.push((ev, narg));
            }
            LogRecord::ExtraArgs(x) => {
                let (ev, narg) = events.last_mut().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "orphan extra-args record")
                })?;
                let owed = narg.saturating_sub(ev.args.len()).min(MAX_EXTRA_ARGS);
                ev.args.extend_from_slice(&x.args[..owed]);
            }
        }
    }
    Ok(events.into_iter().map(|(ev, _)| ev).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_inline_args() {
        let dir = tempfile::tempdir().unwrap();
        let tid = DetTid::from_raw(0);
        let mut l = ThreadLogger::open(dir.path(), tid).unwrap();
        l.append(
            7,
            SyncOp::MutexLock,
            Turn::from_u64(3),
            true,
            false,
            &[0xabc, 0],
            (1, 2, 3),
        )
        .unwrap();
        l.flush().unwrap();

        let evs = read_log(&log_file_path(dir.path(), tid)).unwrap();
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].op, SyncOp::MutexLock);
        assert_eq!(evs[0].turn, 3);
        assert_eq!(evs[0].args, vec![0xabc, 0]);
        assert_eq!(evs[0].timing_ns, (1, 2, 3));
    }

    #[test]
    fn wide_args_chain_and_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let tid = DetTid::from_raw(1);
        let args: Vec<u64> = (1..=7).collect();
        let mut l = ThreadLogger::open(dir.path(), tid).unwrap();
        l.append(
            1,
            SyncOp::Connect,
            Turn::from_u64(9),
            true,
            false,
            &args,
            (0, 0, 0),
        )
        .unwrap();
        l.flush().unwrap();

        let evs = read_log(&log_file_path(dir.path(), tid)).unwrap();
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].args, args);
    }

    #[test]
    fn sync_records_are_fixed_width() {
        let a = bincode::serialize(&LogRecord::Sync(SyncRec {
            ins: 0,
            op: SyncOp::ThreadBegin,
            turn: 0,
            second_half: true,
            timedout: false,
            narg: 0,
            args: [0; MAX_INLINE_ARGS],
            app_ns: 0,
            syscall_ns: 0,
            sched_ns: 0,
        }))
        .unwrap();
        let b = bincode::serialize(&LogRecord::Sync(SyncRec {
            ins: u32::MAX,
            op: SyncOp::EpollWait,
            turn: u64::MAX,
            second_half: false,
            timedout: true,
            narg: 2,
            args: [u64::MAX; MAX_INLINE_ARGS],
            app_ns: u64::MAX,
            syscall_ns: u64::MAX,
            sched_ns: u64::MAX,
        }))
        .unwrap();
        assert_eq!(a.len(), b.len());
    }
}
