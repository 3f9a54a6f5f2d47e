//! Line-oriented dependence-record files.
//!
//! Two formats survive from the profiling toolchain:
//!
//! * bracketed records (`lcout.out`, `dout.out`, `auxout.out`):
//!   `[depVar @ depFcn * depBB -- reqVar @ reqFcn * reqBB] l1#l2#...`
//! * per-loop edge logs (`deplog-<loopId>.txt`): one header line
//!   `<loopId> 0 0 0 0 0`, then `<loopId> <src> <dst> <dstBare> <cross> 1`.
//!
//! Lines starting with `#` are comments in both.

use crate::errors::{Result, SpecloomError};
use regex::Regex;
use std::io::{BufRead, Write};

/// One bracketed dependence record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepRecord {
    pub dep_var: String,
    pub dep_fcn: String,
    pub dep_bb: String,
    pub req_var: String,
    pub req_fcn: String,
    pub req_bb: String,
    pub lines: Vec<u32>,
}

impl DepRecord {
    pub fn render(&self) -> String {
        let nums: String = self.lines.iter().map(|l| format!("{}#", l)).collect();
        format!(
            "[{} @ {} * {} -- {} @ {} * {}] {}",
            self.dep_var, self.dep_fcn, self.dep_bb, self.req_var, self.req_fcn, self.req_bb, nums
        )
    }
}

/// Parse a bracketed dependence-record stream.
pub fn read_dep_records(reader: impl BufRead) -> Result<Vec<DepRecord>> {
    let re = Regex::new(
        r"^\[(?P<dv>\S+) @ (?P<df>\S+) \* (?P<db>\S+) -- (?P<rv>\S+) @ (?P<rf>\S+) \* (?P<rb>\S+)\]\s*(?P<lines>.*)$",
    )
    .expect("dep-record regex");

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let caps = re
            .captures(trimmed)
            .ok_or_else(|| SpecloomError::DepRecord(format!("malformed record: {}", trimmed)))?;
        let lines = caps["lines"]
            .split('#')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim().parse::<u32>().map_err(|_| {
                    SpecloomError::DepRecord(format!("bad line number `{}` in: {}", s, trimmed))
                })
            })
            .collect::<Result<Vec<u32>>>()?;
        out.push(DepRecord {
            dep_var: caps["dv"].to_string(),
            dep_fcn: caps["df"].to_string(),
            dep_bb: caps["db"].to_string(),
            req_var: caps["rv"].to_string(),
            req_fcn: caps["rf"].to_string(),
            req_bb: caps["rb"].to_string(),
            lines,
        });
    }
    Ok(out)
}

pub fn write_dep_records(records: &[DepRecord], out: &mut impl Write) -> Result<()> {
    for r in records {
        writeln!(out, "{}", r.render())?;
    }
    Ok(())
}

/// One edge of a per-loop dependence log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepLogEdge {
    pub src: u32,
    pub dst: u32,
    pub dst_bare: u32,
    pub cross_iteration: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepLog {
    pub loop_id: u32,
    pub edges: Vec<DepLogEdge>,
}

impl DepLog {
    pub fn new(loop_id: u32) -> Self {
        DepLog { loop_id, edges: Vec::new() }
    }

    pub fn file_name(&self) -> String {
        format!("deplog-{}.txt", self.loop_id)
    }

    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "{} 0 0 0 0 0", self.loop_id)?;
        for e in &self.edges {
            writeln!(
                out,
                "{} {} {} {} {} 1",
                self.loop_id,
                e.src,
                e.dst,
                e.dst_bare,
                if e.cross_iteration { 1 } else { 0 }
            )?;
        }
        Ok(())
    }

    pub fn read(reader: impl BufRead) -> Result<Self> {
        let mut log = DepLog::default();
        let mut saw_header = false;
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<u32> = trimmed
                .split_whitespace()
                .map(|s| {
                    s.parse::<u32>().map_err(|_| {
                        SpecloomError::DepRecord(format!("bad deplog field `{}`", s))
                    })
                })
                .collect::<Result<Vec<u32>>>()?;
            if fields.len() != 6 {
                return Err(SpecloomError::DepRecord(format!(
                    "deplog line has {} fields, expected 6",
                    fields.len()
                )));
            }
            if !saw_header {
                log.loop_id = fields[0];
                saw_header = true;
                continue;
            }
            if fields[0] != log.loop_id {
                return Err(SpecloomError::DepRecord("deplog loop id mismatch".into()));
            }
            log.edges.push(DepLogEdge {
                src: fields[1],
                dst: fields[2],
                dst_bare: fields[3],
                cross_iteration: fields[4] != 0,
            });
        }
        Ok(log)
    }
}
