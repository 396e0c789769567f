//! Run artifacts on disk.
//!
//! - `ingress.jsonl`: every packet as it entered the switch, one JSON object per line
//! - `ranks.txt`: the level-0 rank computed for each of those packets, one integer per line,
//!   in the same order
//! - `egress.jsonl`: every packet as it left the switch
//! - `report.json`: the run summary

use super::arbiter::Arrival;
use super::receiver::Departure;
use super::RunReport;
use crate::ingress::RankRecord;
use crate::packet::Rank;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const INGRESS_CAPTURE: &str = "ingress.jsonl";
pub const RANK_LIST: &str = "ranks.txt";
pub const EGRESS_CAPTURE: &str = "egress.jsonl";
pub const REPORT: &str = "report.json";

/// Write `records` as JSON lines.
pub fn write_json_lines<T: Serialize>(path: &Path, records: &[T]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

/// Read JSON lines written by [`write_json_lines`], skipping blank lines.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

pub fn write_rank_list(path: &Path, ranks: &[RankRecord]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for record in ranks {
        writeln!(out, "{}", record.rank)?;
    }
    out.flush()
}

pub fn read_rank_list(path: &Path) -> io::Result<Vec<Rank>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .parse::<Rank>()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
        })
        .collect()
}

/// Persist every artifact of a run under `dir`, creating it if needed.
pub fn write_artifacts(
    dir: &Path,
    arrivals: &[Arrival],
    ranks: &[RankRecord],
    departures: &[Departure],
    report: &RunReport,
) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let ingress = dir.join(INGRESS_CAPTURE);
    let rank_list = dir.join(RANK_LIST);
    let egress = dir.join(EGRESS_CAPTURE);
    let summary = dir.join(REPORT);

    write_json_lines(&ingress, arrivals)?;
    write_rank_list(&rank_list, ranks)?;
    write_json_lines(&egress, departures)?;
    let mut out = BufWriter::new(File::create(&summary)?);
    serde_json::to_writer_pretty(&mut out, report)?;
    out.flush()?;

    info!(dir = %dir.display(), packets = arrivals.len(), "artifacts written");
    Ok(vec![ingress, rank_list, egress, summary])
}
