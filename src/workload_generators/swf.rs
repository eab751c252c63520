use std::{fs::File, io::Read, path::Path};

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Standard Workload Format columns.
const JOB_NUMBER: usize = 0;
const SUBMIT_TIME: usize = 1;
const RUN_TIME: usize = 3;
const ALLOCATED_PROCESSORS: usize = 4;
const REQUESTED_PROCESSORS: usize = 7;
const REQUESTED_TIME: usize = 8;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("cannot open trace {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot read trace: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

/// One job of a trace, as a single-task standard job request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceJob {
    pub id: String,
    /// Work in flops, taken from the run time at one flop per second.
    pub flops: f64,
    /// Unknown in SWF traces; the replayer decides.
    pub min_cores: Option<u32>,
    pub max_cores: Option<u32>,
    pub parallel_efficiency: f64,
    pub num_nodes: u32,
    /// Requested walltime in seconds, the run time when the trace has none.
    pub requested_time: f64,
}

fn field(record: &[&str], idx: usize, line: u64) -> Result<f64, TraceError> {
    let raw = record.get(idx).ok_or_else(|| TraceError::Malformed {
        line,
        reason: format!("missing column {}", idx),
    })?;
    raw.parse::<f64>().map_err(|_| TraceError::Malformed {
        line,
        reason: format!("column {} is not a number: '{}'", idx, raw),
    })
}

fn parse_record(record: &StringRecord) -> Result<Option<(f64, TraceJob)>, TraceError> {
    let line = record.position().map_or(0, |p| p.line());
    // runs of spaces produce empty fields
    let fields = record.iter().filter(|f| !f.is_empty()).collect::<Vec<_>>();
    if fields.is_empty() {
        return Ok(None);
    }

    let id = fields[JOB_NUMBER].to_string();
    let submit_time = field(&fields, SUBMIT_TIME, line)?;
    let run_time = field(&fields, RUN_TIME, line)?;
    if run_time < 0. || submit_time < 0. {
        // cancelled before running
        return Ok(None);
    }
    let mut nodes = field(&fields, ALLOCATED_PROCESSORS, line)?;
    if nodes <= 0. {
        nodes = field(&fields, REQUESTED_PROCESSORS, line).unwrap_or(-1.);
    }
    if nodes <= 0. {
        return Err(TraceError::Malformed {
            line,
            reason: format!("job {} has no processor count", id),
        });
    }
    let requested_time = match field(&fields, REQUESTED_TIME, line) {
        Ok(t) if t > 0. => t,
        _ => run_time,
    };

    let job = TraceJob {
        id,
        flops: run_time,
        min_cores: None,
        max_cores: None,
        parallel_efficiency: 1.,
        num_nodes: nodes as u32,
        requested_time,
    };
    Ok(Some((submit_time, job)))
}

/// Reads whitespace-separated SWF records; `;` lines are header comments.
pub fn load_from_reader(
    reader: impl Read,
    load_time_compensation: f64,
) -> Result<Vec<(f64, TraceJob)>, TraceError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b' ')
        .comment(Some(b';'))
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut jobs = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(entry) = parse_record(&record)? {
            jobs.push(entry);
        }
    }

    jobs.sort_by(|a, b| a.0.total_cmp(&b.0));
    if let Some(first) = jobs.first().map(|(t, _)| *t) {
        for (time, _) in jobs.iter_mut() {
            *time = *time - first + load_time_compensation;
        }
    }
    Ok(jobs)
}

/// Loads a trace so that its first job arrives at `load_time_compensation`.
pub fn load_from_trace_file(
    path: impl AsRef<Path>,
    load_time_compensation: f64,
) -> Result<Vec<(f64, TraceJob)>, TraceError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| TraceError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_from_reader(file, load_time_compensation)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
; Version: 2.2
; Computer: test cluster
    1      10     5    100     2  -1  -1     2    120  -1  1  1  1  1  1  1  -1  -1
    2      4      0     50     1  -1  -1     1     -1  -1  1  1  1  1  1  1  -1  -1
    3      30     0     -1     1  -1  -1     1     60  -1  5  1  1  1  1  1  -1  -1
";

    #[test]
    fn reads_jobs_in_submission_order() {
        let jobs = load_from_reader(TRACE.as_bytes(), 0.).unwrap();
        assert_eq!(jobs.len(), 2);

        let (time, job) = &jobs[0];
        assert_eq!(*time, 0.);
        assert_eq!(job.id, "2");
        assert_eq!(job.flops, 50.);
        assert_eq!(job.num_nodes, 1);
        assert_eq!(job.requested_time, 50.);

        let (time, job) = &jobs[1];
        assert_eq!(*time, 6.);
        assert_eq!(job.id, "1");
        assert_eq!(job.num_nodes, 2);
        assert_eq!(job.requested_time, 120.);
    }

    #[test]
    fn compensation_shifts_the_first_arrival() {
        let jobs = load_from_reader(TRACE.as_bytes(), 100.).unwrap();
        assert_eq!(jobs[0].0, 100.);
        assert_eq!(jobs[1].0, 106.);
    }

    #[test]
    fn short_records_are_rejected() {
        let err = load_from_reader("7 10 0\n".as_bytes(), 0.).unwrap_err();
        assert!(matches!(err, TraceError::Malformed { .. }));
    }
}
