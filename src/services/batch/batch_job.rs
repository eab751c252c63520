use crate::{
    failure::SubmitError,
    services::ServiceArgs,
    workflow::job::{JobId, JobType},
};

/// Shape of a batch request, from the `-N`, `-t` (minutes) and `-c` arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchRequest {
    pub nodes: u32,
    /// Seconds.
    pub walltime: f64,
    pub cores_per_node: u32,
}

fn required<'a>(args: &'a ServiceArgs, key: &str) -> Result<&'a str, SubmitError> {
    args.get(key)
        .map(|v| v.as_str())
        .ok_or_else(|| SubmitError::InvalidArgument(format!("missing batch argument {}", key)))
}

fn positive_count(args: &ServiceArgs, key: &str) -> Result<u32, SubmitError> {
    let raw = required(args, key)?;
    match raw.trim().parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(SubmitError::InvalidArgument(format!(
            "batch argument {} must be a positive integer, got '{}'",
            key, raw
        ))),
    }
}

impl BatchRequest {
    pub fn from_args(args: &ServiceArgs) -> Result<Self, SubmitError> {
        let nodes = positive_count(args, "-N")?;
        let cores_per_node = positive_count(args, "-c")?;
        let raw = required(args, "-t")?;
        let minutes = match raw.trim().parse::<f64>() {
            Ok(v) if v > 0. && v.is_finite() => v,
            _ => {
                return Err(SubmitError::InvalidArgument(format!(
                    "batch argument -t must be a positive number of minutes, got '{}'",
                    raw
                )))
            }
        };
        Ok(BatchRequest {
            nodes,
            walltime: minutes * 60.,
            cores_per_node,
        })
    }
}

/// A job waiting in, or started from, a batch queue.
#[derive(Clone, Debug)]
pub struct BatchJob {
    pub job: JobId,
    pub job_type: JobType,
    pub request: BatchRequest,
    pub submit_time: f64,
}
