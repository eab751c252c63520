use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    config::properties::{BatchHostSelection, BatchSchedulingAlgorithm},
    services::{batch::algorithms::SchedulingState, WaitTimeQuery},
};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport failed: {0}")]
    Transport(String),
    #[error("malformed oracle message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown oracle event type {0}")]
    UnknownEvent(String),
}

/// Blocking request/reply channel to an external batch scheduler.
pub trait SchedulingOracle {
    fn exchange(&mut self, request: &str) -> Result<String, OracleError>;
}

pub const JOB_SUBMITTED: &str = "JOB_SUBMITTED";
pub const JOB_COMPLETED: &str = "JOB_COMPLETED";
pub const JOB_KILLED: &str = "JOB_KILLED";
pub const QUERY: &str = "QUERY";
pub const EXECUTE_JOB: &str = "EXECUTE_JOB";
pub const ANSWER: &str = "ANSWER";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl ProtocolEvent {
    pub fn job_submitted(timestamp: f64, job_id: &str) -> Self {
        ProtocolEvent {
            timestamp,
            kind: JOB_SUBMITTED.to_string(),
            data: json!({ "job_id": job_id }),
        }
    }

    pub fn job_ended(timestamp: f64, job_id: &str, killed: bool) -> Self {
        ProtocolEvent {
            timestamp,
            kind: if killed { JOB_KILLED } else { JOB_COMPLETED }.to_string(),
            data: json!({ "job_id": job_id }),
        }
    }

    pub fn query(timestamp: f64, queries: &[WaitTimeQuery]) -> Self {
        let requests = queries
            .iter()
            .map(|q| json!({ "job_id": q.id, "nodes": q.num_hosts, "walltime": q.duration }))
            .collect::<Vec<_>>();
        ProtocolEvent {
            timestamp,
            kind: QUERY.to_string(),
            data: json!({ "requests": { "estimate_waiting_time": requests } }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OracleRequestDoc {
    #[serde(flatten)]
    pub state: SchedulingState,
    pub events: Vec<ProtocolEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OracleReplyDoc {
    pub now: f64,
    pub events: Vec<ProtocolEvent>,
}

#[derive(Deserialize)]
struct ExecuteJobData {
    job_id: String,
    alloc: Vec<String>,
}

#[derive(Deserialize)]
struct AnswerData {
    estimate_waiting_time: WaitingTimeAnswer,
}

#[derive(Deserialize)]
struct WaitingTimeAnswer {
    job_id: String,
    estimated_waiting_time: f64,
}

#[derive(Deserialize)]
struct QueryData {
    requests: QueryRequests,
}

#[derive(Deserialize)]
struct QueryRequests {
    estimate_waiting_time: Vec<QueryRequest>,
}

#[derive(Deserialize)]
struct QueryRequest {
    job_id: String,
    nodes: u32,
    walltime: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    ExecuteJob {
        timestamp: f64,
        job_id: String,
        hosts: Vec<String>,
    },
    Answer {
        timestamp: f64,
        job_id: String,
        estimated_waiting_time: f64,
    },
}

impl Decision {
    pub fn timestamp(&self) -> f64 {
        match self {
            Decision::ExecuteJob { timestamp, .. } | Decision::Answer { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

/// Parses an oracle reply into its `now` timestamp and decisions.
pub fn decode_reply(reply: &str) -> Result<(f64, Vec<Decision>), OracleError> {
    let doc: OracleReplyDoc = serde_json::from_str(reply)?;
    let mut decisions = Vec::with_capacity(doc.events.len());
    for event in doc.events {
        let decision = match event.kind.as_str() {
            EXECUTE_JOB => {
                let data: ExecuteJobData = serde_json::from_value(event.data)?;
                Decision::ExecuteJob {
                    timestamp: event.timestamp,
                    job_id: data.job_id,
                    hosts: data.alloc,
                }
            }
            ANSWER => {
                let data: AnswerData = serde_json::from_value(event.data)?;
                Decision::Answer {
                    timestamp: event.timestamp,
                    job_id: data.estimate_waiting_time.job_id,
                    estimated_waiting_time: data.estimate_waiting_time.estimated_waiting_time,
                }
            }
            other => return Err(OracleError::UnknownEvent(other.to_string())),
        };
        decisions.push(decision);
    }
    Ok((doc.now, decisions))
}

/// In-process oracle deciding with conservative backfilling over the request's snapshot.
pub struct BackfillingOracle {
    selection: BatchHostSelection,
    cursor: usize,
    exchanges: u64,
}

impl BackfillingOracle {
    pub fn new(selection: BatchHostSelection) -> Self {
        BackfillingOracle {
            selection,
            cursor: 0,
            exchanges: 0,
        }
    }

    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }
}

impl SchedulingOracle for BackfillingOracle {
    fn exchange(&mut self, request: &str) -> Result<String, OracleError> {
        self.exchanges += 1;
        let request: OracleRequestDoc = serde_json::from_str(request)?;
        let state = request.state;
        let mut events = Vec::new();

        let mut queries = Vec::new();
        for event in request.events {
            if event.kind == QUERY {
                let data: QueryData = serde_json::from_value(event.data)?;
                queries.extend(data.requests.estimate_waiting_time.into_iter().map(|q| {
                    WaitTimeQuery {
                        id: q.job_id,
                        num_hosts: q.nodes,
                        duration: q.walltime,
                    }
                }));
            }
        }

        if queries.is_empty() {
            for decision in state.decide(
                BatchSchedulingAlgorithm::ConservativeBf,
                self.selection,
                &mut self.cursor,
            ) {
                events.push(ProtocolEvent {
                    timestamp: state.now,
                    kind: EXECUTE_JOB.to_string(),
                    data: json!({ "job_id": decision.job_id, "alloc": decision.hosts }),
                });
            }
        } else {
            let estimates =
                state.estimate_waiting_times(BatchSchedulingAlgorithm::ConservativeBf, &queries);
            for (job_id, wait) in estimates {
                events.push(ProtocolEvent {
                    timestamp: state.now,
                    kind: ANSWER.to_string(),
                    data: json!({
                        "estimate_waiting_time": {
                            "job_id": job_id,
                            "estimated_waiting_time": wait,
                        }
                    }),
                });
            }
        }

        let reply = OracleReplyDoc {
            now: state.now,
            events,
        };
        Ok(serde_json::to_string(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::batch::algorithms::{HostSlot, QueuedSlot};

    #[test]
    fn decodes_both_decision_kinds() {
        let reply = r#"{
            "now": 12.5,
            "events": [
                {"timestamp": 10.0, "type": "EXECUTE_JOB", "data": {"job_id": "3", "alloc": ["h1", "h2"]}},
                {"timestamp": 12.0, "type": "ANSWER", "data": {"estimate_waiting_time": {"job_id": "q", "estimated_waiting_time": 42.0}}}
            ]
        }"#;
        let (now, decisions) = decode_reply(reply).unwrap();
        assert_eq!(now, 12.5);
        assert_eq!(
            decisions,
            vec![
                Decision::ExecuteJob {
                    timestamp: 10.,
                    job_id: "3".to_string(),
                    hosts: vec!["h1".to_string(), "h2".to_string()],
                },
                Decision::Answer {
                    timestamp: 12.,
                    job_id: "q".to_string(),
                    estimated_waiting_time: 42.,
                },
            ]
        );
    }

    #[test]
    fn unknown_events_are_rejected() {
        let reply = r#"{"now": 0.0, "events": [{"timestamp": 0.0, "type": "REJECT_JOB", "data": {}}]}"#;
        assert!(matches!(
            decode_reply(reply),
            Err(OracleError::UnknownEvent(kind)) if kind == "REJECT_JOB"
        ));
    }

    #[test]
    fn backfilling_oracle_starts_fitting_jobs() {
        let request = OracleRequestDoc {
            state: SchedulingState {
                now: 5.,
                hosts: vec![HostSlot {
                    name: "h1".to_string(),
                    cores: 10,
                }],
                running: Vec::new(),
                queue: vec![QueuedSlot {
                    job_id: "7".to_string(),
                    nodes: 1,
                    cores_per_node: 4,
                    walltime: 60.,
                }],
            },
            events: vec![ProtocolEvent::job_submitted(5., "7")],
        };
        let mut oracle = BackfillingOracle::new(BatchHostSelection::FirstFit);
        let reply = oracle
            .exchange(&serde_json::to_string(&request).unwrap())
            .unwrap();
        let (now, decisions) = decode_reply(&reply).unwrap();
        assert_eq!(now, 5.);
        assert_eq!(
            decisions,
            vec![Decision::ExecuteJob {
                timestamp: 5.,
                job_id: "7".to_string(),
                hosts: vec!["h1".to_string()],
            }]
        );
        assert_eq!(oracle.exchanges(), 1);
    }
}
