use std::{cell::RefCell, rc::Rc};

use dslab_core::{cast, log_debug, log_warn, Event, EventHandler, Id, SimulationContext};

use crate::{
    cluster_events::{ComputeServiceMessage, OracleRequest, ServiceEvent},
    services::{
        batch::oracle::{decode_reply, Decision, SchedulingOracle},
        ServiceId,
    },
};

/// Bridges a batch service and its scheduling oracle.
///
/// Each request is exchanged with the oracle, then every decision of the reply is
/// forwarded to the service at the simulated time it carries, never earlier than the
/// decision before it. A final `OracleReady` marks the end of the reply.
pub struct BatchNetworkListener {
    cluster_id: Id,
    oracle: Rc<RefCell<dyn SchedulingOracle>>,
    ctx: SimulationContext,
}

impl BatchNetworkListener {
    pub fn new(
        ctx: SimulationContext,
        cluster_id: Id,
        oracle: Rc<RefCell<dyn SchedulingOracle>>,
    ) -> Self {
        BatchNetworkListener {
            cluster_id,
            oracle,
            ctx,
        }
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    fn forward(&mut self, service: ServiceId, message: ComputeServiceMessage, delay: f64) {
        self.ctx
            .emit(ServiceEvent { service, message }, self.cluster_id, delay);
    }

    fn send_receive(&mut self, service: ServiceId, payload: String) {
        let reply = self.oracle.borrow_mut().exchange(&payload);
        let decoded = reply.and_then(|r| decode_reply(&r));
        let (reply_now, decisions) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                log_warn!(self.ctx, "oracle exchange for service {} failed: {}", service, e);
                self.forward(
                    service,
                    ComputeServiceMessage::OracleUnreachable {
                        reason: e.to_string(),
                    },
                    0.,
                );
                return;
            }
        };

        let now = self.ctx.time();
        let mut delay: f64 = 0.;
        log_debug!(
            self.ctx,
            "oracle replied with {} decisions for service {}",
            decisions.len(),
            service
        );
        for decision in decisions {
            delay = delay.max(decision.timestamp() - now);
            let message = match decision {
                Decision::ExecuteJob { job_id, hosts, .. } => {
                    ComputeServiceMessage::OracleExecuteJob { job_id, hosts }
                }
                Decision::Answer {
                    job_id,
                    estimated_waiting_time,
                    ..
                } => ComputeServiceMessage::OracleAnswer {
                    job_id,
                    estimated_waiting_time,
                },
            };
            self.forward(service, message, delay);
        }
        delay = delay.max(reply_now - now);
        self.forward(service, ComputeServiceMessage::OracleReady, delay);
    }
}

impl EventHandler for BatchNetworkListener {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            OracleRequest { service, payload } => {
                self.send_receive(service, payload);
            }
        })
    }
}
