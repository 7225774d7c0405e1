//! Control-channel round-trip time.
//!
//! Sends an echo request every `interval_ms` and times the matching echo
//! reply. The test ends once `count` replies have come back.
//!
//! Arguments: `count=N interval_ms=M`, both optional.

use std::collections::HashMap;
use std::time::Duration;

use ofbench_core::{
    ExecutionContext, HandlerResult, Message, MessageKind, ModuleError, TestModule, TimerEvent,
};
use tokio::time::Instant;

const SEND_PROBE: u32 = 1;

#[derive(Debug)]
pub struct EchoRtt {
    count: usize,
    interval: Duration,
    sent: usize,
    in_flight: HashMap<u32, Instant>,
    samples: Vec<Duration>,
}

impl Default for EchoRtt {
    fn default() -> Self {
        Self {
            count: 10,
            interval: Duration::from_millis(100),
            sent: 0,
            in_flight: HashMap::new(),
            samples: Vec::new(),
        }
    }
}

impl EchoRtt {
    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    fn parse_args(&mut self, args: &str) -> HandlerResult {
        for pair in args.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ModuleError::new(format!("expected key=value, got `{pair}`")))?;
            let number: u64 = value
                .parse()
                .map_err(|_| ModuleError::new(format!("`{key}` needs a number, got `{value}`")))?;
            match key {
                "count" if number > 0 => self.count = number as usize,
                "count" => return Err(ModuleError::new("count must be at least 1")),
                "interval_ms" => self.interval = Duration::from_millis(number),
                other => return Err(ModuleError::new(format!("unknown argument `{other}`"))),
            }
        }
        Ok(())
    }

    fn summary(&self) -> Option<(Duration, Duration, Duration)> {
        let min = self.samples.iter().min()?;
        let max = self.samples.iter().max()?;
        let total: Duration = self.samples.iter().sum();
        Some((*min, total / self.samples.len() as u32, *max))
    }
}

impl TestModule for EchoRtt {
    fn name(&self) -> &str {
        "echo_rtt"
    }

    fn init(&mut self, _ctx: &mut ExecutionContext, args: &str) -> HandlerResult {
        *self = Self::default();
        self.parse_args(args)
    }

    fn start(&mut self, ctx: &mut ExecutionContext) -> HandlerResult {
        tracing::info!(count = self.count, interval = ?self.interval, "measuring echo round trips");
        ctx.schedule_timer(self.interval, SEND_PROBE, 0);
        Ok(())
    }

    fn handle_timer_event(
        &mut self,
        ctx: &mut ExecutionContext,
        event: &TimerEvent,
    ) -> HandlerResult {
        if event.kind != SEND_PROBE {
            return Ok(());
        }
        let seq = self.sent as u64;
        let xid = ctx.send_message(MessageKind::EchoRequest, &seq.to_be_bytes())?;
        self.in_flight.insert(xid, Instant::now());
        self.sent += 1;
        if self.sent < self.count {
            ctx.schedule_timer(self.interval, SEND_PROBE, 0);
        }
        Ok(())
    }

    fn of_event_other(&mut self, ctx: &mut ExecutionContext, msg: &Message) -> HandlerResult {
        if msg.kind() != Some(MessageKind::EchoReply) {
            return Ok(());
        }
        let Some(sent_at) = self.in_flight.remove(&msg.xid()) else {
            tracing::debug!(xid = msg.xid(), "echo reply for unknown request");
            return Ok(());
        };

        let rtt = sent_at.elapsed();
        self.samples.push(rtt);
        tracing::debug!(xid = msg.xid(), rtt_us = rtt.as_micros() as u64, "echo reply");

        if self.samples.len() >= self.count {
            if let Some((min, avg, max)) = self.summary() {
                tracing::info!(samples = self.samples.len(), ?min, ?avg, ?max, "echo round trip");
            }
            ctx.end_test();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let mut module = EchoRtt::default();
        let mut ctx = ExecutionContext::default();
        module.init(&mut ctx, "count=3 interval_ms=5").unwrap();
        assert_eq!(module.count, 3);
        assert_eq!(module.interval, Duration::from_millis(5));
    }

    #[test]
    fn test_bad_args_are_rejected() {
        let mut module = EchoRtt::default();
        let mut ctx = ExecutionContext::default();
        assert!(module.init(&mut ctx, "count").is_err());
        assert!(module.init(&mut ctx, "count=0").is_err());
        assert!(module.init(&mut ctx, "rate=4").is_err());
        assert!(module.init(&mut ctx, "interval_ms=soon").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timer_sends_echo_request() {
        let mut module = EchoRtt::default();
        let mut ctx = ExecutionContext::default();
        module.init(&mut ctx, "count=2 interval_ms=1").unwrap();
        module.start(&mut ctx).unwrap();

        let event = ctx.timers_mut().pop_next().unwrap();
        module.handle_timer_event(&mut ctx, &event).unwrap();

        let bytes = ctx.take_outbound().unwrap();
        assert_eq!(bytes[1], MessageKind::EchoRequest.as_u8());
        assert_eq!(ctx.timers().len(), 1);
        assert_eq!(module.in_flight.len(), 1);
    }
}
