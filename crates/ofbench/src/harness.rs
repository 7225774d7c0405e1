//! Per-test orchestration.
//!
//! For each loaded module the harness resets the execution context, runs
//! the module's init, then starts three units side by side:
//!
//! 1. the module run (channel setup, `start`, event loop), which owns the
//!    context and the control channel for the duration of the test,
//! 2. the auxiliary task, holding only the test's stop token,
//! 3. the traffic generator, holding its own stop token.
//!
//! Once the first two finish, traffic is told to stop and aborted if it
//! overstays the grace period. Capture statistics and the traffic report
//! are then collected into a [`TestReport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ofbench_core::{
    run_test_module, CaptureOpener, CaptureStats, CaptureTechnology, Channel, ControlChannel,
    ControlConfig, ExecutionContext, LoopError, LoopExit, NoCapture,
};
use ofbench_registry::{ModuleHandle, ModuleRegistry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::auxiliary::{AuxiliaryTask, IdleAuxiliary};
use crate::traffic::{IdleTraffic, TrafficGenerator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub device: String,
    pub technology: CaptureTechnology,
}

impl ChannelSpec {
    pub fn pcap(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            technology: CaptureTechnology::Pcap,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Capture channels in id order; the first one watches the control
    /// interface.
    pub channels: Vec<ChannelSpec>,
    pub control: ControlConfig,
    /// How long the traffic generator gets to stop before it is aborted.
    pub traffic_grace: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            control: ControlConfig::default(),
            traffic_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Completed,
    /// The control peer went away; no further test can run.
    ControlClosed,
    /// `init` or `start` failed; the test was skipped.
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct TestReport {
    pub module: String,
    pub outcome: TestOutcome,
    /// Statistics for every channel that had capture open.
    pub channels: Vec<(String, CaptureStats)>,
    pub traffic: Option<String>,
}

impl TestReport {
    /// One `device:received:dropped` line per open channel.
    pub fn stats_lines(&self) -> impl Iterator<Item = String> + '_ {
        self.channels
            .iter()
            .map(|(device, stats)| format!("{}:{}:{}", device, stats.received, stats.dropped))
    }
}

/// Progress notifications from [`Harness::run`].
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'a> {
    /// A test is about to be initialised.
    Starting { module: &'a str },
    /// A test has finished, been skipped, or lost the control connection.
    Finished(&'a TestReport),
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("test `{module}` failed")]
    Loop {
        module: String,
        #[source]
        source: LoopError,
    },
    #[error("module task for `{module}` did not finish")]
    Join {
        module: String,
        #[source]
        source: JoinError,
    },
    #[error("no control connection")]
    NoControl,
    #[error("module {0:?} is not available")]
    Unavailable(ModuleHandle),
}

pub struct Harness {
    config: HarnessConfig,
    registry: ModuleRegistry,
    context: ExecutionContext,
    opener: Arc<dyn CaptureOpener>,
    auxiliary: Arc<dyn AuxiliaryTask>,
    traffic: Arc<dyn TrafficGenerator>,
    control: Option<ControlChannel>,
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("connected", &self.control.is_some())
            .finish_non_exhaustive()
    }
}

impl Harness {
    pub fn new(config: HarnessConfig, registry: ModuleRegistry) -> Self {
        let channels = config
            .channels
            .iter()
            .map(|spec| Channel::new(spec.device.clone(), spec.technology));
        let context = ExecutionContext::new(channels, config.control.protocol_version);
        Self {
            config,
            registry,
            context,
            opener: Arc::new(NoCapture),
            auxiliary: Arc::new(IdleAuxiliary),
            traffic: Arc::new(IdleTraffic),
            control: None,
        }
    }

    pub fn with_opener(mut self, opener: Arc<dyn CaptureOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_auxiliary(mut self, auxiliary: Arc<dyn AuxiliaryTask>) -> Self {
        self.auxiliary = auxiliary;
        self
    }

    pub fn with_traffic(mut self, traffic: Arc<dyn TrafficGenerator>) -> Self {
        self.traffic = traffic;
        self
    }

    /// Use `stream` as the control connection for every following test.
    pub fn connect<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.control = Some(ControlChannel::new(stream, self.config.control.clone()));
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_some()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn handles(&self) -> Vec<ModuleHandle> {
        self.registry.handles().collect()
    }

    /// The context the next test starts from.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Run every loaded module in load order, telling `observe` as each test
    /// starts and finishes. Stops early when the control connection closes.
    pub async fn run<F>(&mut self, mut observe: F) -> Result<Vec<TestReport>, RunError>
    where
        F: FnMut(RunEvent<'_>),
    {
        let handles = self.handles();
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(module) = self.registry.name(handle) {
                observe(RunEvent::Starting { module });
            }
            let report = self.run_test(handle).await?;
            observe(RunEvent::Finished(&report));
            let closed = report.outcome == TestOutcome::ControlClosed;
            reports.push(report);
            if closed {
                tracing::info!("control connection closed, ending run");
                break;
            }
        }
        Ok(reports)
    }

    pub async fn run_test(&mut self, handle: ModuleHandle) -> Result<TestReport, RunError> {
        let name = self
            .registry
            .name(handle)
            .ok_or(RunError::Unavailable(handle))?
            .to_owned();
        let args = self.registry.init_args(handle).unwrap_or_default().to_owned();
        let mut control = self.control.take().ok_or(RunError::NoControl)?;
        let Some(mut module) = self.registry.checkout(handle) else {
            self.control = Some(control);
            return Err(RunError::Unavailable(handle));
        };

        let mut ctx = std::mem::take(&mut self.context);
        ctx.reset();
        ctx.set_current_test(name.clone());
        tracing::info!(test = %name, args = %args, "running test");

        if let Err(e) = module.init(&mut ctx, &args) {
            tracing::warn!(test = %name, error = %e, "init failed, skipping test");
            self.registry.checkin(handle, module);
            self.context = ctx;
            self.control = Some(control);
            return Ok(TestReport {
                module: name,
                outcome: TestOutcome::Skipped(e.to_string()),
                channels: Vec::new(),
                traffic: None,
            });
        }

        let stop = ctx.stop_token();
        let opener = self.opener.clone();
        let module_run = tokio::spawn(async move {
            // Whatever ends the run also ends the auxiliary task.
            let _stop_on_exit = ctx.stop_token().drop_guard();
            let result =
                run_test_module(&mut *module, &mut ctx, &mut control, opener.as_ref()).await;
            (module, ctx, control, result)
        });
        let auxiliary = tokio::spawn(self.auxiliary.clone().run(stop));
        let traffic_stop = CancellationToken::new();
        let mut traffic = tokio::spawn(self.traffic.clone().run(traffic_stop.clone()));

        let (module_run, auxiliary) = tokio::join!(module_run, auxiliary);

        traffic_stop.cancel();
        match tokio::time::timeout(self.config.traffic_grace, &mut traffic).await {
            Ok(Ok(())) => tracing::debug!(test = %name, "traffic generator stopped"),
            Ok(Err(e)) => tracing::warn!(test = %name, error = %e, "traffic generator failed"),
            Err(_) => {
                tracing::warn!(
                    test = %name,
                    grace = ?self.config.traffic_grace,
                    "traffic generator ignored stop, aborting"
                );
                traffic.abort();
            }
        }
        if let Err(e) = auxiliary {
            tracing::warn!(test = %name, error = %e, "auxiliary task failed");
        }

        let (module, ctx, control, result) = module_run.map_err(|source| RunError::Join {
            module: name.clone(),
            source,
        })?;
        self.registry.checkin(handle, module);

        let outcome = match result {
            Ok(LoopExit::Ended) => TestOutcome::Completed,
            Ok(LoopExit::ControlClosed) => TestOutcome::ControlClosed,
            Err(LoopError::Start { source, .. }) => {
                tracing::warn!(test = %name, error = %source, "start failed, skipping test");
                TestOutcome::Skipped(source.to_string())
            }
            Err(source) => {
                tracing::error!(test = %name, error = %source, "test aborted");
                // The control stream can't be trusted any more; only the
                // context survives.
                self.context = ctx;
                return Err(RunError::Loop {
                    module: name,
                    source,
                });
            }
        };
        if outcome != TestOutcome::ControlClosed {
            self.control = Some(control);
        }

        let channels: Vec<(String, CaptureStats)> = ctx
            .channels()
            .iter()
            .filter_map(|c| c.stats().map(|stats| (c.device().to_owned(), stats)))
            .collect();
        self.context = ctx;

        let report = TestReport {
            module: name,
            outcome,
            channels,
            traffic: self.traffic.report(),
        };
        for line in report.stats_lines() {
            tracing::info!(test = %report.module, "{line}");
        }
        if let Some(traffic) = &report.traffic {
            tracing::info!(test = %report.module, "{traffic}");
        }
        Ok(report)
    }
}
