//! Message loop driving one sandbox.
//!
//! The sandbox is synchronous and owned by a single caller, so the whole
//! loop runs on a blocking task.  Ctrl-C is wired to the sandbox's
//! [`StopHandle`], which breaks even a call that is stuck in the guest.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sluice_pipeline::inject::synthesize;
use sluice_pipeline::{GlobalSettings, InjectOutcome, InjectionLimiter, Injector, Message, Pack};
use sluice_sandbox::{Sandbox, SandboxStatus};
use tracing::{info, warn};

use crate::config::PluginFile;

/// Options for one `sluice run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// JSON-lines input; stdin when `None`.
    pub input: Option<PathBuf>,
    /// State file loaded by `init` and written by `destroy`.
    pub state: Option<PathBuf>,
    pub ticker_interval: Option<Duration>,
    pub reinject: bool,
}

/// What happened during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Messages the plugin accepted (status 0).
    pub processed: u64,
    /// Messages the plugin rejected (non-zero status).
    pub rejected: u64,
    /// Messages the plugin injected.
    pub injected: u64,
    pub timer_events: u64,
    pub status: SandboxStatus,
    pub last_error: String,
}

/// Messages injected by the guest, waiting to be written out.
pub type Outbox = Arc<Mutex<Vec<Message>>>;

/// Create, initialize and run the sandbox described by `plugin`.
pub async fn run(plugin: PluginFile, options: RunOptions) -> Result<RunSummary> {
    let globals = Arc::clone(&plugin.sandbox.globals);
    let outbox = Outbox::default();
    let limiter = Arc::new(InjectionLimiter::new(
        collector(Arc::clone(&outbox), &plugin.sandbox.name, Arc::clone(&globals)),
        &globals,
    ));

    let mut sandbox = Sandbox::create(plugin.sandbox_config()).context("failed to create sandbox")?;
    sandbox.inject_message(limiter.clone());
    sandbox
        .init(options.state.as_deref())
        .context("failed to initialize sandbox")?;

    let handle = sandbox.stop_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping sandbox");
            handle.stop();
        }
    });

    let state = options.state.clone();
    let (sandbox, summary) = tokio::task::spawn_blocking(move || {
        let mut driver = Driver {
            sandbox,
            limiter,
            outbox,
            globals,
            reinject: options.reinject,
            ticker_interval: options.ticker_interval,
            summary: RunSummary::default(),
        };
        let result = match &options.input {
            Some(path) => std::fs::File::open(path)
                .with_context(|| format!("failed to open input {}", path.display()))
                .and_then(|file| driver.drive(BufReader::new(file), std::io::stdout().lock())),
            None => driver.drive(std::io::stdin().lock(), std::io::stdout().lock()),
        };
        driver.finish(result)
    })
    .await
    .context("sandbox task panicked")??;
    interrupt.abort();

    sandbox
        .destroy(state.as_deref())
        .context("failed to destroy sandbox")?;
    Ok(summary)
}

/// Injector that turns guest payloads into messages and queues them.
///
/// Output is JSON lines, so payloads that are not UTF-8 are refused with
/// [`InjectOutcome::Failed`].
pub fn collector(outbox: Outbox, logger: &str, globals: Arc<GlobalSettings>) -> Arc<dyn Injector> {
    let logger = logger.to_owned();
    Arc::new(move |payload: &[u8], payload_type: &str, payload_name: &str| {
        if let Err(e) = std::str::from_utf8(payload) {
            warn!(payload_name, error = %e, "injection refused: payload is not UTF-8");
            return InjectOutcome::Failed.code();
        }
        let msg = synthesize(payload, payload_type, payload_name, &logger, &globals);
        outbox.lock().unwrap_or_else(PoisonError::into_inner).push(msg);
        InjectOutcome::Accepted.code()
    })
}

/// The synchronous half of a run.
pub struct Driver {
    pub sandbox: Sandbox,
    pub limiter: Arc<InjectionLimiter>,
    pub outbox: Outbox,
    pub globals: Arc<GlobalSettings>,
    pub reinject: bool,
    pub ticker_interval: Option<Duration>,
    pub summary: RunSummary,
}

impl Driver {
    /// Feed every JSON line of `input` through the sandbox, writing
    /// processed and injected messages to `output` as JSON lines.
    ///
    /// Stops early once the sandbox leaves the running state.
    pub fn drive(&mut self, input: impl BufRead, mut output: impl Write) -> Result<()> {
        let mut last_tick = Instant::now();
        for (line_no, line) in input.lines().enumerate() {
            let line = line.context("failed to read input")?;
            if line.trim().is_empty() {
                continue;
            }
            let message: Message = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "skipping malformed message");
                    continue;
                }
            };
            let pack = Pack::new(message).with_encoded(line.into_bytes());
            if !self.process(pack, &mut output)? {
                return Ok(());
            }

            if let Some(interval) = self.ticker_interval {
                if last_tick.elapsed() >= interval {
                    last_tick = Instant::now();
                    if !self.tick(&mut output)? {
                        return Ok(());
                    }
                }
            }
        }

        if self.ticker_interval.is_some() {
            self.tick(&mut output)?;
        }
        Ok(())
    }

    /// Run one message and everything it re-injects.  Returns `false` once
    /// the sandbox can no longer take calls.
    fn process(&mut self, pack: Pack, output: &mut impl Write) -> Result<bool> {
        let mut queue = VecDeque::from([pack]);
        while let Some(mut pack) = queue.pop_front() {
            self.limiter
                .begin_call(self.globals.max_process_inject, pack.msg_loop_count);
            let outcome = self.sandbox.process_message(&mut pack);
            let injected = self.flush_outbox(output)?;
            if self.reinject {
                queue.extend(injected.into_iter().map(|message| Pack {
                    msg_loop_count: pack.msg_loop_count + 1,
                    ..Pack::new(message)
                }));
            }

            match outcome {
                Ok(0) => {
                    self.summary.processed += 1;
                    write_json(output, pack.message())?;
                }
                Ok(code) => {
                    self.summary.rejected += 1;
                    warn!(code, uuid = %pack.message.uuid, "message rejected by plugin");
                }
                Err(e) => {
                    warn!(error = %e, "sandbox call failed");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn tick(&mut self, output: &mut impl Write) -> Result<bool> {
        self.limiter.begin_call(self.globals.max_timer_inject, 0);
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        let outcome = self.sandbox.timer_event(now_ns);
        self.flush_outbox(output)?;
        self.summary.timer_events += 1;
        match outcome {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "timer event failed");
                Ok(false)
            }
        }
    }

    fn flush_outbox(&mut self, output: &mut impl Write) -> Result<Vec<Message>> {
        let injected = std::mem::take(&mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner));
        for message in &injected {
            write_json(output, message)?;
        }
        self.summary.injected += injected.len() as u64;
        Ok(injected)
    }

    /// Record the final sandbox status and hand the sandbox back.
    pub fn finish(mut self, result: Result<()>) -> Result<(Sandbox, RunSummary)> {
        result?;
        self.summary.status = self.sandbox.status();
        self.summary.last_error = self.sandbox.last_error().to_owned();
        Ok((self.sandbox, self.summary))
    }
}

fn write_json(output: &mut impl Write, message: &Message) -> Result<()> {
    serde_json::to_writer(&mut *output, message).context("failed to encode message")?;
    writeln!(output).context("failed to write output")?;
    Ok(())
}
