//! CLI commands and the scenarios they run on.

use anyhow::{bail, Context};
use clap::Subcommand;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;
use transport::{CapFlags, LoopbackConfig, LoopbackFabric, ResourceIndex, TlResource};
use wireup::{select_transport, AuxScore, EpConfig, EpOp, Resource, TransportScore, Worker, WorkerConfig};

const AM_ID_DATA: transport::AmId = 7;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Wire up two workers and deliver messages sent before wire-up completes.
    Run {
        /// Messages sent right after the endpoint is created.
        #[arg(short, long, default_value_t = 8)]
        messages: u32,
        /// Progress rounds allowed before giving up.
        #[arg(long, default_value_t = 1000)]
        max_rounds: usize,
    },
    /// Show how each resource scores as the auxiliary transport.
    Select,
}

impl Command {
    pub fn execute(&self, scenario: &Scenario) -> anyhow::Result<CommandResult> {
        match *self {
            Command::Run { messages, max_rounds } => run(scenario, messages, max_rounds),
            Command::Select => select(scenario),
        }
    }
}

/// One transport resource of a scenario worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub tl_name: String,
    pub dev_name: String,
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

/// Resources every worker opens, and which of them serve each category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub resources: Vec<ResourceSpec>,
    /// Resource index serving active messages.
    pub am: u8,
    /// Resource index serving remote memory access, if any.
    #[serde(default)]
    pub rma: Option<u8>,
}

impl Default for Scenario {
    /// A resource that can only connect endpoint-to-endpoint serves active
    /// messages; a full loopback resource is left to carry wire-up.
    fn default() -> Self {
        Self {
            resources: vec![
                ResourceSpec {
                    tl_name: "shm".to_string(),
                    dev_name: "mem0".to_string(),
                    loopback: LoopbackConfig {
                        flags: LoopbackConfig::default_flags().difference(CapFlags::CONNECT_TO_IFACE),
                        ..LoopbackConfig::default()
                    },
                },
                ResourceSpec {
                    tl_name: "loopback".to_string(),
                    dev_name: "lo0".to_string(),
                    loopback: LoopbackConfig::default(),
                },
            ],
            am: 0,
            rma: None,
        }
    }
}

impl Scenario {
    fn ep_config(&self) -> anyhow::Result<EpConfig> {
        let mut config = EpConfig::new();
        for (op, index) in [(EpOp::Am, Some(self.am)), (EpOp::Rma, self.rma)] {
            let Some(index) = index else {
                continue;
            };
            if usize::from(index) >= self.resources.len() {
                bail!("{} configured on resource {} of {}", op, index, self.resources.len());
            }
            config = config.with_resource(op, ResourceIndex(index));
        }
        Ok(config)
    }

    /// Opens the scenario's resources on `fabric` and builds a worker on them.
    pub fn worker(&self, fabric: &LoopbackFabric, name: &str) -> anyhow::Result<Arc<Worker>> {
        let resources = self
            .resources
            .iter()
            .map(|rsc| {
                Resource::new(
                    TlResource::new(rsc.tl_name.as_str(), rsc.dev_name.as_str()),
                    fabric.open_iface(rsc.loopback.clone()),
                )
            })
            .collect();
        Ok(Worker::new(WorkerConfig::new(name), self.ep_config()?, resources))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandResult {
    Run(RunReport),
    Select(SelectReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub rounds: usize,
    pub aux_resource: Option<String>,
    pub sent: u32,
    pub delivered: usize,
    pub in_order: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub resource: String,
    pub score: Option<f64>,
    pub lacks: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectReport {
    pub candidates: Vec<Candidate>,
    pub selected: Option<String>,
    pub error: Option<String>,
}

fn describe(worker: &Worker, index: ResourceIndex) -> String {
    match worker.resource(index) {
        Some(rsc) => format!("{} {}", index, rsc.desc),
        None => index.to_string(),
    }
}

fn run(scenario: &Scenario, messages: u32, max_rounds: usize) -> anyhow::Result<CommandResult> {
    let fabric = LoopbackFabric::new();
    let alpha = scenario.worker(&fabric, "alpha")?;
    let beta = scenario.worker(&fabric, "beta")?;

    let received: Arc<Mutex<Vec<u32>>> = Default::default();
    let sink = Arc::clone(&received);
    beta.set_am_handler(
        AM_ID_DATA,
        Arc::new(move |data: &[u8]| {
            if let Ok(bytes) = <[u8; 4]>::try_from(data) {
                sink.lock().push(u32::from_le_bytes(bytes));
            }
        }),
    );

    let ep = alpha.create_ep(&beta.address()).context("creating endpoint")?;
    let aux_resource = ep.aux_resource_index(EpOp::Am).map(|index| describe(&alpha, index));
    let handles: Vec<_> = (0..messages)
        .map(|seq| ep.send_am(AM_ID_DATA, seq.to_le_bytes().to_vec()))
        .collect();
    info!(messages, ?aux_resource, "sent before wire-up");

    let mut rounds = 0;
    loop {
        let back = beta.ep_find(alpha.uuid());
        let wired = ep.is_wired_up() && back.as_ref().map_or(false, |b| b.is_wired_up());
        if wired && received.lock().len() >= handles.len() {
            break;
        }
        if rounds == max_rounds {
            bail!(
                "wire-up incomplete after {} rounds: {} of {} delivered",
                rounds,
                received.lock().len(),
                messages
            );
        }
        alpha.progress();
        beta.progress();
        ep.progress_wireup();
        if let Some(back) = back {
            back.progress_wireup();
        }
        rounds += 1;
    }
    for handle in &handles {
        if let Some(Err(err)) = handle.status() {
            bail!("send failed: {}", err);
        }
    }

    let delivered = received.lock().clone();
    alpha.close();
    beta.close();

    Ok(CommandResult::Run(RunReport {
        rounds,
        aux_resource,
        sent: messages,
        delivered: delivered.len(),
        in_order: delivered.iter().copied().eq(0..messages),
    }))
}

fn select(scenario: &Scenario) -> anyhow::Result<CommandResult> {
    let fabric = LoopbackFabric::new();
    let local = scenario.worker(&fabric, "alpha")?;
    let peer = scenario.worker(&fabric, "beta")?;

    let candidates = local
        .resources()
        .iter()
        .map(|rsc| {
            let scored = AuxScore.score(rsc.iface.attr());
            Candidate {
                resource: rsc.desc.to_string(),
                score: scored.ok(),
                lacks: scored.err().map(str::to_string),
            }
        })
        .collect();

    let peer_address = peer.address();
    let report = match select_transport(&local, peer.name(), &peer_address.entries, &AuxScore) {
        Ok(selection) => SelectReport {
            candidates,
            selected: Some(describe(&local, selection.rsc_index)),
            error: None,
        },
        Err(err) => SelectReport {
            candidates,
            selected: None,
            error: Some(err.to_string()),
        },
    };
    local.close();
    peer.close();
    Ok(CommandResult::Select(report))
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Run(report) => {
                writeln!(f, "wired up in {} rounds", report.rounds)?;
                writeln!(
                    f,
                    "auxiliary: {}",
                    report.aux_resource.as_deref().unwrap_or("none")
                )?;
                writeln!(
                    f,
                    "delivered {}/{} ({})",
                    report.delivered,
                    report.sent,
                    if report.in_order { "in order" } else { "out of order" }
                )
            }
            CommandResult::Select(report) => {
                for candidate in &report.candidates {
                    match (candidate.score, &candidate.lacks) {
                        (Some(score), _) => writeln!(f, "{:<24} {:.3e}", candidate.resource, score)?,
                        (None, Some(lacks)) => writeln!(f, "{:<24} no {}", candidate.resource, lacks)?,
                        (None, None) => writeln!(f, "{:<24} -", candidate.resource)?,
                    }
                }
                match (&report.selected, &report.error) {
                    (Some(selected), _) => writeln!(f, "selected {}", selected),
                    (None, Some(err)) => writeln!(f, "{}", err),
                    (None, None) => Ok(()),
                }
            }
        }
    }
}
