use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;

use paxos_decree::cluster::{self, Report};
use paxos_decree::config::SimulationConfig;
use paxos_decree::network::mailbox::{self, MailboxOptions};
use paxos_decree::paxos::RecordingLearner;

#[derive(Parser)]
#[command(about = "Run proposers and acceptors until they agree on one value")]
struct Args {
    /// path to a YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// seed for message scheduling and faults
    #[arg(long)]
    seed: Option<u64>,

    /// number of acceptors
    #[arg(long)]
    acceptors: Option<usize>,

    /// probability that a message is dropped
    #[arg(long = "drop")]
    drop_probability: Option<f64>,

    /// probability that a message is delivered twice
    #[arg(long = "duplicate")]
    duplicate_probability: Option<f64>,

    /// keep role state in files under this directory
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// run every role on its own thread instead of the seeded simulation
    #[arg(long)]
    threaded: bool,

    /// log protocol messages at debug level
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SimulationConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(n) = self.acceptors {
            config.acceptors = n;
        }
        if let Some(p) = self.drop_probability {
            config.drop_probability = p;
        }
        if let Some(p) = self.duplicate_probability {
            config.duplicate_probability = p;
        }
        if self.state_dir.is_some() {
            config.state_dir = self.state_dir;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let threaded = args.threaded;
    let config = args.into_config()?;
    info!(
        "Running {} proposer(s) against {} acceptors (seed {})",
        config.proposers.len(),
        config.acceptors,
        config.seed
    );

    if threaded {
        let learner = RecordingLearner::new();
        let decisions = mailbox::run_threaded(&config, MailboxOptions::default(), learner)?;
        for (id, value) in &decisions {
            println!("{}: decided '{}'", id, value);
        }
        return Ok(());
    }

    let report = match &config.state_dir {
        Some(dir) => cluster::on_disk(&config, dir)?.run(config.max_steps)?,
        None => cluster::in_memory(&config)?.run(config.max_steps)?,
    };
    print_report(&report);

    if !report.all_decided() {
        anyhow::bail!("not every proposer decided within {} steps", config.max_steps);
    }
    if report.agreed_value().is_none() {
        anyhow::bail!("proposers decided different values: {:?}", report.distinct_values());
    }
    Ok(())
}

fn print_report(report: &Report) {
    for (id, value) in &report.decisions {
        match value {
            Some(v) => println!("{}: decided '{}' in {} round(s)", id, v, report.rounds[id]),
            None => println!("{}: undecided after {} round(s)", id, report.rounds[id]),
        }
    }
    println!(
        "steps: {}, sent: {}, dropped: {}, duplicated: {}, delivered: {}",
        report.steps,
        report.network.sent,
        report.network.dropped,
        report.network.duplicated,
        report.network.delivered
    );
}
