mod backends;
mod config;
mod conntrack;
mod directory;
mod env;
mod helpers;
mod info;
mod logging;
mod maglev;
mod options;
mod packet;
mod protocols;
mod services;
mod simulate;
mod stats;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand, ValueEnum};
use config::ConfigFile;
use directory::Directory;
use log::{info, LevelFilter};
use simulate::{SimOptions, Simulator};
use std::{net::IpAddr, sync::Arc, time::Instant};
use svclb_common::BackendState;

#[derive(Debug, Parser)]
struct Opt {
    /// Default log level, RUST_LOG filters take precedence
    #[clap(long)]
    log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ListWhat {
    Services,
    Backends,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parses and validates a config file
    Check {
        config: String,
        /// Writes the parsed config back in normalized form
        #[clap(long)]
        save: Option<String>,
    },
    /// Installs the config and lists the resulting tables
    List { config: String, what: ListWhat },
    /// Prints the backend distribution of a service Maglev table
    Maglev { config: String, service: String },
    /// Runs synthetic client flows through the datapath
    Simulate {
        config: String,
        /// Number of client flows per round
        #[clap(long, default_value_t = 256)]
        flows: usize,
        /// Packets per flow
        #[clap(long, default_value_t = 4)]
        packets: usize,
        /// Concurrent worker tasks
        #[clap(long, default_value_t = 4)]
        workers: usize,
        /// Every n-th flow goes through the connect time translation, 0 disables it
        #[clap(long, default_value_t = 4)]
        sock_every: usize,
        /// Interface the unreachable replies are sent on
        #[clap(long, default_value = "lo")]
        ifname: String,
        /// Runs the flows this many times, connections are kept between rounds
        #[clap(long, default_value_t = 1)]
        rounds: usize,
        /// Clears connections and counters between rounds
        #[clap(long)]
        fresh: bool,
        /// Moves the named backends to terminating before the first round
        #[clap(long)]
        drain: Vec<String>,
        /// Prints the connection tables after the last round
        #[clap(long)]
        show_ct: bool,
    },
}

fn load(path: &str) -> Result<config::Config, anyhow::Error> {
    ConfigFile::new(&path).load()
}

fn install(path: &str) -> Result<(config::Config, Directory, services::Catalog), anyhow::Error> {
    let cfg = load(path)?;
    let dir = Directory::default();
    let catalog = services::populate(&cfg, &dir)?;
    Ok((cfg, dir, catalog))
}

async fn simulate(
    path: &str,
    opts: SimOptions,
    rounds: usize,
    fresh: bool,
    drain: &[String],
    show_ct: bool,
) -> Result<(), anyhow::Error> {
    let cfg = load(path)?;
    let sim = Arc::new(Simulator::new(&cfg)?);
    for name in drain {
        sim.set_backend_state(name, BackendState::Terminating)?;
    }

    info!(
        "Unreachable replies go out on {}",
        helpers::if_name_or_default(opts.ifindex)
    );

    for round in 1..=rounds.max(1) {
        if round > 1 && fresh {
            sim.reset();
        }
        let started_at: DateTime<Local> = Local::now();
        let start = Instant::now();
        let report = sim.run(&opts).await?;
        info!("Round {} done in {:?}", round, start.elapsed());
        println!("\r\nround: {}", round);
        println!("started_at: {}", started_at.format("%H:%M:%S %d-%m-%Y"));
        report.print(sim.catalog());
        sim.stats().print_all(&format!("Datapath counters, round {}", round));
    }

    if show_ct {
        sim.list_conntrack();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    logging::init_log(opt.log_level);

    match opt.command {
        Command::Check { config, save } => {
            let cfg = load(&config)?;
            println!("{}", cfg.description());
            if let Some(out) = save {
                ConfigFile::new(&out).save(&cfg)?;
            }
        }
        Command::List { config, what } => {
            let (cfg, dir, catalog) = install(&config)?;
            match what {
                ListWhat::Services => services::list_services(&catalog, &cfg.lb_config()),
                ListWhat::Backends => services::list_backends(&catalog, &dir),
            }
        }
        Command::Maglev { config, service } => {
            let (cfg, dir, catalog) = install(&config)?;
            let svc = catalog
                .service(&service)
                .ok_or_else(|| anyhow!("No service named {}", service))?;
            let lb = cfg.lb_config();
            match svc.endpoint.ipaddr {
                IpAddr::V4(_) => services::print_maglev(&dir.v4, &catalog, svc, &lb)?,
                IpAddr::V6(_) => services::print_maglev(&dir.v6, &catalog, svc, &lb)?,
            }
        }
        Command::Simulate {
            config,
            flows,
            packets,
            workers,
            sock_every,
            ifname,
            rounds,
            fresh,
            drain,
            show_ct,
        } => {
            let ifindex = helpers::ifindex(&ifname)
                .context(format!("Can't resolve interface {}", ifname))?;
            let opts = SimOptions {
                flows,
                packets,
                workers,
                sock_every,
                ifindex,
            };
            simulate(&config, opts, rounds, fresh, &drain, show_ct).await?;
        }
    }

    Ok(())
}
