// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Standalone FPM gateway daemon. Runs the gateway against an in-process
//! peer registry and a route sink that logs update and withdraw batches,
//! which makes it useful for soaking routing daemons against the protocol
//! stack. Cluster deployments embed the `fpm` crate instead and supply the
//! replicated registry and the real routing-table service.

use anyhow::anyhow;
use clap::Parser;
use fpm::config::GatewayConfig;
use fpm::connection_tcp::{FpmConnectionTcp, FpmListenerTcp};
use fpm::dispatcher::Dispatcher;
use fpm::gateway::{Gateway, MemRegistry, RouteSink};
use fpm::types::{NodeId, Route};
use slog::{info, Logger};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "fpmd", about = "FPM route gateway daemon")]
struct Args {
    /// Address to listen on for FPM sessions.
    #[arg(long, default_value_t = format!("[::]:{}", fpm::FPM_PORT))]
    listen: String,

    /// Keep a peer's routes installed when its session ends.
    #[arg(long)]
    no_clear_routes: bool,

    /// Seconds of silence after which a keepalive-capable peer is declared
    /// dead.
    #[arg(long, default_value_t = fpm::DEFAULT_IDLE_HOLD_TIME)]
    idle_hold_time: u64,

    /// Write bunyan-formatted logs to this file instead of the terminal.
    #[arg(long)]
    log_file: Option<String>,
}

struct LoggingSink {
    log: Logger,
}

impl RouteSink for LoggingSink {
    fn update(&self, routes: Vec<Route>) {
        for route in routes {
            info!(self.log, "update {route}");
        }
    }

    fn withdraw(&self, routes: Vec<Route>) {
        for route in routes {
            info!(self.log, "withdraw {route}");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log = match &args.log_file {
        Some(path) => gw_common::log::init_file_logger(path),
        None => gw_common::log::init_logger(),
    };

    let node = NodeId::new(
        hostname::get()?
            .into_string()
            .map_err(|_| anyhow!("hostname is not valid utf-8"))?,
    );

    let config = GatewayConfig {
        listen: args.listen,
        clear_routes: !args.no_clear_routes,
        idle_hold_time: args.idle_hold_time,
        ..Default::default()
    };
    info!(log, "starting fpm gateway on {} as {node}", config.listen);

    let gateway = Arc::new(Gateway::new(
        node,
        Arc::new(MemRegistry::new()),
        Arc::new(LoggingSink { log: log.clone() }),
        config.clear_routes,
        log.clone(),
    ));
    let dispatcher =
        Arc::new(Dispatcher::new(gateway, config, log.clone()));

    let d = dispatcher.clone();
    ctrlc::set_handler(move || d.shutdown())
        .expect("set termination handler");

    dispatcher.run::<FpmConnectionTcp, FpmListenerTcp>();
    info!(log, "fpm gateway stopped");
    Ok(())
}
