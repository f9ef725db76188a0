// Copyright 2021 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Connect to the compositor and list the globals it advertises.
//!
//! Pass `-v` for debug logging or `-vv` for trace logging. The protocol messages
//! show up at the trace level, or at the debug level with `WAYLAND_DEBUG=1`.

use std::{error::Error, process, time::Duration};

use log::LevelFilter;
use simple_logger::SimpleLogger;
use tokio::{runtime::Runtime, time};

use wayland_wire::{protocols::WlDisplay, registry::Registry, Connection, Endpoint};

fn main() {
    let level = match std::env::args().nth(1).as_deref() {
        Some("-v") => LevelFilter::Debug,
        Some("-vv") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if let Err(err) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Unable to set up logging: {}", err);
    }

    if let Err(err) = start() {
        eprintln!("{}", err);
        process::exit(1);
    }
}

fn start() -> Result<(), Box<dyn Error>> {
    // Taking WAYLAND_SOCKET edits the environment so do it before any other
    // threads exist.
    let endpoint = Endpoint::from_env()?;

    Runtime::new()?.block_on(run(endpoint))
}

async fn run(endpoint: Endpoint) -> Result<(), Box<dyn Error>> {
    let conn = Connection::connect_to(endpoint).await?;
    let dispatcher = conn.listen()?;

    let display = WlDisplay::new(&conn);
    let _ = display.on_error(|object, code, message| {
        log::error!("Compositor error on {} (code {}): {}", object, code, message);
    });
    let globals = Registry::track(&display.get_registry().await?);
    let serial = time::timeout(Duration::from_secs(5), display.roundtrip()).await??;
    log::debug!("Roundtrip done with serial {}", serial);

    for (name, global) in globals.snapshot() {
        println!("{:>4}  {:<40} v{}", name, global.interface, global.version);
    }

    conn.close();
    dispatcher.await??;
    Ok(())
}
