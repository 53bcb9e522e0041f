//! dctide CLI
//!
//! Connect to a Direct Connect hub and serve the local share.
//!
//! Usage:
//!   dctide --hub dchub://host:411/ --nick me
//!   dctide --hub adc://host:412/ --nick me --filelist files.xml.bz2
//!   dctide --hub dchub://host/ --nick me --share music=/srv/music \
//!          --active-ip 1.2.3.4 --active-port 1412

use std::path::PathBuf;

use tracing::error;
use tracing_subscriber::EnvFilter;

use dctide::{Client, Config, HubConfig, Priority, UiEvent};

fn print_usage() {
    println!("dctide {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage:");
    println!("  dctide --hub <ADDR> --nick <NICK> [options]");
    println!();
    println!("Options:");
    println!("  --hub <ADDR>             Hub address (dchub:// or adc://), required");
    println!("  --nick <NICK>            Nick to use, required");
    println!("  --password <PASS>        Password for a registered nick");
    println!("  --encoding <LABEL>       Hub charset for the legacy protocol (default utf-8)");
    println!("  --description <TEXT>     Description to advertise");
    println!("  --email <TEXT>           E-mail to advertise");
    println!("  --connection <TEXT>      Connection type to advertise");
    println!("  --slots <N>              Upload slots (default 10)");
    println!("  --state-dir <DIR>        Database and file-list directory (default .)");
    println!("  --filelist <FILE>        Load a hashed file list as the local share");
    println!("  --share <NAME=DIR>       Map a shared virtual root onto a directory");
    println!("  --active-ip <IP>         Advertise this address for direct connections");
    println!("  --active-port <PORT>     Listen on this port for direct connections");
    println!("  --help, -h               Show this help");
}

fn parse_args() -> Result<(Config, Option<PathBuf>), String> {
    let mut hub_addr = None;
    let mut filelist = None;
    let mut config = Config::new("");
    config.state_dir = PathBuf::from(".");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "--hub" => hub_addr = Some(value("--hub")?),
            "--nick" => config.nick = value("--nick")?,
            "--password" => {
                let password = value("--password")?;
                config
                    .hubs
                    .entry("hub".into())
                    .or_insert_with(|| HubConfig::new(""))
                    .password = Some(password);
            }
            "--encoding" => {
                let encoding = value("--encoding")?;
                config
                    .hubs
                    .entry("hub".into())
                    .or_insert_with(|| HubConfig::new(""))
                    .encoding = Some(encoding);
            }
            "--description" => config.description = value("--description")?,
            "--email" => config.email = value("--email")?,
            "--connection" => config.connection = value("--connection")?,
            "--slots" => {
                config.slots = value("--slots")?
                    .parse()
                    .map_err(|_| "--slots needs a number".to_string())?;
            }
            "--state-dir" => config.state_dir = PathBuf::from(value("--state-dir")?),
            "--filelist" => filelist = Some(PathBuf::from(value("--filelist")?)),
            "--share" => {
                let spec = value("--share")?;
                let (name, dir) = spec
                    .split_once('=')
                    .ok_or_else(|| "--share needs NAME=DIR".to_string())?;
                config.shares.insert(name.to_string(), PathBuf::from(dir));
            }
            "--active-ip" => config.active_ip = Some(value("--active-ip")?),
            "--active-port" => {
                config.active_port = value("--active-port")?
                    .parse()
                    .map_err(|_| "--active-port needs a port number".to_string())?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown option {}", other)),
        }
    }

    let hub_addr = hub_addr.ok_or_else(|| "--hub is required".to_string())?;
    if config.nick.is_empty() {
        return Err("--nick is required".to_string());
    }
    config
        .hubs
        .entry("hub".into())
        .or_insert_with(|| HubConfig::new(""))
        .addr = hub_addr;

    // a random long-term identity unless one was stored earlier
    if config.cid.is_empty() {
        config.cid = random_b32();
        config.pid = random_b32();
    }
    Ok((config, filelist))
}

fn random_b32() -> String {
    use rand::Rng;
    let mut root = [0u8; 24];
    rand::thread_rng().fill(&mut root);
    dctide::tth::base32_encode(&root)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (config, filelist) = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    let (client, mut events) = match Client::start(config) {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "could not start");
            std::process::exit(1);
        }
    };
    if let Some(path) = filelist {
        if let Err(e) = client.load_share_list(&path) {
            error!(error = %e, path = %path.display(), "could not load file list");
        }
    }
    if let Err(e) = client.hub_open("hub") {
        error!(error = %e, "could not open hub");
        std::process::exit(1);
    }

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(UiEvent::Notice { hub, priority, text }) => {
                    let tag = match priority {
                        Priority::High => "!! ",
                        Priority::Medium => "! ",
                        Priority::Low => "",
                    };
                    match hub {
                        Some(hub) => println!("[{}] {}{}", hub, tag, text),
                        None => println!("{}{}", tag, text),
                    }
                }
                Some(UiEvent::Chat { hub, from, text, private }) => {
                    if private {
                        println!("[{}] PM <{}> {}", hub, from, text);
                    } else if from.is_empty() {
                        println!("[{}] {}", hub, text);
                    } else {
                        println!("[{}] <{}> {}", hub, from, text);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down.");
                break;
            }
        }
    }
    client.shutdown().await;
}
