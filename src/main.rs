use std::{process::ExitCode, sync::Arc, time::Duration};

use socks_switch::{
    ConfigurationStore, DesiredState, Engine, Settings,
    desired_state::{StateStore, TomlStateStore},
    probe::HttpProbe,
    status::StatusSnapshot,
};

const USAGE: &str = "usage: socks-switch [status | on [PORT] [--dns|--no-dns] | off | port PORT | dns on|off]";

/// Slack on top of the probe timeout before the CLI stops waiting.
const PROBE_GRACE: Duration = Duration::from_secs(1);

const DEBOUNCE_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, PartialEq)]
enum Command {
    Status,
    On {
        port: Option<String>,
        dns: Option<bool>,
    },
    Off,
    Port(String),
    Dns(bool),
}

fn parse_command(arguments: &[String]) -> Result<Command, String> {
    let Some((verb, rest)) = arguments.split_first() else {
        return Ok(Command::Status);
    };

    match verb.as_str() {
        "status" if rest.is_empty() => Ok(Command::Status),
        "off" if rest.is_empty() => Ok(Command::Off),
        "on" => {
            let mut port = None;
            let mut dns = None;
            for argument in rest {
                match argument.as_str() {
                    "--dns" => dns = Some(true),
                    "--no-dns" => dns = Some(false),
                    value if port.is_none() && !value.starts_with("--") => {
                        port = Some(value.to_string());
                    }
                    other => return Err(format!("unexpected argument: {other}")),
                }
            }
            Ok(Command::On { port, dns })
        }
        "port" => match rest {
            [value] => Ok(Command::Port(value.clone())),
            _ => Err("port expects exactly one value".into()),
        },
        "dns" => match rest {
            [value] if value == "on" => Ok(Command::Dns(true)),
            [value] if value == "off" => Ok(Command::Dns(false)),
            _ => Err("dns expects on or off".into()),
        },
        other => Err(format!("unknown command: {other}")),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("socks_switch=info"),
    )
    .init();

    log::info!(
        "socks-switch v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| "<default: info>".into()),
    );

    let arguments: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_command(&arguments) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    let settings = Settings::load();
    log::debug!("[startup] settings: {settings:?}");

    let state_store = Arc::new(TomlStateStore::new(TomlStateStore::default_path()));
    let saved_dns = state_store
        .load(DesiredState::default())
        .await
        .map(|saved| saved.dns_through_proxy)
        .unwrap_or(false);

    let Some(store) = configuration_store(saved_dns) else {
        eprintln!("no proxy configuration backend is available on this platform");
        return ExitCode::FAILURE;
    };

    let engine = Engine::new(
        store,
        state_store,
        Arc::new(HttpProbe::new(settings.probe_timeout())),
        &settings,
    );
    let desired = engine.start().await;
    log::info!("[startup] desired state: {desired:?}");

    let changed = run_command(&engine, &settings, command).await;
    if changed {
        engine.wait_idle().await;
        if engine.desired().enabled {
            wait_for_probe(&engine, settings.probe_timeout() + PROBE_GRACE).await;
        }
    }

    let snapshot = engine.status();
    print_status(&engine.desired(), &snapshot);
    engine.shutdown();

    if snapshot.error.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(target_os = "linux")]
fn configuration_store(proxy_dns: bool) -> Option<Arc<dyn ConfigurationStore>> {
    use socks_switch::system::gsettings::GSettingsStore;

    if !GSettingsStore::is_available() {
        log::warn!("[startup] gsettings proxy schema not found; settings will not be controllable");
    }
    Some(Arc::new(GSettingsStore::new(proxy_dns)))
}

#[cfg(not(target_os = "linux"))]
fn configuration_store(_proxy_dns: bool) -> Option<Arc<dyn ConfigurationStore>> {
    None
}

/// Returns whether an apply may have been requested.
async fn run_command(engine: &Arc<Engine>, settings: &Settings, command: Command) -> bool {
    match command {
        Command::Status => false,
        Command::Off => {
            engine.set_enabled(false).await;
            true
        }
        Command::On { port, dns } => {
            if let Some(raw) = port
                && engine.set_port_input(&raw).await.is_err()
            {
                return false;
            }
            if let Some(dns) = dns {
                engine.set_dns(dns).await;
            }
            engine.set_enabled(true).await;
            true
        }
        Command::Port(raw) => {
            if engine.set_port_input(&raw).await.is_err() {
                return false;
            }
            // Outlast the debounce so its request reaches the queue.
            tokio::time::sleep(settings.port_debounce() + DEBOUNCE_GRACE).await;
            true
        }
        Command::Dns(dns) => {
            engine.set_dns(dns).await;
            true
        }
    }
}

async fn wait_for_probe(engine: &Engine, limit: Duration) {
    let mut receiver = engine.subscribe();
    let settled = tokio::time::timeout(
        limit,
        receiver.wait_for(|snapshot| snapshot.reachability.is_settled()),
    )
    .await;
    if settled.is_err() {
        log::warn!("[probe] gave up waiting after {limit:?}");
    }
}

fn print_status(desired: &DesiredState, snapshot: &StatusSnapshot) {
    println!(
        "desired:      {} port={} dns={}",
        if desired.enabled { "on" } else { "off" },
        desired.port,
        desired.dns_through_proxy,
    );
    println!("status:       {}", snapshot.text);
    println!("reachability: {}", snapshot.reachability.label());
    if let Some(error) = &snapshot.error {
        println!("error:        {}", error.message);
        if let Some(link) = &error.help_link {
            println!("help:         {link}");
        }
    }
}
