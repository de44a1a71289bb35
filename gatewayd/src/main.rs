use ctrlc::Error as CtrlcError;
use notify::{RecursiveMode, Watcher};

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gatewayd_lib::auth_client::{AuthClient, ReqwestTransport};
use gatewayd_lib::client_table::ClientTable;
use gatewayd_lib::command::{ClientSummary, Command, Response, StatusResponse};
use gatewayd_lib::config::{self, Config};
use gatewayd_lib::firewall::iptables_backend::{IptablesBackend, RealIptablesOps};
use gatewayd_lib::firewall::FirewallBackend;
use gatewayd_lib::http_front::{HttpFront, ProcNetArpResolver};
use gatewayd_lib::scheduler::Scheduler;

mod cli;

fn ctrlc_channel() -> Result<crossbeam_channel::Receiver<()>, exitcode::ExitCode> {
    let (sender, receiver) = crossbeam_channel::bounded(2);
    match ctrlc::set_handler(move || {
        if let Err(e) = sender.send(()) {
            tracing::error!(error = ?e, "sending shutdown signal");
        }
    }) {
        Ok(_) => Ok(receiver),
        Err(CtrlcError::NoSuchSignal(signal_type)) => {
            tracing::error!(?signal_type, "no such signal");
            Err(exitcode::OSERR)
        }
        Err(CtrlcError::MultipleHandlers) => {
            tracing::error!("multiple handlers");
            Err(exitcode::UNAVAILABLE)
        }
        Err(CtrlcError::System(e)) => {
            tracing::error!(error = ?e, "system error");
            Err(exitcode::IOERR)
        }
    }
}

fn config_channel(
    param_config_path: &Path,
) -> Result<(notify::RecommendedWatcher, crossbeam_channel::Receiver<notify::Result<notify::Event>>), exitcode::ExitCode> {
    let config_path = match fs::canonicalize(param_config_path) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = ?e, "error canonicalizing config path");
            return Err(exitcode::NOINPUT);
        }
    };

    let parent = match config_path.parent() {
        Some(dir) => dir,
        None => {
            tracing::error!("config path has no parent");
            return Err(exitcode::UNAVAILABLE);
        }
    };

    let (sender, receiver) = crossbeam_channel::unbounded::<notify::Result<notify::Event>>();

    let mut watcher = match notify::recommended_watcher(sender) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = ?e, "error creating config watcher");
            return Err(exitcode::IOERR);
        }
    };

    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
        tracing::error!(error = ?e, "error watching config directory");
        return Err(exitcode::IOERR);
    }

    Ok((watcher, receiver))
}

fn socket_channel(socket_path: &Path) -> Result<crossbeam_channel::Receiver<net::UnixStream>, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::error!(path = %socket_path.display(), "control socket path already exists");
            return Err(exitcode::TEMPFAIL);
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking control socket path");
            return Err(exitcode::IOERR);
        }
    }

    let listener = match net::UnixListener::bind(socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = ?e, "error binding control socket");
            return Err(exitcode::OSFILE);
        }
    };

    if let Err(e) = fs::set_permissions(socket_path, fs::Permissions::from_mode(0o660)) {
        tracing::error!(error = ?e, "error setting control socket permissions");
        return Err(exitcode::NOPERM);
    }

    let (sender, receiver) = crossbeam_channel::unbounded::<net::UnixStream>();
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(s) => {
                    if let Err(e) = sender.send(s) {
                        tracing::error!(error = ?e, "forwarding incoming control connection");
                    }
                }
                Err(e) => tracing::error!(error = ?e, "accepting control connection"),
            }
        }
    });

    Ok(receiver)
}

/// Handles one control-socket connection, matching the wire protocol in `socket.rs`: the
/// client writes the JSON command then shuts down its write half, we write back a JSON
/// [`Response`].
fn handle_control_stream(
    stream: Result<net::UnixStream, crossbeam_channel::RecvError>,
    table: &ClientTable,
    firewall: &dyn FirewallBackend,
    shutdown: &mut bool,
) {
    let mut stream = match stream {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = ?e, "receiving control connection");
            return;
        }
    };

    let mut msg = String::new();
    if let Err(e) = stream.read_to_string(&mut msg) {
        tracing::error!(error = ?e, "reading control command");
        return;
    }

    let cmd = match msg.parse::<Command>() {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::error!(error = ?e, %msg, "parsing control command");
            return;
        }
    };

    tracing::debug!(command = ?cmd, "incoming control command");

    let response = match &cmd {
        Command::Status => {
            let clients = table.iter_snapshot().iter().map(ClientSummary::from).collect();
            Response::Status(StatusResponse { clients })
        }
        Command::Stop => {
            *shutdown = true;
            Response::Stopping
        }
        Command::Kill(ip) => match table.find_by_ip(ip) {
            Some(client) => {
                firewall.deny(&client.ip, &client.mac, client.mark);
                table.delete_by_ip(ip);
                Response::Killed(ip.clone())
            }
            None => Response::NotFound(ip.clone()),
        },
    };

    let encoded = match serde_json::to_string(&response) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = ?e, "serializing control response");
            return;
        }
    };

    if let Err(e) = stream.write_all(encoded.as_bytes()) {
        tracing::error!(error = %e, "writing control response");
    }
}

const CONFIG_GRACE_PERIOD: Duration = Duration::from_millis(333);

fn incoming_config_fs_event(
    res_event: Result<notify::Result<notify::Event>, crossbeam_channel::RecvError>,
    config_path: &Path,
) -> Option<crossbeam_channel::Receiver<Instant>> {
    let event = match res_event {
        Ok(evt) => evt,
        Err(e) => {
            tracing::error!(error = ?e, "receiving config watch event");
            return None;
        }
    };

    match event {
        Ok(notify::Event { kind, paths, .. })
            if (kind == notify::event::EventKind::Create(notify::event::CreateKind::File)
                || kind == notify::event::EventKind::Modify(notify::event::ModifyKind::Data(notify::event::DataChange::Any))
                || kind == notify::event::EventKind::Remove(notify::event::RemoveKind::File))
                && paths.iter().any(|p| p == config_path) =>
        {
            tracing::debug!(?kind, "config file change detected");
            Some(crossbeam_channel::after(CONFIG_GRACE_PERIOD))
        }
        Ok(_) => None,
        Err(e) => {
            tracing::error!(error = ?e, "watching config directory");
            None
        }
    }
}

/// Re-reads the configuration file and, if it parses, reinstalls the firewall scaffolding
/// and rulesets under it. `AuthClient`/`HttpFront`/`Scheduler` keep the `Config` they were
/// constructed with — only firewall state is live-reloadable without a restart, since
/// those components were handed an immutable `Arc<Config>` at startup.
fn reload_firewall_rules(config_path: &Path, firewall: &dyn FirewallBackend) {
    match config::read(config_path) {
        Ok(new_config) => match firewall.init(&new_config) {
            Ok(()) => tracing::info!("reloaded firewall rulesets from configuration"),
            Err(e) => tracing::error!(error = %e, "failed reinstalling firewall rules after config change"),
        },
        Err(e) => tracing::warn!(error = %e, "config file failed to parse, keeping current firewall rules"),
    }
}

/// Maps the crate's top-level error union onto process exit codes: config errors are a
/// usage/config problem, firewall errors are an OS-level failure, the remaining kinds are
/// only ever raised on per-tick/per-request paths that log and continue rather than abort.
fn exit_code_for(err: &gatewayd_lib::Error) -> exitcode::ExitCode {
    use gatewayd_lib::Error;
    match err {
        Error::ConfigInvalid(_) => exitcode::CONFIG,
        Error::FirewallFatal(_) => exitcode::OSERR,
        Error::NetworkFatal(_) => exitcode::UNAVAILABLE,
        Error::NetworkTransient(_) | Error::FirewallTransient(_) => exitcode::TEMPFAIL,
        Error::AuthVerdictDenied | Error::ClientNotFound | Error::ClientDuplicate => exitcode::SOFTWARE,
    }
}

fn daemon(args: &cli::Cli) -> exitcode::ExitCode {
    let config = match config::read(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            let err = gatewayd_lib::Error::from(e);
            tracing::error!(error = %err, "failed reading configuration");
            return exit_code_for(&err);
        }
    };
    let config = Arc::new(config);

    let table = Arc::new(ClientTable::new());
    let auth = Arc::new(AuthClient::<ReqwestTransport>::new(&config));

    let ops = match RealIptablesOps::new() {
        Ok(ops) => ops,
        Err(e) => {
            tracing::error!(error = %e, "failed initializing iptables backend");
            return exitcode::OSERR;
        }
    };
    let firewall: Arc<dyn FirewallBackend> = Arc::new(IptablesBackend::new(ops));
    if let Err(e) = firewall.init(&config) {
        let err = gatewayd_lib::Error::from(e);
        tracing::error!(error = %err, "failed installing firewall scaffolding");
        return exit_code_for(&err);
    }

    let front = Arc::new(HttpFront::new(
        config.clone(),
        table.clone(),
        auth.clone(),
        firewall.clone(),
        Arc::new(ProcNetArpResolver),
    ));
    let http_server = match tiny_http::Server::http((config.gateway_address.as_str(), config.gateway_port)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed binding embedded http server");
            firewall.destroy();
            return exitcode::OSERR;
        }
    };
    let (http_stop_tx, http_stop_rx) = crossbeam_channel::bounded(1);
    let http_thread = {
        let front = front.clone();
        thread::spawn(move || gatewayd_lib::http_front::serve(http_server, front, http_stop_rx))
    };

    let ctrlc_receiver = match ctrlc_channel() {
        Ok(r) => r,
        Err(exit) => {
            firewall.destroy();
            return exit;
        }
    };
    let (_config_watcher, config_receiver) = match config_channel(&args.config_path) {
        Ok(r) => r,
        Err(exit) => {
            firewall.destroy();
            return exit;
        }
    };
    let socket_receiver = match socket_channel(&args.socket_path) {
        Ok(r) => r,
        Err(exit) => {
            firewall.destroy();
            return exit;
        }
    };

    let scheduler = Scheduler::new(config.clone(), table.clone(), auth.clone(), firewall.clone());
    let tick_receiver = crossbeam_channel::tick(config.check_interval);

    let mut read_config_receiver: crossbeam_channel::Receiver<Instant> = crossbeam_channel::never();
    let mut shutdown = false;

    tracing::info!(gateway_id = %config.gateway_id, interface = %config.gateway_interface, "gatewayd listening");

    while !shutdown {
        crossbeam_channel::select! {
            recv(ctrlc_receiver) -> _ => {
                tracing::info!("received shutdown signal");
                shutdown = true;
            }
            recv(tick_receiver) -> _ => scheduler.tick(),
            recv(socket_receiver) -> stream => {
                handle_control_stream(stream, &table, firewall.as_ref(), &mut shutdown);
            }
            recv(config_receiver) -> event => {
                if let Some(r) = incoming_config_fs_event(event, &args.config_path) {
                    read_config_receiver = r;
                }
            }
            recv(read_config_receiver) -> _ => {
                reload_firewall_rules(&args.config_path, firewall.as_ref());
            }
        }
    }

    let _ = http_stop_tx.send(());
    if let Err(e) = http_thread.join() {
        tracing::error!(error = ?e, "joining http server thread");
    }

    firewall.destroy();

    if let Err(e) = fs::remove_file(&args.socket_path) {
        tracing::warn!(error = %e, "failed removing control socket");
    }

    exitcode::OK
}

fn main() {
    let args = cli::parse();

    tracing_subscriber::fmt::init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting {}", env!("CARGO_PKG_NAME"));

    let exit = daemon(&args);

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewayd_lib::client_table;
    use gatewayd_lib::config;
    use gatewayd_lib::firewall;

    #[test]
    fn config_errors_exit_with_the_usage_config_code() {
        let err = gatewayd_lib::Error::from(config::Error::MissingRequired("GatewayID"));
        assert_eq!(exit_code_for(&err), exitcode::CONFIG);
    }

    #[test]
    fn firewall_errors_exit_with_the_oserr_code() {
        let err = gatewayd_lib::Error::from(firewall::Error::Shell("no such chain".to_string()));
        assert_eq!(exit_code_for(&err), exitcode::OSERR);
    }

    #[test]
    fn client_table_errors_map_to_a_software_exit_code() {
        let err = gatewayd_lib::Error::from(client_table::Error::NotFound);
        assert_eq!(exit_code_for(&err), exitcode::SOFTWARE);
    }
}
