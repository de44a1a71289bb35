use std::process;

use gatewayd_lib::command::{Command, Response};
use gatewayd_lib::socket;

mod cli;

fn main() {
    let args = cli::parse();

    let cmd: Command = args.command.into();
    let raw = match socket::process_cmd(&args.socket_path, &cmd) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Error processing {cmd}: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    let response: Response = match serde_json::from_str(&raw) {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error parsing daemon response: {e}\n{raw}");
            process::exit(exitcode::PROTOCOL);
        }
    };

    let exit = print_response(&response);
    process::exit(exit);
}

fn print_response(response: &Response) -> exitcode::ExitCode {
    match response {
        Response::Status(status) => {
            if status.clients.is_empty() {
                println!("No clients connected.");
            }
            for client in &status.clients {
                println!(
                    "{ip} {mac} mark={mark} in={incoming} out={outgoing} gw={gw}",
                    ip = client.ip,
                    mac = client.mac,
                    mark = client.mark,
                    incoming = client.incoming,
                    outgoing = client.outgoing,
                    gw = client.to_gateway,
                );
            }
            exitcode::OK
        }
        Response::Stopping => {
            println!("Stopping gatewayd.");
            exitcode::OK
        }
        Response::Killed(ip) => {
            println!("Evicted {ip}.");
            exitcode::OK
        }
        Response::NotFound(ip) => {
            eprintln!("No client known at {ip}.");
            exitcode::UNAVAILABLE
        }
    }
}
