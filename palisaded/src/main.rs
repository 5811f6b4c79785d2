use clap::{App, Arg};
use palisade::logging;
use palisade::net::server::{Server, ServerConfig};
use std::process;

fn main() {
    let matches = App::new("Palisade Server")
        .version("0.1")
        .about("Runs the encrypted application server.")
        .arg(
            Arg::with_name("PORT")
                .help("Port to listen on (default 3993)")
                .index(1),
        )
        .arg(
            Arg::with_name("THREADS")
                .help("Worker thread count (default: hardware threads - 1, minimum 4)")
                .index(2),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Path to a TOML config file"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => ServerConfig::load(path),
        None => ServerConfig::default(),
    };

    if let Some(port) = matches.value_of("PORT") {
        config.port = port.parse().unwrap_or_else(|_| {
            eprintln!("Invalid port: {}", port);
            process::exit(2);
        });
    }

    if let Some(threads) = matches.value_of("THREADS") {
        config.threads = threads.parse().unwrap_or_else(|_| {
            eprintln!("Invalid thread count: {}", threads);
            process::exit(2);
        });
    }

    let log = logging::init();

    logging::info!(log, "starting palisade server"; "port" => config.port);

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "failed to construct server"; "error" => ?err);
            logging::shutdown();
            process::exit(1);
        }
    };

    let status = server.run();

    logging::shutdown();
    process::exit(if status == 0 { 0 } else { 1 });
}
