use std::env;
use std::process;

use webserv::config::Config;
use webserv::server::Server;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("./conf/config.conf");

    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("failed to load configuration from {}: {:#}", config_path, e);
            process::exit(1);
        }
    };

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to initialize server: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        log::error!("server error: {}", e);
        process::exit(1);
    }
}
