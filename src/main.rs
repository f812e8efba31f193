pub mod config;
pub mod error;
pub mod janus;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod peer;

use std::env;
use std::path::PathBuf;

mod util;

fn main() {
    let args: Vec<String> = env::args().collect();
    let config_path = args.get(2).map(PathBuf::from);

    if args.len() > 1 {
        match args[1].as_str() {
            "run" => {
                println!("Starting Janus relay...");
                match peer::main(config_path) {
                    Ok(_) => println!("Relay stopped"),
                    Err(e) => {
                        println!("Relay error:\n{}", e);
                        std::process::exit(1);
                    }
                }
            }
            "config" => match config::Config::load(config_path.as_deref()) {
                Ok(config) => match serde_json::to_string_pretty(&config) {
                    Ok(json) => println!("{json}"),
                    Err(e) => println!("Cannot print configuration: {}", e),
                },
                Err(e) => {
                    println!("Configuration error:\n{}", e);
                    std::process::exit(1);
                }
            },
            _ => {
                print_usage();
            }
        }
    } else {
        print_usage();
    }
}

fn print_usage() {
    println!("Janus Relay");
    println!("Usage:");
    println!("  janus-relay run [config.json]     - Publish, forward and watch the processed feed");
    println!("  janus-relay config [config.json]  - Print the effective configuration");
}
