use log::error;
use mqtt_alarm_lib::{logging::init_logger, run};
use std::process::exit;

fn main() {
    if let Err(e) = init_logger() {
        eprintln!("Failed to initialize logger: {}", e);
    }
    if let Err(e) = run() {
        error!("Alarm stopped: {}", e);
        exit(1);
    }
}
