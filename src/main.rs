fn main() {
    if let Err(e) = serial_bridge::run() {
        eprintln!("serial-bridge: {}", e);
        std::process::exit(1);
    }
}
