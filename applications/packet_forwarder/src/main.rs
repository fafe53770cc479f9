fn main() {
    let args = std::env::args().skip(1).collect();
    std::process::exit(packet_forwarder::main(args) as i32);
}
