fn main() {
    let args = std::env::args().skip(1).collect();
    std::process::exit(packet_generator::main(args) as i32);
}
