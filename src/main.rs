fn main() {
    if let Err(error) = worktime::run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}
