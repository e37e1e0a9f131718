fn main() {
    std::process::exit(cpm_cli::main());
}
