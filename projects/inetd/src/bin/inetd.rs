fn main() {
    std::process::exit(inetd::entrypoints::run_inetd());
}
