fn main() {
    if let Err(err) = utreexo_node::run() {
        tracing::error!("{err}");
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}
