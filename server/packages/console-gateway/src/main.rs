fn main() {
    if let Err(err) = console_gateway::cli::run_console_gateway() {
        tracing::error!(error = %err, "console-gateway failed");
        std::process::exit(1);
    }
}
