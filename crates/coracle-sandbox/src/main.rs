//! coracle-sandbox - isolated bundle-and-execute child process
//!
//! Reads one JSON request from stdin, runs the guest program against the
//! workspace carried in the request, and writes one JSON response to
//! stdout. Stderr carries diagnostics only.

use std::io::{self, Read, Write};

use coracle::{run_request, ExecRequest, ExecResponse};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        eprintln!("coracle-sandbox: failed to read stdin: {e}");
        std::process::exit(1);
    }

    let request: ExecRequest = match serde_json::from_str(&input) {
        Ok(request) => request,
        Err(e) => {
            let response = ExecResponse::failure(format!("malformed request: {e}"), "", 1);
            print_response(&response);
            std::process::exit(1);
        }
    };

    let response = run_request(&request);
    print_response(&response);
    std::process::exit(response.exit_code());
}

fn print_response(response: &ExecResponse) {
    let json = serde_json::to_string(response).expect("response serializes");
    let mut stdout = io::stdout();
    stdout.write_all(json.as_bytes()).ok();
    stdout.write_all(b"\n").ok();
    stdout.flush().ok();
}
