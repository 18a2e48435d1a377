//! Sign-in Gateway Quickstart Example
//!
//! Adds a site, tests its selector, then runs a sign-in batch.
//!
//! # Prerequisites
//! - Chrome/Chromium installed
//! - signin-gateway daemon running: `signin-gateway start`
//!
//! # Running
//! ```bash
//! cargo run --example quickstart
//! ```

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

const SOCKET_PATH: &str = "~/.fgp/services/signin/daemon.sock";

fn call(method: &str, params: serde_json::Value) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let socket_path = shellexpand::tilde(SOCKET_PATH).to_string();
    let mut stream = UnixStream::connect(&socket_path)?;

    let request = serde_json::json!({"id": "1", "v": 1, "method": method, "params": params});
    writeln!(stream, "{}", request)?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;

    Ok(serde_json::from_str(&response)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("FGP Sign-in Gateway Quickstart");
    println!("==============================\n");

    println!("1. Adding example.com...");
    let response = call(
        "signin.sites.save",
        serde_json::json!({
            "config": {
                "name": "Example",
                "url": "https://example.com",
                "selectorType": "pattern",
                "signSelector": "(?i)more information"
            }
        }),
    )?;
    let id = response["result"]["id"].as_str().unwrap_or_default().to_string();
    println!("   Saved as {}\n", id);

    println!("2. Testing the selector...");
    let response = call("signin.test", serde_json::json!({"id": id, "need_details": true}))?;
    println!("   {}\n", serde_json::to_string_pretty(&response["result"])?);

    println!("3. Signing in on every site...");
    let response = call("signin.run_all", serde_json::json!({}))?;
    println!("   {}\n", serde_json::to_string_pretty(&response["result"])?);

    println!("4. Today's statuses...");
    let response = call("signin.status", serde_json::json!({}))?;
    println!("   {}\n", serde_json::to_string_pretty(&response["result"])?);

    println!("Done! Remove the example with:");
    println!("  signin-gateway sites remove {}", id);

    Ok(())
}
