//! FGP Sign-in Gateway - daily website sign-ins via CDP.

mod browser;
mod error;
mod interactive;
mod lifecycle;
mod models;
mod orchestrator;
mod service;
mod settings;
mod store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fgp_daemon::{cleanup_socket, FgpServer};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::models::{SelectorType, SiteConfig, DEFAULT_WAIT_SECS};
use crate::service::SignInService;
use crate::settings::{Settings, StatusPolicy};

const DEFAULT_SOCKET: &str = "~/.fgp/services/signin/daemon.sock";
const LOG_FILTER: &str = "signin_gateway=debug,fgp_daemon=debug,chromiumoxide=warn";

#[derive(Parser)]
#[command(name = "signin-gateway")]
#[command(about = "FGP daemon that signs in on your configured websites")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output JSON (for agent consumption)
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sign-in daemon
    Start {
        /// Socket path
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,

        /// Run in foreground
        #[arg(short, long)]
        foreground: bool,

        /// Run browser in headed mode (visible)
        #[arg(long)]
        headed: bool,

        /// How a batch writes statuses back
        #[arg(long, value_enum, default_value_t = StatusPolicy::Merge)]
        status_policy: StatusPolicy,

        /// Allow selectors that run arbitrary code in the page
        #[arg(long)]
        allow_expression_selectors: bool,

        /// Give up on a page after this many load polls during a batch
        #[arg(long)]
        max_load_attempts: Option<u32>,
    },

    /// Stop the sign-in daemon
    Stop {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },

    /// Check daemon status
    Status {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },

    /// Sign in on every configured site
    Run {
        /// Open pages in the foreground and highlight each click
        #[arg(long)]
        show: bool,
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },

    /// Sign in on one site
    Sign {
        /// Site id
        id: String,
        #[arg(long)]
        show: bool,
        /// Log every step
        #[arg(short, long)]
        verbose: bool,
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },

    /// Test a site's selectors without clicking
    ///
    /// Pass a saved site id, or --url and --selector to try a config
    /// before saving it.
    Test {
        /// Site id
        #[arg(required_unless_present = "url", conflicts_with = "url")]
        id: Option<String>,
        /// Display name of an unsaved config (defaults to its URL)
        #[arg(long)]
        name: Option<String>,
        /// Page to open
        #[arg(long, requires = "selector")]
        url: Option<String>,
        /// Sign-in element selector
        #[arg(long, requires = "url")]
        selector: Option<String>,
        #[arg(long, value_enum, default_value_t = SelectorType::Css)]
        selector_type: SelectorType,
        #[arg(long)]
        signed_selector: Option<String>,
        #[arg(long, value_enum, default_value_t = SelectorType::Css)]
        signed_selector_type: SelectorType,
        #[arg(long, default_value_t = DEFAULT_WAIT_SECS)]
        wait: u64,
        /// Report details of the located element
        #[arg(long)]
        details: bool,
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },

    /// Manage site configs
    Sites {
        #[command(subcommand)]
        action: SitesAction,
    },

    /// Show per-site sign-in status
    Statuses {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },

    /// Get or set the show-process preference
    ShowProcess {
        value: Option<Toggle>,
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
}

#[derive(Subcommand)]
enum SitesAction {
    /// List configured sites
    List {
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
    /// Add or update a site
    Add {
        /// Display name
        #[arg(long)]
        name: String,
        /// Page to open
        #[arg(long)]
        url: String,
        /// Sign-in element selector
        #[arg(long)]
        selector: String,
        #[arg(long, value_enum, default_value_t = SelectorType::Css)]
        selector_type: SelectorType,
        /// Element that proves the sign-in worked
        #[arg(long)]
        signed_selector: Option<String>,
        #[arg(long, value_enum, default_value_t = SelectorType::Css)]
        signed_selector_type: SelectorType,
        /// Seconds to wait after the page loads
        #[arg(long, default_value_t = DEFAULT_WAIT_SECS)]
        wait: u64,
        /// Seconds to keep the page open after success
        #[arg(long, default_value_t = 0)]
        close_wait: u64,
        /// Update the site with this id instead of adding one
        #[arg(long)]
        id: Option<String>,
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
    /// Remove a site
    Remove {
        id: String,
        #[arg(short, long, default_value = DEFAULT_SOCKET)]
        socket: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            socket,
            foreground,
            headed,
            status_policy,
            allow_expression_selectors,
            max_load_attempts,
        } => {
            let settings = Settings {
                status_policy,
                allow_expression_selectors,
                batch_max_load_attempts: max_load_attempts,
                ..Settings::default()
            };
            cmd_start(socket, foreground, !headed, settings)
        }
        Commands::Stop { socket } => cmd_stop(socket),
        Commands::Status { socket } => cmd_status(socket),
        Commands::Run { show, socket } => {
            // Without --show the daemon falls back to the stored preference.
            let params = if show {
                serde_json::json!({"show_process": true})
            } else {
                serde_json::json!({})
            };
            cmd_call_daemon(&socket, "signin.run_all", params, cli.json)
        }
        Commands::Sign {
            id,
            show,
            verbose,
            socket,
        } => {
            let mut params = serde_json::json!({"id": id, "verbose": verbose});
            if show {
                params["show_process"] = serde_json::Value::Bool(true);
            }
            cmd_call_daemon(&socket, "signin.site", params, cli.json)
        }
        Commands::Test {
            id,
            name,
            url,
            selector,
            selector_type,
            signed_selector,
            signed_selector_type,
            wait,
            details,
            socket,
        } => {
            let params = match (id, url, selector) {
                (Some(id), _, _) => serde_json::json!({"id": id, "need_details": details}),
                (None, Some(url), Some(selector)) => {
                    let config = SiteConfig {
                        id: String::new(),
                        name: name.unwrap_or_else(|| url.clone()),
                        url,
                        selector_type,
                        sign_selector: selector,
                        signed_selector_type,
                        signed_selector,
                        wait_time: wait,
                        close_wait_time: 0,
                    };
                    config.validate()?;
                    serde_json::json!({"config": config, "need_details": details})
                }
                _ => anyhow::bail!("Pass a site id, or both --url and --selector"),
            };
            cmd_call_daemon(&socket, "signin.test", params, cli.json)
        }
        Commands::Sites { action } => match action {
            SitesAction::List { socket } => {
                cmd_call_daemon(&socket, "signin.sites.list", serde_json::json!({}), cli.json)
            }
            SitesAction::Add {
                name,
                url,
                selector,
                selector_type,
                signed_selector,
                signed_selector_type,
                wait,
                close_wait,
                id,
                socket,
            } => {
                let config = SiteConfig {
                    id: id.unwrap_or_default(),
                    name,
                    url,
                    selector_type,
                    sign_selector: selector,
                    signed_selector_type,
                    signed_selector,
                    wait_time: wait,
                    close_wait_time: close_wait,
                };
                config.validate()?;
                cmd_call_daemon(
                    &socket,
                    "signin.sites.save",
                    serde_json::json!({"config": config}),
                    cli.json,
                )
            }
            SitesAction::Remove { id, socket } => cmd_call_daemon(
                &socket,
                "signin.sites.delete",
                serde_json::json!({"id": id}),
                cli.json,
            ),
        },
        Commands::Statuses { socket } => {
            cmd_call_daemon(&socket, "signin.status", serde_json::json!({}), cli.json)
        }
        Commands::ShowProcess { value, socket } => {
            let params = match value {
                Some(Toggle::On) => serde_json::json!({"value": true}),
                Some(Toggle::Off) => serde_json::json!({"value": false}),
                None => serde_json::json!({}),
            };
            cmd_call_daemon(&socket, "signin.show_process", params, cli.json)
        }
    }
}

fn serve(socket_path: &str, headless: bool, settings: Settings) -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(LOG_FILTER).init();

    let service =
        SignInService::new(headless, settings).context("Failed to create SignInService")?;
    let server = FgpServer::new(service, socket_path).context("Failed to create FGP server")?;
    server.serve().context("Server error")?;
    Ok(())
}

fn cmd_start(socket: String, foreground: bool, headless: bool, settings: Settings) -> Result<()> {
    let socket_path = shellexpand::tilde(&socket).to_string();

    // Create parent directory
    if let Some(parent) = Path::new(&socket_path).parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    let pid_file = format!("{}.pid", socket_path);

    println!("Starting signin-gateway daemon...");
    println!("Socket: {}", socket_path);
    println!("Mode: {}", if headless { "headless" } else { "headed" });
    println!("Status policy: {:?}", settings.status_policy);

    if foreground {
        serve(&socket_path, headless, settings)?;
    } else {
        use daemonize::Daemonize;

        let daemonize = Daemonize::new()
            .pid_file(&pid_file)
            .working_directory("/tmp");

        match daemonize.start() {
            Ok(_) => serve(&socket_path, headless, settings)?,
            Err(e) => {
                eprintln!("Failed to daemonize: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn cmd_stop(socket: String) -> Result<()> {
    let socket_path = shellexpand::tilde(&socket).to_string();
    let pid_file = format!("{}.pid", socket_path);

    let pid_str = std::fs::read_to_string(&pid_file)
        .context("Failed to read PID file - daemon may not be running")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    println!("Stopping signin-gateway daemon (PID: {})...", pid);

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    std::thread::sleep(std::time::Duration::from_millis(500));

    let _ = cleanup_socket(&socket_path, Some(Path::new(&pid_file)));
    let _ = std::fs::remove_file(&pid_file);

    println!("Daemon stopped.");
    Ok(())
}

fn cmd_status(socket: String) -> Result<()> {
    let socket_path = shellexpand::tilde(&socket).to_string();

    if !Path::new(&socket_path).exists() {
        println!("Status: NOT RUNNING");
        println!("Socket {} does not exist", socket_path);
        return Ok(());
    }

    match UnixStream::connect(&socket_path) {
        Ok(mut stream) => {
            let request = r#"{"id":"status","v":1,"method":"health","params":{}}"#;
            writeln!(stream, "{}", request)?;
            stream.flush()?;

            let mut reader = BufReader::new(stream);
            let mut response = String::new();
            reader.read_line(&mut response)?;

            println!("Status: RUNNING");
            println!("Socket: {}", socket_path);
            println!("Health: {}", response.trim());
        }
        Err(e) => {
            println!("Status: NOT RESPONDING");
            println!("Socket exists but connection failed: {}", e);
        }
    }

    Ok(())
}

fn cmd_call_daemon(socket: &str, method: &str, params: serde_json::Value, json_output: bool) -> Result<()> {
    let socket_path = shellexpand::tilde(socket).to_string();

    let mut stream = UnixStream::connect(&socket_path)
        .context("Failed to connect to daemon. Is it running? Try: signin-gateway start")?;

    let request = serde_json::json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "v": 1,
        "method": method,
        "params": params,
    });

    writeln!(stream, "{}", request)?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;

    if json_output {
        println!("{}", response.trim());
    } else {
        // Pretty print for humans
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&response) {
            if let Some(result) = parsed.get("result") {
                println!("{}", serde_json::to_string_pretty(result)?);
            } else if let Some(error) = parsed.get("error") {
                eprintln!("Error: {}", error);
                std::process::exit(1);
            } else {
                println!("{}", serde_json::to_string_pretty(&parsed)?);
            }
        } else {
            println!("{}", response.trim());
        }
    }

    Ok(())
}
